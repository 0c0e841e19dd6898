use lift_core::EntityKind;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the local SQLite store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} record '{id}' already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    #[error("{kind} record '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("failed to create database directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a sync or gateway operation can fail with
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no network connection")]
    NetworkUnavailable,

    #[error("backend is not responding yet")]
    BackendUnready,

    #[error("session expired, please sign in again")]
    AuthExpired,

    #[error("not allowed: {0}")]
    Forbidden(String),

    #[error("server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    ValidationRejected { status: u16, message: String },

    #[error("local storage failure: {0}")]
    LocalStorage(#[from] StoreError),

    #[error("secure session storage failure: {0}")]
    Session(String),

    #[error("unexpected response from backend: {0}")]
    Protocol(String),

    /// A mutating call failed but was appended to the mutation queue
    #[error("saved offline ({source})")]
    Queued {
        queue_id: i64,
        #[source]
        source: Box<SyncError>,
    },
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Map a non-success HTTP status to its error kind. 401 is handled by
    /// the gateway before it gets here.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 => SyncError::AuthExpired,
            403 => SyncError::Forbidden(message),
            500..=599 => SyncError::ServerError { status, message },
            _ => SyncError::ValidationRejected { status, message },
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SyncError::Queued { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            SyncError::ValidationRejected { status, .. } => *status == 404,
            SyncError::Queued { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Failures worth retrying later rather than reporting to the user.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::NetworkUnavailable
            | SyncError::BackendUnready
            | SyncError::ServerError { .. } => true,
            SyncError::Queued { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_taxonomy() {
        assert!(matches!(SyncError::from_status(403, "no".into()), SyncError::Forbidden(_)));
        assert!(matches!(
            SyncError::from_status(503, String::new()),
            SyncError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            SyncError::from_status(422, "bad".into()),
            SyncError::ValidationRejected { status: 422, .. }
        ));
        assert!(SyncError::from_status(404, String::new()).is_not_found());
    }

    #[test]
    fn queued_errors_expose_their_cause() {
        let err = SyncError::Queued {
            queue_id: 7,
            source: Box::new(SyncError::NetworkUnavailable),
        };
        assert!(err.is_queued());
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "saved offline (no network connection)");
    }
}
