use crate::error::{SyncError, SyncResult};
use crate::resource::Resource;
use crate::session::SessionManager;
use crate::store::{LocalStore, NewMutation};
use crate::transport::{ApiRequest, ApiResponse, Transport};
use chrono::{DateTime, Utc};
use lift_core::EntityKind;
use lift_proto::{Method, RemoteRecord, TokenPair, TokenRefreshRequest};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Authenticated access to the backend.
///
/// Every call carries the session's bearer token. A 401 triggers at most one
/// token refresh per call, shared by all callers that hit it at the same
/// time. Mutating calls made through [`Gateway::request`] or the typed
/// `create`/`update`/`delete` land in the mutation queue when the network or
/// the server fails, and come back as [`SyncError::Queued`].
pub struct Gateway {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    store: LocalStore,
    refresh_lock: Mutex<()>,
}

impl Gateway {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionManager>, store: LocalStore) -> Self {
        Self {
            transport,
            session,
            store,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    /// Send a call without any queueing. Used by background sync, which
    /// retries dirty records on the next cycle instead.
    pub async fn send(
        &self,
        method: Method,
        resource: &Resource,
        payload: Option<Value>,
    ) -> SyncResult<Value> {
        self.send_with(ApiRequest::new(method, resource.path()).body(payload))
            .await
    }

    /// Send a call; a mutating call that fails on the network or with a 5xx
    /// is queued for replay.
    pub async fn request(
        &self,
        method: Method,
        resource: &Resource,
        payload: Option<Value>,
    ) -> SyncResult<Value> {
        self.submit(NewMutation {
            method,
            resource: resource.clone(),
            payload,
            local_id: None,
        })
        .await
    }

    /// Like [`Gateway::request`], keeping the mutation's local id with the
    /// queue entry so a later replay can re-key the record.
    pub async fn submit(&self, mutation: NewMutation) -> SyncResult<Value> {
        let request = ApiRequest::new(mutation.method, mutation.resource.path())
            .body(mutation.payload.clone());
        match self.send_with(request).await {
            Ok(body) => Ok(body),
            Err(err) if mutation.method.is_mutating() && queueable(&err) && !self.session.is_offline_demo() => {
                let queue_id = self.store.enqueue(&mutation)?;
                tracing::info!(
                    "{} {} saved offline as #{queue_id}: {err}",
                    mutation.method.as_str(),
                    mutation.resource
                );
                Err(SyncError::Queued {
                    queue_id,
                    source: Box::new(err),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn list(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<RemoteRecord>> {
        let body = self
            .send_with(ApiRequest::new(Method::Get, kind.collection()).since(since))
            .await?;
        lift_proto::record_list(body).map_err(SyncError::Protocol)
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> SyncResult<RemoteRecord> {
        let body = self
            .send(Method::Get, &Resource::record(kind, id), None)
            .await?;
        let body = match body {
            Value::Object(mut object) if object.contains_key("data") => {
                object.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };
        RemoteRecord::from_value(body).map_err(SyncError::Protocol)
    }

    /// Create a record and return the id the backend assigned to it.
    pub async fn create(
        &self,
        kind: EntityKind,
        payload: Map<String, Value>,
        local_id: Option<&str>,
    ) -> SyncResult<String> {
        let body = self
            .submit(NewMutation {
                method: Method::Create,
                resource: Resource::collection(kind),
                payload: Some(Value::Object(payload)),
                local_id: local_id.map(str::to_string),
            })
            .await?;
        lift_proto::assigned_id(&body)
            .ok_or_else(|| SyncError::Protocol(format!("create of {kind} returned no id")))
    }

    pub async fn update(&self, kind: EntityKind, id: &str, patch: Map<String, Value>) -> SyncResult<()> {
        self.request(Method::Update, &Resource::record(kind, id), Some(Value::Object(patch)))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> SyncResult<()> {
        self.request(Method::Delete, &Resource::record(kind, id), None)
            .await
            .map(|_| ())
    }

    /// Unauthenticated liveness check. Returns the HTTP status.
    pub async fn health(&self, timeout: Duration) -> SyncResult<u16> {
        let response = self
            .transport
            .send(ApiRequest::new(Method::Get, "health").timeout(timeout))
            .await?;
        Ok(response.status)
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> SyncResult<TokenPair> {
        let body = serde_json::to_value(TokenRefreshRequest {
            refresh_token: refresh_token.to_string(),
        })
        .map_err(|e| SyncError::Protocol(e.to_string()))?;
        let response = self
            .transport
            .send(ApiRequest::new(Method::Create, "auth/refresh").body(Some(body)))
            .await?;
        if !response.is_success() {
            return Err(status_error(&response));
        }
        let body = match response.body {
            Value::Object(mut object) if object.contains_key("data") => {
                object.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(body).map_err(|e| SyncError::Protocol(format!("bad refresh response: {e}")))
    }

    async fn send_with(&self, request: ApiRequest) -> SyncResult<Value> {
        if self.session.is_offline_demo() {
            return Err(SyncError::NetworkUnavailable);
        }
        let token = self.session.access_token().ok_or(SyncError::AuthExpired)?;

        let response = self.transport.send(request.clone().bearer(token.clone())).await?;
        if response.status != 401 {
            return into_result(response);
        }

        let fresh = self.refresh_after_unauthorized(&token).await?;
        let retried = self.transport.send(request.bearer(fresh)).await?;
        if retried.status == 401 {
            tracing::warn!("request rejected again after token refresh, ending session");
            self.session.clear()?;
            return Err(SyncError::AuthExpired);
        }
        into_result(retried)
    }

    /// Refresh the access token after `rejected` got a 401. Concurrent
    /// callers wait on one refresh; whoever comes second finds the token
    /// already replaced and reuses it.
    async fn refresh_after_unauthorized(&self, rejected: &str) -> SyncResult<String> {
        let _guard = self.refresh_lock.lock().await;

        match self.session.access_token() {
            Some(current) if current != rejected => return Ok(current),
            Some(_) => {}
            None => return Err(SyncError::AuthExpired),
        }

        let Some(refresh) = self.session.refresh_token() else {
            tracing::info!("no refresh token, ending session");
            self.session.clear()?;
            return Err(SyncError::AuthExpired);
        };

        match self.refresh_token(&refresh).await {
            Ok(tokens) => {
                let access = tokens.access_token.clone();
                self.session.update_tokens(tokens)?;
                tracing::debug!("access token refreshed");
                Ok(access)
            }
            Err(err) if err.is_transient() => Err(err),
            Err(err) => {
                tracing::warn!("token refresh rejected, ending session: {err}");
                self.session.clear()?;
                Err(SyncError::AuthExpired)
            }
        }
    }
}

fn queueable(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::NetworkUnavailable | SyncError::BackendUnready | SyncError::ServerError { .. }
    )
}

fn into_result(response: ApiResponse) -> SyncResult<Value> {
    if response.is_success() {
        Ok(response.body)
    } else {
        Err(status_error(&response))
    }
}

fn status_error(response: &ApiResponse) -> SyncError {
    let message = lift_proto::error_message(&response.body)
        .unwrap_or_else(|| format!("HTTP {}", response.status));
    SyncError::from_status(response.status, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, Session};
    use serde_json::json;

    fn signed_in(access: &str, refresh: Option<&str>) -> Arc<SessionManager> {
        let session = Session::new(
            TokenPair {
                access_token: access.into(),
                refresh_token: refresh.map(str::to_string),
            },
            None,
        );
        Arc::new(
            SessionManager::load(Box::new(MemorySessionStore::with_session(&session))).unwrap(),
        )
    }

    async fn gateway_for(server: &mockito::Server, session: Arc<SessionManager>) -> (Gateway, LocalStore) {
        let store = LocalStore::open_in_memory().unwrap();
        let transport =
            crate::transport::HttpTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        (Gateway::new(Arc::new(transport), session, store.clone()), store)
    }

    #[tokio::test]
    async fn unauthorized_call_refreshes_once_and_retries() {
        let mut server = mockito::Server::new_async().await;
        let stale = server
            .mock("GET", "/elevators/e1")
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .match_body(mockito::Matcher::Json(json!({"refresh_token": "r1"})))
            .with_status(200)
            .with_body(r#"{"accessToken":"new"}"#)
            .expect(1)
            .create_async()
            .await;
        let fresh = server
            .mock("GET", "/elevators/e1")
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(r#"{"_id":"e1","address":"Pier 4"}"#)
            .create_async()
            .await;

        let session = signed_in("old", Some("r1"));
        let (gateway, _) = gateway_for(&server, session.clone()).await;
        let record = gateway.get(EntityKind::Elevator, "e1").await.unwrap();
        assert_eq!(record.id, "e1");
        assert_eq!(session.access_token().as_deref(), Some("new"));
        assert_eq!(session.refresh_token().as_deref(), Some("r1"));

        stale.assert_async().await;
        refresh.assert_async().await;
        fresh.assert_async().await;
    }

    #[tokio::test]
    async fn failed_refresh_clears_the_session() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/repairs/r1")
            .with_status(401)
            .create_async()
            .await;
        server
            .mock("POST", "/auth/refresh")
            .with_status(401)
            .with_body(r#"{"message":"refresh token revoked"}"#)
            .create_async()
            .await;

        let session = signed_in("old", Some("r1"));
        let (gateway, store) = gateway_for(&server, session.clone()).await;
        let err = gateway
            .update(EntityKind::RepairRecord, "r1", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));
        assert!(!session.is_signed_in());
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn unauthorized_after_refresh_ends_the_session() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("GET", "/elevators")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/auth/refresh")
            .with_status(200)
            .with_body(r#"{"accessToken":"new"}"#)
            .expect(1)
            .create_async()
            .await;

        let session = signed_in("old", Some("r1"));
        let (gateway, _) = gateway_for(&server, session.clone()).await;
        let err = gateway.list(EntityKind::Elevator, None).await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));
        assert!(!session.is_signed_in());

        // Signed out now: the next call fails fast without another refresh.
        let again = gateway.list(EntityKind::Elevator, None).await.unwrap_err();
        assert!(matches!(again, SyncError::AuthExpired));
        rejected.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn forbidden_is_surfaced_and_not_queued() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/users/u2")
            .with_status(403)
            .with_body(r#"{"message":"managers only"}"#)
            .expect(1)
            .create_async()
            .await;

        let (gateway, store) = gateway_for(&server, signed_in("t", None)).await;
        let err = gateway.delete(EntityKind::User, "u2").await.unwrap_err();
        match err {
            SyncError::Forbidden(message) => assert_eq!(message, "managers only"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn server_errors_on_mutations_are_queued() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/repairs")
            .with_status(502)
            .create_async()
            .await;
        server
            .mock("GET", "/repairs")
            .with_status(502)
            .create_async()
            .await;

        let (gateway, store) = gateway_for(&server, signed_in("t", None)).await;
        let mut payload = Map::new();
        payload.insert("description".into(), json!("cable wear"));
        let err = gateway
            .create(EntityKind::RepairRecord, payload, Some("local-1"))
            .await
            .unwrap_err();
        assert!(err.is_queued());

        let queued = store.list_queued().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].local_id.as_deref(), Some("local-1"));
        assert_eq!(queued[0].payload, Some(json!({"description": "cable wear"})));

        let read = gateway.list(EntityKind::RepairRecord, None).await.unwrap_err();
        assert!(matches!(read, SyncError::ServerError { status: 502, .. }));
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_demo_session_never_touches_the_network() {
        let server = mockito::Server::new_async().await;
        let user = lift_core::UserProfile {
            id: "demo".into(),
            name: "Demo".into(),
            email: None,
            role: lift_core::Role::Technician,
        };
        let session = Arc::new(
            SessionManager::load(Box::new(MemorySessionStore::with_session(&Session::offline_demo(user))))
                .unwrap(),
        );
        let (gateway, store) = gateway_for(&server, session).await;
        let err = gateway
            .update(EntityKind::Elevator, "e1", Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable));
        assert_eq!(store.queue_len().unwrap(), 0);
    }
}
