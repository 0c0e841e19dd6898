use crate::error::{SyncError, SyncResult};
use keyring::Entry;
use lift_core::{Role, UserProfile};
use lift_proto::TokenPair;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Prefix of tokens issued for the offline demo account. Such a session
/// never talks to the network.
pub const OFFLINE_TOKEN_PREFIX: &str = "offline:";

const ACCESS_TOKEN_KEY: &str = "access_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const USER_PROFILE_KEY: &str = "user_profile";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub user: Option<UserProfile>,
}

impl Session {
    pub fn new(tokens: TokenPair, user: Option<UserProfile>) -> Self {
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            user,
        }
    }

    /// A session for the offline demo account
    pub fn offline_demo(user: UserProfile) -> Self {
        Self {
            access_token: format!("{OFFLINE_TOKEN_PREFIX}{}", user.id),
            refresh_token: None,
            user: Some(user),
        }
    }

    pub fn is_offline_demo(&self) -> bool {
        self.access_token.starts_with(OFFLINE_TOKEN_PREFIX)
    }
}

/// Where session secrets persist between runs
pub trait SessionStore: Send + Sync {
    fn load(&self) -> SyncResult<Option<Session>>;
    fn save(&self, session: &Session) -> SyncResult<()>;
    fn clear(&self) -> SyncResult<()>;
}

/// Session secrets in the OS keychain, one entry per key under `service`
pub struct KeyringSessionStore {
    service: String,
}

impl KeyringSessionStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> SyncResult<Entry> {
        Entry::new(&self.service, key)
            .map_err(|e| SyncError::Session(format!("failed to open keyring entry {key}: {e}")))
    }

    fn read(&self, key: &str) -> SyncResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SyncError::Session(format!("failed to read {key}: {e}"))),
        }
    }

    fn write(&self, key: &str, value: &str) -> SyncResult<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| SyncError::Session(format!("failed to store {key}: {e}")))
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SyncError::Session(format!("failed to delete {key}: {e}"))),
        }
    }
}

impl SessionStore for KeyringSessionStore {
    fn load(&self) -> SyncResult<Option<Session>> {
        let Some(access_token) = self.read(ACCESS_TOKEN_KEY)? else {
            return Ok(None);
        };
        let refresh_token = self.read(REFRESH_TOKEN_KEY)?;
        let user = match self.read(USER_PROFILE_KEY)? {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    tracing::warn!("ignoring unreadable stored user profile: {e}");
                    None
                }
            },
            None => None,
        };
        Ok(Some(Session {
            access_token,
            refresh_token,
            user,
        }))
    }

    fn save(&self, session: &Session) -> SyncResult<()> {
        self.write(ACCESS_TOKEN_KEY, &session.access_token)?;
        match &session.refresh_token {
            Some(token) => self.write(REFRESH_TOKEN_KEY, token)?,
            None => self.remove(REFRESH_TOKEN_KEY)?,
        }
        match &session.user {
            Some(user) => {
                let raw = serde_json::to_string(user)
                    .map_err(|e| SyncError::Session(format!("failed to encode user profile: {e}")))?;
                self.write(USER_PROFILE_KEY, &raw)?;
            }
            None => self.remove(USER_PROFILE_KEY)?,
        }
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        for key in [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_PROFILE_KEY] {
            self.remove(key)?;
        }
        Ok(())
    }
}

/// Process-local session storage, for tests and throwaway runs
#[derive(Default)]
pub struct MemorySessionStore {
    values: Mutex<HashMap<&'static str, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: &Session) -> Self {
        let store = Self::new();
        // Writing to a fresh map cannot fail.
        let _ = store.save(session);
        store
    }

    fn values(&self) -> SyncResult<std::sync::MutexGuard<'_, HashMap<&'static str, String>>> {
        self.values
            .lock()
            .map_err(|_| SyncError::Session("session store lock poisoned".to_string()))
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> SyncResult<Option<Session>> {
        let values = self.values()?;
        let Some(access_token) = values.get(ACCESS_TOKEN_KEY).cloned() else {
            return Ok(None);
        };
        Ok(Some(Session {
            access_token,
            refresh_token: values.get(REFRESH_TOKEN_KEY).cloned(),
            user: values
                .get(USER_PROFILE_KEY)
                .and_then(|raw| serde_json::from_str(raw).ok()),
        }))
    }

    fn save(&self, session: &Session) -> SyncResult<()> {
        let mut values = self.values()?;
        values.insert(ACCESS_TOKEN_KEY, session.access_token.clone());
        match &session.refresh_token {
            Some(token) => values.insert(REFRESH_TOKEN_KEY, token.clone()),
            None => values.remove(REFRESH_TOKEN_KEY),
        };
        match session.user.as_ref().and_then(|u| serde_json::to_string(u).ok()) {
            Some(raw) => values.insert(USER_PROFILE_KEY, raw),
            None => values.remove(USER_PROFILE_KEY),
        };
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        self.values()?.clear();
        Ok(())
    }
}

/// The live session: an in-memory copy of what the [`SessionStore`] holds,
/// kept in step with it on every change.
pub struct SessionManager {
    store: Box<dyn SessionStore>,
    current: RwLock<Option<Session>>,
}

impl SessionManager {
    /// Load whatever session the store already holds.
    pub fn load(store: Box<dyn SessionStore>) -> SyncResult<Self> {
        let current = store.load()?;
        if current.is_some() {
            tracing::debug!("restored stored session");
        }
        Ok(Self {
            store,
            current: RwLock::new(current),
        })
    }

    pub fn current(&self) -> Option<Session> {
        self.current.read().ok().and_then(|s| s.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.current().map(|s| s.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current().and_then(|s| s.refresh_token)
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.current().and_then(|s| s.user)
    }

    pub fn role(&self) -> Role {
        self.user().map(|u| u.role).unwrap_or(Role::Unknown)
    }

    pub fn is_signed_in(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_offline_demo(&self) -> bool {
        self.current().map(|s| s.is_offline_demo()).unwrap_or(false)
    }

    pub fn set(&self, session: Session) -> SyncResult<()> {
        self.store.save(&session)?;
        self.replace(Some(session))
    }

    /// Swap in refreshed tokens, keeping the old refresh token unless the
    /// backend rotated it.
    pub fn update_tokens(&self, tokens: TokenPair) -> SyncResult<()> {
        let mut session = self.current().ok_or(SyncError::AuthExpired)?;
        session.access_token = tokens.access_token;
        if let Some(refresh) = tokens.refresh_token {
            session.refresh_token = Some(refresh);
        }
        self.set(session)
    }

    pub fn clear(&self) -> SyncResult<()> {
        self.replace(None)?;
        self.store.clear()
    }

    fn replace(&self, session: Option<Session>) -> SyncResult<()> {
        let mut guard = self
            .current
            .write()
            .map_err(|_| SyncError::Session("session lock poisoned".to_string()))?;
        *guard = session;
        Ok(())
    }
}
