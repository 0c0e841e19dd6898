#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lift_core::{Config, EntityKind, Role, UserProfile};
use lift_proto::{Method, TokenPair};
use lift_syncd::{
    ApiRequest, ApiResponse, Engine, LocalStore, MemorySessionStore, Session, SyncError,
    SyncResult, Transport,
};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Default)]
struct BackendState {
    collections: HashMap<String, BTreeMap<String, (DateTime<Utc>, Map<String, Value>)>>,
    calls: Vec<String>,
    next_id: u64,
    health_failures: usize,
    unreachable: bool,
    valid_token: Option<String>,
    refreshes: usize,
    reject_with: Option<u16>,
}

/// In-memory backend speaking the same routes as the HTTP transport.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    /// Fail the next `n` health probes with 503
    pub fn fail_health(&self, n: usize) {
        self.state().health_failures = n;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Only accept this bearer token; anything else gets 401.
    pub fn require_token(&self, token: &str) {
        self.state().valid_token = Some(token.to_string());
    }

    /// Answer every mutating call with this status
    pub fn reject_mutations(&self, status: Option<u16>) {
        self.state().reject_with = status;
    }

    pub fn refreshes(&self) -> usize {
        self.state().refreshes
    }

    pub fn seed(&self, kind: EntityKind, id: &str, updated_at: DateTime<Utc>, fields: Value) {
        let fields = fields.as_object().cloned().unwrap_or_default();
        self.state()
            .collections
            .entry(kind.collection().to_string())
            .or_default()
            .insert(id.to_string(), (updated_at, fields));
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Map<String, Value>> {
        self.state()
            .collections
            .get(kind.collection())
            .and_then(|c| c.get(id))
            .map(|(_, fields)| fields.clone())
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.state()
            .collections
            .get(kind.collection())
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Every call so far, as `"<METHOD> <path>"`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    fn handle(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let mut state = self.state();
        let verb = match request.method {
            Method::Get => "GET",
            Method::Create => "POST",
            Method::Update => "PUT",
            Method::Delete => "DELETE",
        };
        state.calls.push(format!("{verb} {}", request.path));

        if state.unreachable {
            return Err(SyncError::NetworkUnavailable);
        }
        if request.path == "health" {
            if state.health_failures > 0 {
                state.health_failures -= 1;
                return Ok(ApiResponse::new(503, json!("cold start")));
            }
            return Ok(ApiResponse::new(200, json!({"ok": true})));
        }
        if request.path == "auth/refresh" {
            state.refreshes += 1;
            let token = format!("fresh-{}", state.refreshes);
            state.valid_token = Some(token.clone());
            return Ok(ApiResponse::new(200, json!({"accessToken": token})));
        }
        if let Some(valid) = &state.valid_token {
            if request.bearer.as_ref() != Some(valid) {
                return Ok(ApiResponse::new(401, json!({"message": "token expired"})));
            }
        }
        if request.method.is_mutating() {
            if let Some(status) = state.reject_with {
                return Ok(ApiResponse::new(status, json!({"message": "rejected"})));
            }
        }

        let (collection, id) = match request.path.split_once('/') {
            Some((c, id)) => (c.to_string(), Some(id.to_string())),
            None => (request.path.clone(), None),
        };
        let now = Utc::now();
        let body = request
            .body
            .and_then(|b| b.as_object().cloned())
            .unwrap_or_default();

        match (request.method, id) {
            (Method::Get, None) => {
                let items: Vec<Value> = state
                    .collections
                    .get(&collection)
                    .map(|c| {
                        c.iter()
                            .filter(|(_, (at, _))| request.since.map_or(true, |since| *at > since))
                            .map(|(id, (at, fields))| to_remote(id, *at, fields))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(ApiResponse::new(200, json!({ "data": items })))
            }
            (Method::Get, Some(id)) => match state.collections.get(&collection).and_then(|c| c.get(&id)) {
                Some((at, fields)) => Ok(ApiResponse::new(200, to_remote(&id, *at, fields))),
                None => Ok(ApiResponse::new(404, json!({"message": "not found"}))),
            },
            (Method::Create, _) => {
                state.next_id += 1;
                let id = format!("srv-{}", state.next_id);
                state
                    .collections
                    .entry(collection)
                    .or_default()
                    .insert(id.clone(), (now, body));
                Ok(ApiResponse::new(201, json!({ "_id": id })))
            }
            (Method::Update, Some(id)) => {
                match state.collections.get_mut(&collection).and_then(|c| c.get_mut(&id)) {
                    Some((at, fields)) => {
                        for (k, v) in body {
                            fields.insert(k, v);
                        }
                        *at = now;
                        Ok(ApiResponse::new(200, json!({"ok": true})))
                    }
                    None => Ok(ApiResponse::new(404, json!({"message": "not found"}))),
                }
            }
            (Method::Delete, Some(id)) => {
                let removed = state
                    .collections
                    .get_mut(&collection)
                    .and_then(|c| c.remove(&id));
                match removed {
                    Some(_) => Ok(ApiResponse::new(204, Value::Null)),
                    None => Ok(ApiResponse::new(404, json!({"message": "not found"}))),
                }
            }
            _ => Ok(ApiResponse::new(400, json!({"message": "bad route"}))),
        }
    }
}

fn to_remote(id: &str, at: DateTime<Utc>, fields: &Map<String, Value>) -> Value {
    let mut object = fields.clone();
    object.insert("_id".into(), json!(id));
    object.insert("updatedAt".into(), json!(at.to_rfc3339()));
    Value::Object(object)
}

#[async_trait]
impl Transport for FakeBackend {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        tokio::task::yield_now().await;
        self.handle(request)
    }
}

/// Passes calls through to a backend, but holds the response to the first
/// create until released. The backend has already stored the record.
#[derive(Clone)]
pub struct HeldCreate {
    backend: FakeBackend,
    arrived: Arc<Notify>,
    released: Arc<Notify>,
    holding: Arc<AtomicBool>,
}

impl HeldCreate {
    pub fn new(backend: &FakeBackend) -> Self {
        Self {
            backend: backend.clone(),
            arrived: Arc::new(Notify::new()),
            released: Arc::new(Notify::new()),
            holding: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait until the first create reached the backend.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[async_trait]
impl Transport for HeldCreate {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let is_create = request.method == Method::Create;
        let response = self.backend.send(request).await;
        if is_create && !self.holding.swap(true, Ordering::SeqCst) {
            self.arrived.notify_one();
            self.released.notified().await;
        }
        response
    }
}

pub fn user(role: Role) -> UserProfile {
    UserProfile {
        id: "u1".into(),
        name: "Field Tech".into(),
        email: Some("tech@example.test".into()),
        role,
    }
}

pub fn session(token: &str, role: Role) -> Session {
    Session::new(
        TokenPair {
            access_token: token.into(),
            refresh_token: Some("refresh-1".into()),
        },
        Some(user(role)),
    )
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.server.base_url = Some("http://backend.test".into());
    config.sync.interval_seconds = 3600;
    config.sync.probe_interval_secs = 5;
    config.sync.probe_timeout_secs = 3;
    config.sync.include_chat = false;
    config
}

pub fn engine_with(backend: &FakeBackend, store: LocalStore, session: Option<Session>) -> Engine {
    engine_with_config(&test_config(), backend, store, session)
}

pub fn engine_with_config(
    config: &Config,
    backend: &FakeBackend,
    store: LocalStore,
    session: Option<Session>,
) -> Engine {
    let sessions = match &session {
        Some(session) => MemorySessionStore::with_session(session),
        None => MemorySessionStore::new(),
    };
    Engine::new(config, store, Box::new(sessions), Arc::new(backend.clone())).unwrap()
}

pub fn engine_with_transport(
    transport: Arc<dyn Transport>,
    store: LocalStore,
    session: Option<Session>,
) -> Engine {
    let sessions = match &session {
        Some(session) => MemorySessionStore::with_session(session),
        None => MemorySessionStore::new(),
    };
    Engine::new(&test_config(), store, Box::new(sessions), transport).unwrap()
}

/// Bring the engine's monitor to `OnlineReady` against a healthy backend.
pub async fn go_online(engine: &Engine) {
    engine.monitor().start();
    engine.connectivity_changed(lift_syncd::ConnectivityEvent::Up);
    let mut state = engine.monitor().watch();
    while *state.borrow_and_update() != lift_syncd::Availability::OnlineReady {
        state.changed().await.unwrap();
    }
}

pub fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}
