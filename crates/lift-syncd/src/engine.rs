use crate::error::{SyncError, SyncResult};
use crate::gateway::Gateway;
use crate::monitor::{Availability, AvailabilityMonitor, ConnectivityEvent, ProbeSettings};
use crate::records::RecordService;
use crate::session::{KeyringSessionStore, Session, SessionManager, SessionStore};
use crate::status::SyncStatus;
use crate::store::LocalStore;
use crate::sync::{SyncOptions, SyncOrchestrator, SyncOutcome};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
use anyhow::Context;
use async_trait::async_trait;
use lift_core::{Config, UserProfile};
use lift_proto::TokenPair;
use std::sync::Arc;

/// Keyring service name for session secrets
pub const KEYRING_SERVICE: &str = "lift";

/// Transport for a configuration without a backend
struct NoBackend;

#[async_trait]
impl Transport for NoBackend {
    async fn send(&self, _request: ApiRequest) -> SyncResult<ApiResponse> {
        Err(SyncError::NetworkUnavailable)
    }
}

/// Everything wired together: store, session, gateway, availability
/// monitor, orchestrator and the record service.
pub struct Engine {
    store: LocalStore,
    session: Arc<SessionManager>,
    gateway: Arc<Gateway>,
    monitor: Arc<AvailabilityMonitor>,
    orchestrator: Arc<SyncOrchestrator>,
    records: RecordService,
}

impl Engine {
    /// Open the on-disk store and keyring session named by `config`.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let db_path = config.database_path()?;
        let store = LocalStore::open(&db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        let transport: Arc<dyn Transport> = match &config.server.base_url {
            Some(url) => Arc::new(
                HttpTransport::new(url, config.server.api_timeout())
                    .context("Failed to set up HTTP client")?,
            ),
            None => Arc::new(NoBackend),
        };
        let session_store = Box::new(KeyringSessionStore::new(KEYRING_SERVICE));
        Ok(Self::new(config, store, session_store, transport)?)
    }

    /// Assemble an engine from parts. Must be called inside a tokio runtime.
    pub fn new(
        config: &Config,
        store: LocalStore,
        session_store: Box<dyn SessionStore>,
        transport: Arc<dyn Transport>,
    ) -> SyncResult<Self> {
        let session = Arc::new(SessionManager::load(session_store)?);
        let gateway = Arc::new(Gateway::new(transport, session.clone(), store.clone()));
        let monitor = Arc::new(AvailabilityMonitor::new(
            gateway.clone(),
            ProbeSettings {
                interval: config.sync.probe_interval(),
                timeout: config.sync.probe_timeout(),
            },
        ));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            gateway.clone(),
            monitor.watch(),
            SyncOptions {
                interval: config.sync.interval(),
                include_chat: config.sync.include_chat,
            },
        ));
        let records = RecordService::new(store.clone(), gateway.clone(), monitor.watch());
        Ok(Self {
            store,
            session,
            gateway,
            monitor,
            orchestrator,
            records,
        })
    }

    /// Start the monitor and, with a signed-in session, periodic auto-sync.
    pub fn start(&self) {
        self.monitor.start();
        if self.session.is_signed_in() {
            self.orchestrator.start(self.monitor.subscribe());
        }
    }

    /// App came to the foreground: sync now if the backend is ready.
    pub async fn foreground(&self) -> SyncOutcome {
        self.sync_now().await
    }

    pub fn connectivity_changed(&self, event: ConnectivityEvent) {
        self.monitor.connectivity_changed(event);
    }

    pub async fn sync_now(&self) -> SyncOutcome {
        self.orchestrator.sync_all().await
    }

    pub fn status(&self) -> SyncStatus {
        self.orchestrator.status()
    }

    pub fn availability(&self) -> Availability {
        self.monitor.state()
    }

    pub fn records(&self) -> &RecordService {
        &self.records
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn monitor(&self) -> &Arc<AvailabilityMonitor> {
        &self.monitor
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.is_signed_in()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.session.user()
    }

    /// Store a new session and start background work for it.
    pub fn login(&self, tokens: TokenPair, user: Option<UserProfile>) -> SyncResult<()> {
        self.session.set(Session::new(tokens, user))?;
        tracing::info!("signed in");
        self.start();
        Ok(())
    }

    /// Enter the offline demo account. Nothing touches the network.
    pub fn login_offline_demo(&self, user: UserProfile) -> SyncResult<()> {
        self.session.set(Session::offline_demo(user))?;
        tracing::info!("signed in to offline demo");
        self.monitor.start();
        Ok(())
    }

    /// Stop background work, keeping the session.
    pub fn shutdown(&self) {
        self.orchestrator.stop();
        self.monitor.stop();
    }

    /// Stop auto-sync and probing, then forget the session. Local data and
    /// the mutation queue stay for the next sign-in.
    pub fn logout(&self) -> SyncResult<()> {
        self.shutdown();
        self.session.clear()?;
        tracing::info!("signed out");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
