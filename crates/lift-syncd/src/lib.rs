//! Offline-first sync engine: a SQLite cache of server records, a durable
//! queue of writes made while the backend was out of reach, and the
//! machinery that reconciles both with the backend once it answers again.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod link;
pub mod monitor;
pub mod records;
pub mod resource;
pub mod session;
pub mod status;
pub mod store;
pub mod sync;
pub mod transport;

pub use engine::Engine;
pub use error::{StoreError, SyncError, SyncResult};
pub use gateway::Gateway;
pub use monitor::{Availability, AvailabilityMonitor, ConnectivityEvent, HealthCheck, MonitorEvent};
pub use records::{RecordService, WriteOutcome};
pub use resource::Resource;
pub use session::{KeyringSessionStore, MemorySessionStore, Session, SessionManager, SessionStore};
pub use status::SyncStatus;
pub use store::{LocalStore, NewMutation, QueuedMutation, RecordFilter, Upserted};
pub use sync::{SkipReason, SyncOptions, SyncOrchestrator, SyncOutcome, SyncReport};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
