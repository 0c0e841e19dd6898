pub mod config;
pub mod conflict;
pub mod models;

// Re-export commonly used types and functions
pub use config::Config;
pub use conflict::{merge_records, resolve, MergePlan, Resolution};
pub use models::{
    generate_local_id, is_local_id, EntityKind, ModelError, RecordView, Role, SyncRecord,
    UserProfile,
};
