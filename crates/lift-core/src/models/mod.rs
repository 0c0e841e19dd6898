mod entity;
mod record;
mod user;
mod views;

pub use entity::EntityKind;
pub use record::{generate_local_id, is_local_id, now_millis, SyncRecord, LOCAL_ID_PREFIX};
pub use user::{Role, UserProfile};
pub use views::{Elevator, ModelError, RecordView, RepairRecord, ServiceRecord};
