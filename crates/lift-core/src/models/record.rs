use super::EntityKind;
use chrono::{DateTime, Utc};
use lift_proto::{normalize_reference, RemoteRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of ids minted on the device before the server assigns one.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Fields the server owns; never sent back in an update.
const SERVER_OWNED_FIELDS: [&str; 7] = [
    "id",
    "_id",
    "created_at",
    "createdAt",
    "updated_at",
    "updatedAt",
    "synced",
];

pub fn generate_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Current time truncated to the millisecond precision the store keeps.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// A locally cached record of any entity kind.
///
/// The owning reference (if the kind has one) lives in `parent_id` and is
/// kept out of `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub kind: EntityKind,
    pub id: String,
    pub parent_id: Option<String>,
    pub fields: Map<String, Value>,
    /// `false` while the record has edits the server has not confirmed
    pub synced: bool,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    /// New dirty record with a local-only id. The parent reference is read
    /// from the kind's parent field, in either of its remote shapes.
    pub fn new_local(kind: EntityKind, mut fields: Map<String, Value>) -> Self {
        let parent_id = take_parent(kind, &mut fields);
        strip_server_owned(&mut fields);
        Self {
            kind,
            id: generate_local_id(),
            parent_id,
            fields,
            synced: false,
            updated_at: now_millis(),
        }
    }

    /// Snapshot of a server record; always synced.
    pub fn from_remote(kind: EntityKind, remote: RemoteRecord) -> Self {
        let RemoteRecord {
            id,
            updated_at,
            mut fields,
        } = remote;
        let parent_id = take_parent(kind, &mut fields);
        strip_server_owned(&mut fields);
        Self {
            kind,
            id,
            parent_id,
            fields,
            synced: true,
            updated_at,
        }
    }

    pub fn is_local(&self) -> bool {
        is_local_id(&self.id)
    }

    /// Body of a create call: all attributes plus the owning reference.
    pub fn create_payload(&self) -> Map<String, Value> {
        let mut payload = self.fields.clone();
        if let (Some(field), Some(parent)) = (self.kind.parent_field(), &self.parent_id) {
            payload.insert(field.to_string(), Value::String(parent.clone()));
        }
        payload
    }

    /// Body of an update call: only the attributes the client owns. The
    /// owning reference is immutable after creation and is never resent.
    pub fn client_patch(&self) -> Map<String, Value> {
        let mut patch = self.fields.clone();
        strip_server_owned(&mut patch);
        if let Some(field) = self.kind.parent_field() {
            patch.remove(field);
        }
        patch
    }

    /// Merge attributes into this record. Parent and server-owned fields in
    /// the patch are ignored.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
        let parent_field = self.kind.parent_field();
        for (key, value) in patch {
            if SERVER_OWNED_FIELDS.contains(&key.as_str()) || Some(key.as_str()) == parent_field {
                continue;
            }
            self.fields.insert(key.clone(), value.clone());
        }
    }

    /// Same identity and content, ignoring nothing.
    pub fn same_content(&self, other: &SyncRecord) -> bool {
        self.id == other.id
            && self.parent_id == other.parent_id
            && self.fields == other.fields
            && self.updated_at == other.updated_at
            && self.synced == other.synced
    }
}

fn take_parent(kind: EntityKind, fields: &mut Map<String, Value>) -> Option<String> {
    let field = kind.parent_field()?;
    fields.remove(field).as_ref().and_then(normalize_reference)
}

fn strip_server_owned(fields: &mut Map<String, Value>) {
    for key in SERVER_OWNED_FIELDS {
        fields.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn new_local_records_are_dirty_and_locally_keyed() {
        let record = SyncRecord::new_local(
            EntityKind::RepairRecord,
            object(json!({"elevator": "e1", "description": "door sensor"})),
        );
        assert!(record.is_local());
        assert!(!record.synced);
        assert_eq!(record.parent_id.as_deref(), Some("e1"));
        assert!(!record.fields.contains_key("elevator"));
    }

    #[test]
    fn from_remote_flattens_embedded_parent() {
        let remote = RemoteRecord::from_value(json!({
            "_id": "s1",
            "updatedAt": "2024-05-01T08:00:00Z",
            "elevator": {"_id": "e9", "address": "Harbour 2"},
            "notes": "annual"
        }))
        .unwrap();
        let record = SyncRecord::from_remote(EntityKind::ServiceRecord, remote);
        assert_eq!(record.parent_id.as_deref(), Some("e9"));
        assert!(record.synced);
        assert_eq!(record.fields, object(json!({"notes": "annual"})));
    }

    #[test]
    fn client_patch_never_carries_the_parent() {
        let mut record = SyncRecord::new_local(
            EntityKind::ServiceRecord,
            object(json!({"elevator": "e1", "notes": "ok"})),
        );
        record.fields.insert("elevator".into(), json!("e2"));
        record.fields.insert("createdAt".into(), json!("2024-01-01"));
        let patch = record.client_patch();
        assert_eq!(patch, object(json!({"notes": "ok"})));
        assert_eq!(record.create_payload().get("elevator"), Some(&json!("e1")));
    }

    #[test]
    fn apply_patch_ignores_parent_and_server_fields() {
        let mut record = SyncRecord::new_local(
            EntityKind::ServiceRecord,
            object(json!({"elevator": "e1", "notes": "ok"})),
        );
        record.apply_patch(&object(json!({"elevator": "e5", "id": "x", "notes": "redo"})));
        assert_eq!(record.parent_id.as_deref(), Some("e1"));
        assert_eq!(record.fields, object(json!({"notes": "redo"})));
    }
}
