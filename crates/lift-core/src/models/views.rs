use super::{EntityKind, SyncRecord};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("expected a {expected} record, got {found}")]
    KindMismatch {
        expected: EntityKind,
        found: EntityKind,
    },
    #[error("record attributes must serialize to a JSON object")]
    NotAnObject,
    #[error("invalid record attributes: {0}")]
    Json(#[from] serde_json::Error),
}

/// Typed view over a [`SyncRecord`]. Attributes the view does not know
/// about are kept in its `extra` map and survive a round trip.
pub trait RecordView: Serialize + DeserializeOwned {
    const KIND: EntityKind;

    fn from_record(record: &SyncRecord) -> Result<Self, ModelError> {
        if record.kind != Self::KIND {
            return Err(ModelError::KindMismatch {
                expected: Self::KIND,
                found: record.kind,
            });
        }
        let mut object = record.fields.clone();
        object.insert("id".to_string(), Value::String(record.id.clone()));
        if let (Some(field), Some(parent)) = (Self::KIND.parent_field(), &record.parent_id) {
            object.insert(field.to_string(), Value::String(parent.clone()));
        }
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// Attributes suitable for `SyncRecord::new_local` or a local update.
    fn to_fields(&self) -> Result<Map<String, Value>, ModelError> {
        match serde_json::to_value(self)? {
            Value::Object(mut object) => {
                object.remove("id");
                Ok(object)
            }
            _ => Err(ModelError::NotAnObject),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Elevator {
    #[serde(default)]
    pub id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordView for Elevator {
    const KIND: EntityKind = EntityKind::Elevator;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    #[serde(default)]
    pub id: String,
    pub elevator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub technician: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordView for ServiceRecord {
    const KIND: EntityKind = EntityKind::ServiceRecord;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    #[serde(default)]
    pub id: String,
    pub elevator: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RecordView for RepairRecord {
    const KIND: EntityKind = EntityKind::RepairRecord;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn repair_view_keeps_unknown_attributes() {
        let fields = json!({"elevator": "e1", "description": "rope wear", "priority": 2});
        let record =
            SyncRecord::new_local(EntityKind::RepairRecord, fields.as_object().cloned().unwrap());

        let view = RepairRecord::from_record(&record).unwrap();
        assert_eq!(view.elevator, "e1");
        assert_eq!(view.id, record.id);
        assert_eq!(view.extra.get("priority"), Some(&json!(2)));

        let back = view.to_fields().unwrap();
        assert_eq!(back.get("priority"), Some(&json!(2)));
        assert!(!back.contains_key("id"));
    }

    #[test]
    fn view_rejects_other_kinds() {
        let record = SyncRecord::new_local(
            EntityKind::Elevator,
            json!({"address": "Pier 3"}).as_object().cloned().unwrap(),
        );
        assert!(matches!(
            ServiceRecord::from_record(&record),
            Err(ModelError::KindMismatch { .. })
        ));
        assert_eq!(Elevator::from_record(&record).unwrap().address, "Pier 3");
    }
}
