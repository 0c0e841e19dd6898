use super::{LocalStore, StoreResult};
use crate::error::StoreError;
use crate::resource::Resource;
use chrono::{DateTime, Utc};
use lift_core::models::now_millis;
use lift_proto::Method;
use rusqlite::params;
use serde_json::Value;
use std::collections::HashSet;

/// A mutating call to remember for later replay
#[derive(Debug, Clone, PartialEq)]
pub struct NewMutation {
    pub method: Method,
    pub resource: Resource,
    pub payload: Option<Value>,
    /// Local id of the record this call creates or touches, if it has one
    pub local_id: Option<String>,
}

/// A persisted queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    pub id: i64,
    pub method: Method,
    pub resource: Resource,
    pub payload: Option<Value>,
    pub local_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl LocalStore {
    /// Append a mutation to the durable queue and return its id.
    pub fn enqueue(&self, mutation: &NewMutation) -> StoreResult<i64> {
        let conn = self.conn()?;
        let payload = mutation
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt {
                table: "mutation_queue",
                message: e.to_string(),
            })?;
        conn.execute(
            "INSERT INTO mutation_queue (method, resource, payload, local_id, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                mutation.method.as_str(),
                mutation.resource.path(),
                payload,
                mutation.local_id,
                now_millis().timestamp_millis()
            ],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!("queued {} {} as #{id}", mutation.method.as_str(), mutation.resource);
        Ok(id)
    }

    /// Every queued mutation, oldest first
    pub fn list_queued(&self) -> StoreResult<Vec<QueuedMutation>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, method, resource, payload, local_id, enqueued_at
             FROM mutation_queue ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, method, resource, payload, local_id, enqueued_at) = row?;
            out.push(QueuedMutation {
                id,
                method: Method::parse(&method).ok_or_else(|| corrupt(id, "method", &method))?,
                resource: Resource::parse(&resource)
                    .ok_or_else(|| corrupt(id, "resource", &resource))?,
                payload: payload
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()
                    .map_err(|e| corrupt(id, "payload", &e.to_string()))?,
                local_id,
                enqueued_at: DateTime::from_timestamp_millis(enqueued_at)
                    .ok_or_else(|| corrupt(id, "timestamp", &enqueued_at.to_string()))?,
            });
        }
        Ok(out)
    }

    pub fn dequeue(&self, id: i64) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM mutation_queue WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    pub fn queue_len(&self) -> StoreResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM mutation_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Local ids that still have a queued mutation waiting on them
    pub fn queued_local_ids(&self) -> StoreResult<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT local_id FROM mutation_queue WHERE local_id IS NOT NULL")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }
}

fn corrupt(id: i64, what: &str, value: &str) -> StoreError {
    StoreError::Corrupt {
        table: "mutation_queue",
        message: format!("entry #{id}: bad {what} '{value}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lift_core::EntityKind;
    use serde_json::json;

    fn create(local_id: &str) -> NewMutation {
        NewMutation {
            method: Method::Create,
            resource: Resource::collection(EntityKind::RepairRecord),
            payload: Some(json!({"description": "door stuck", "elevator": "e1"})),
            local_id: Some(local_id.to_string()),
        }
    }

    #[test]
    fn entries_come_back_in_order() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.enqueue(&create("local-a")).unwrap();
        let second = store
            .enqueue(&NewMutation {
                method: Method::Delete,
                resource: Resource::record(EntityKind::Elevator, "e9"),
                payload: None,
                local_id: None,
            })
            .unwrap();
        assert!(first < second);

        let queued = store.list_queued().unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].method, Method::Create);
        assert_eq!(queued[0].local_id.as_deref(), Some("local-a"));
        assert_eq!(queued[1].resource.path(), "elevators/e9");
        assert_eq!(queued[1].payload, None);

        assert!(store.dequeue(first).unwrap());
        assert!(!store.dequeue(first).unwrap());
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lift.db");
        {
            let store = LocalStore::open(&path).unwrap();
            store.enqueue(&create("local-a")).unwrap();
            store.enqueue(&create("local-b")).unwrap();
        }
        let reopened = LocalStore::open(&path).unwrap();
        let ids: Vec<_> = reopened
            .list_queued()
            .unwrap()
            .into_iter()
            .filter_map(|m| m.local_id)
            .collect();
        assert_eq!(ids, vec!["local-a".to_string(), "local-b".to_string()]);
        assert!(reopened.queued_local_ids().unwrap().contains("local-b"));
    }
}
