use crate::error::{SyncError, SyncResult};
use crate::gateway::Gateway;
use crate::monitor::Availability;
use crate::resource::Resource;
use crate::store::{LocalStore, NewMutation, RecordFilter};
use crate::sync::drop_rejected_edit;
use lift_core::models::{is_local_id, now_millis};
use lift_core::{EntityKind, RecordView, SyncRecord};
use lift_proto::Method;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;

/// How far a user edit got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Saved locally and accepted by the backend
    Synced,
    /// Saved locally; the server call waits in the mutation queue. `None`
    /// when an earlier queued create already carries the edit.
    SavedOffline { queue_id: Option<i64> },
    /// Saved locally only (offline demo session)
    LocalOnly,
}

/// User-facing record operations: write locally first, then reach the
/// backend when it is ready, falling back to the mutation queue.
pub struct RecordService {
    store: LocalStore,
    gateway: Arc<Gateway>,
    availability: watch::Receiver<Availability>,
}

impl RecordService {
    pub fn new(store: LocalStore, gateway: Arc<Gateway>, availability: watch::Receiver<Availability>) -> Self {
        Self {
            store,
            gateway,
            availability,
        }
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> SyncResult<Option<SyncRecord>> {
        Ok(self.store.get(kind, id)?)
    }

    pub fn list(&self, kind: EntityKind, filter: &RecordFilter) -> SyncResult<Vec<SyncRecord>> {
        Ok(self.store.get_all(kind, filter)?)
    }

    /// Typed read, e.g. `service.load::<Elevator>(id)`
    pub fn load<V: RecordView>(&self, id: &str) -> SyncResult<Option<V>> {
        match self.store.get(V::KIND, id)? {
            Some(record) => V::from_record(&record)
                .map(Some)
                .map_err(|e| SyncError::Protocol(e.to_string())),
            None => Ok(None),
        }
    }

    pub async fn create(
        &self,
        kind: EntityKind,
        fields: Map<String, Value>,
    ) -> SyncResult<(SyncRecord, WriteOutcome)> {
        let record = SyncRecord::new_local(kind, fields);
        self.store.insert(&record)?;
        tracing::debug!("created {kind} {} locally", record.id);

        if self.offline_demo() {
            return Ok((record, WriteOutcome::LocalOnly));
        }
        let parent_pending = record.parent_id.as_deref().is_some_and(is_local_id);
        if !self.backend_ready() || parent_pending {
            let queue_id = self.store.enqueue(&NewMutation {
                method: Method::Create,
                resource: Resource::collection(kind),
                payload: Some(Value::Object(record.create_payload())),
                local_id: Some(record.id.clone()),
            })?;
            return Ok((record, WriteOutcome::SavedOffline { queue_id: Some(queue_id) }));
        }

        let started = now_millis();
        match self
            .gateway
            .create(kind, record.create_payload(), Some(&record.id))
            .await
        {
            Ok(server_id) => {
                self.store.rekey(kind, &record.id, &server_id, started)?;
                let synced = self.store.get(kind, &server_id)?.unwrap_or(record);
                Ok((synced, WriteOutcome::Synced))
            }
            Err(SyncError::Queued { queue_id, .. }) => {
                Ok((record, WriteOutcome::SavedOffline { queue_id: Some(queue_id) }))
            }
            Err(err @ (SyncError::ValidationRejected { .. } | SyncError::Forbidden(_))) => {
                self.store.delete(kind, &record.id)?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Typed create
    pub async fn create_view<V: RecordView>(&self, view: &V) -> SyncResult<(V, WriteOutcome)> {
        let fields = view.to_fields().map_err(|e| SyncError::Protocol(e.to_string()))?;
        let (record, outcome) = self.create(V::KIND, fields).await?;
        let view = V::from_record(&record).map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok((view, outcome))
    }

    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        partial: Map<String, Value>,
    ) -> SyncResult<(SyncRecord, WriteOutcome)> {
        let record = self.store.update(kind, id, &partial)?;

        if self.offline_demo() {
            return Ok((record, WriteOutcome::LocalOnly));
        }
        if record.is_local() {
            // Not on the server yet; the create replays with current state.
            let outcome = if self.store.queued_local_ids()?.contains(&record.id) {
                WriteOutcome::SavedOffline { queue_id: None }
            } else {
                let queue_id = self.store.enqueue(&NewMutation {
                    method: Method::Create,
                    resource: Resource::collection(kind),
                    payload: Some(Value::Object(record.create_payload())),
                    local_id: Some(record.id.clone()),
                })?;
                WriteOutcome::SavedOffline { queue_id: Some(queue_id) }
            };
            return Ok((record, outcome));
        }

        let patch = record.client_patch();
        if !self.backend_ready() {
            let queue_id = self.store.enqueue(&NewMutation {
                method: Method::Update,
                resource: Resource::record(kind, id),
                payload: Some(Value::Object(patch)),
                local_id: None,
            })?;
            return Ok((record, WriteOutcome::SavedOffline { queue_id: Some(queue_id) }));
        }

        let started = now_millis();
        match self.gateway.update(kind, id, patch).await {
            Ok(()) => {
                self.store.mark_synced(kind, id, started)?;
                let record = self.store.get(kind, id)?.unwrap_or(record);
                Ok((record, WriteOutcome::Synced))
            }
            Err(SyncError::Queued { queue_id, .. }) => {
                Ok((record, WriteOutcome::SavedOffline { queue_id: Some(queue_id) }))
            }
            Err(err @ (SyncError::ValidationRejected { .. } | SyncError::Forbidden(_))) => {
                drop_rejected_edit(&self.store, &self.gateway, kind, id).await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a record and everything it owns, locally and then remotely.
    /// A 404 from the backend counts as already deleted.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> SyncResult<WriteOutcome> {
        let deleted = self.store.delete_cascade(kind, id)?;
        let remote: Vec<(EntityKind, String)> = deleted
            .into_iter()
            .rev()
            .filter(|(_, id)| !is_local_id(id))
            .collect();

        if remote.is_empty() || self.offline_demo() {
            return Ok(WriteOutcome::LocalOnly);
        }

        let mut outcome = WriteOutcome::Synced;
        let ready = self.backend_ready();
        for (kind, id) in remote {
            if !ready {
                let queue_id = self.store.enqueue(&NewMutation {
                    method: Method::Delete,
                    resource: Resource::record(kind, &id),
                    payload: None,
                    local_id: None,
                })?;
                outcome = WriteOutcome::SavedOffline { queue_id: Some(queue_id) };
                continue;
            }
            match self.gateway.delete(kind, &id).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() && !err.is_queued() => {
                    tracing::debug!("{kind} {id} already gone on the server");
                }
                Err(SyncError::Queued { queue_id, .. }) => {
                    outcome = WriteOutcome::SavedOffline { queue_id: Some(queue_id) };
                }
                Err(err) => return Err(err),
            }
        }
        Ok(outcome)
    }

    fn backend_ready(&self) -> bool {
        *self.availability.borrow() == Availability::OnlineReady
    }

    fn offline_demo(&self) -> bool {
        self.gateway.session().is_offline_demo()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, Session, SessionManager};
    use crate::transport::HttpTransport;
    use lift_core::models::Elevator;
    use lift_core::{Role, UserProfile};
    use lift_proto::TokenPair;
    use serde_json::json;
    use std::time::Duration;

    fn service(
        server: &mockito::Server,
        session: Session,
        availability: Availability,
    ) -> (RecordService, LocalStore, watch::Sender<Availability>) {
        let store = LocalStore::open_in_memory().unwrap();
        let session =
            Arc::new(SessionManager::load(Box::new(MemorySessionStore::with_session(&session))).unwrap());
        let transport = HttpTransport::new(&server.url(), Duration::from_secs(5)).unwrap();
        let gateway = Arc::new(Gateway::new(Arc::new(transport), session, store.clone()));
        let (tx, rx) = watch::channel(availability);
        (RecordService::new(store.clone(), gateway, rx), store, tx)
    }

    fn token_session() -> Session {
        Session::new(
            TokenPair {
                access_token: "t".into(),
                refresh_token: None,
            },
            None,
        )
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn online_create_rekeys_to_the_server_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/elevators")
            .with_status(201)
            .with_body(r#"{"data":{"_id":"e-100"}}"#)
            .create_async()
            .await;
        let (service, store, _tx) = service(&server, token_session(), Availability::OnlineReady);

        let (record, outcome) = service
            .create(EntityKind::Elevator, fields(json!({"address": "Dock 3"})))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Synced);
        assert_eq!(record.id, "e-100");
        assert!(record.synced);
        assert_eq!(store.unsynced_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn offline_create_is_queued_with_its_local_id() {
        let server = mockito::Server::new_async().await;
        let (service, store, _tx) = service(&server, token_session(), Availability::Offline);

        let (record, outcome) = service
            .create(
                EntityKind::RepairRecord,
                fields(json!({"elevator": {"_id": "e1", "address": "x"}, "description": "squeak"})),
            )
            .await
            .unwrap();
        assert!(record.is_local());
        assert!(!record.synced);
        assert_eq!(record.parent_id.as_deref(), Some("e1"));
        assert!(matches!(outcome, WriteOutcome::SavedOffline { queue_id: Some(_) }));

        let queued = store.list_queued().unwrap();
        assert_eq!(queued[0].local_id.as_deref(), Some(record.id.as_str()));
        assert_eq!(queued[0].payload.as_ref().unwrap()["elevator"], json!("e1"));

        let (_, outcome) = service
            .update(EntityKind::RepairRecord, &record.id, fields(json!({"description": "loud squeak"})))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::SavedOffline { queue_id: None });
        assert_eq!(store.queue_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn validation_rejection_removes_the_local_copy() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/services")
            .with_status(422)
            .with_body(r#"{"error":"performed_at is required"}"#)
            .create_async()
            .await;
        let (service, store, _tx) = service(&server, token_session(), Availability::OnlineReady);
        let err = service
            .create(EntityKind::ServiceRecord, fields(json!({"elevator": "e1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ValidationRejected { status: 422, .. }));
        assert!(store
            .get_all(EntityKind::ServiceRecord, &RecordFilter::all())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_tolerates_404_and_cascades() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("DELETE", "/repairs/r1")
            .with_status(404)
            .create_async()
            .await;
        let elevator_delete = server
            .mock("DELETE", "/elevators/e1")
            .with_status(204)
            .create_async()
            .await;
        let (service, store, _tx) = service(&server, token_session(), Availability::OnlineReady);
        for record in [
            SyncRecord {
                kind: EntityKind::Elevator,
                id: "e1".into(),
                parent_id: None,
                fields: Map::new(),
                synced: true,
                updated_at: now_millis(),
            },
            SyncRecord {
                kind: EntityKind::RepairRecord,
                id: "r1".into(),
                parent_id: Some("e1".into()),
                fields: Map::new(),
                synced: true,
                updated_at: now_millis(),
            },
        ] {
            store.insert(&record).unwrap();
        }

        let outcome = service.delete(EntityKind::Elevator, "e1").await.unwrap();
        assert_eq!(outcome, WriteOutcome::Synced);
        assert!(store.get(EntityKind::RepairRecord, "r1").unwrap().is_none());
        elevator_delete.assert_async().await;
    }

    #[tokio::test]
    async fn demo_session_stays_local() {
        let server = mockito::Server::new_async().await;
        let demo = Session::offline_demo(UserProfile {
            id: "demo".into(),
            name: "Demo".into(),
            email: None,
            role: Role::Technician,
        });
        let (service, store, _tx) = service(&server, demo, Availability::OnlineReady);
        let elevator = Elevator {
            id: String::new(),
            address: "Harbour 9".into(),
            name: None,
            serial_number: None,
            latitude: None,
            longitude: None,
            extra: Map::new(),
        };
        let (created, outcome) = service.create_view(&elevator).await.unwrap();
        assert_eq!(outcome, WriteOutcome::LocalOnly);
        let id = created.id.clone();
        assert!(is_local_id(&id));
        assert_eq!(service.load::<Elevator>(&id).unwrap(), Some(created));
        assert_eq!(store.queue_len().unwrap(), 0);
    }
}
