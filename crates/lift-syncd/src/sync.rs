use crate::error::{StoreError, SyncError, SyncResult};
use crate::gateway::Gateway;
use crate::monitor::{Availability, MonitorEvent};
use crate::resource::Resource;
use crate::session::SessionManager;
use crate::status::SyncStatus;
use crate::store::{LocalStore, QueuedMutation, RecordFilter};
use lift_core::models::{is_local_id, now_millis};
use lift_core::{merge_records, EntityKind, SyncRecord};
use lift_proto::{normalize_reference, Method};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Kinds pushed by the background cycle, in order
const PUSH_KINDS: [EntityKind; 2] = [EntityKind::ServiceRecord, EntityKind::RepairRecord];
/// Kinds pulled on every cycle, in order
const PULL_KINDS: [EntityKind; 3] = [
    EntityKind::Elevator,
    EntityKind::ServiceRecord,
    EntityKind::RepairRecord,
];
const PRIVILEGED_KINDS: [EntityKind; 2] = [EntityKind::User, EntityKind::SimCard];
const CHAT_KINDS: [EntityKind; 2] = [EntityKind::ChatRoom, EntityKind::ChatMessage];

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub interval: Duration,
    pub include_chat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotReady(Availability),
    NoSession,
    OfflineSession,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotReady(state) => write!(f, "backend not ready ({state})"),
            SkipReason::NoSession => f.write_str("not signed in"),
            SkipReason::OfflineSession => f.write_str("offline session"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    Replay,
    Push(EntityKind),
    Pull(EntityKind),
}

impl fmt::Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStep::Replay => f.write_str("queue replay"),
            SyncStep::Push(kind) => write!(f, "push {kind}"),
            SyncStep::Pull(kind) => write!(f, "pull {kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step: SyncStep,
    pub error: String,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Queue entries delivered
    pub replayed: usize,
    /// Queue entries and pushes the backend refused; their edits are dropped
    pub rejected: usize,
    pub pushed: usize,
    pub pulled: usize,
    pub deleted: usize,
    pub failures: Vec<StepFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replayed {}, rejected {}, pushed {}, pulled {}, deleted {}",
            self.replayed, self.rejected, self.pushed, self.pulled, self.deleted
        )?;
        if !self.failures.is_empty() {
            write!(f, ", {} step(s) failed", self.failures.len())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    AlreadyRunning,
    Skipped(SkipReason),
}

/// Runs sync cycles: replay the mutation queue, push dirty records, then
/// pull deltas. At most one cycle runs at a time per orchestrator.
pub struct SyncOrchestrator {
    store: LocalStore,
    gateway: Arc<Gateway>,
    session: Arc<SessionManager>,
    availability: watch::Receiver<Availability>,
    options: SyncOptions,
    busy: AtomicBool,
    status: RwLock<SyncStatus>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        gateway: Arc<Gateway>,
        availability: watch::Receiver<Availability>,
        options: SyncOptions,
    ) -> Self {
        let session = gateway.session().clone();
        let initial = *availability.borrow();
        Self {
            store,
            gateway,
            session,
            availability,
            options,
            busy: AtomicBool::new(false),
            status: RwLock::new(SyncStatus::new(initial)),
            auto_sync: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn auto_sync_active(&self) -> bool {
        self.auto_sync
            .lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.is_finished()))
            .unwrap_or(false)
    }

    /// Start periodic auto-sync: a cycle every `interval`, plus one as soon
    /// as the monitor reports the backend ready. Starting twice is a no-op.
    pub fn start(self: &Arc<Self>, mut events: broadcast::Receiver<MonitorEvent>) {
        let Ok(mut slot) = self.auto_sync.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let period = self.options.interval;
        let this: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => "timer",
                    event = events.recv() => match event {
                        Ok(MonitorEvent::BackendReady) => "backend ready",
                        Ok(MonitorEvent::StateChanged(_)) => continue,
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!("auto-sync missed {n} monitor events");
                            continue;
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                let Some(orchestrator) = this.upgrade() else {
                    break;
                };
                // The cycle gets its own task: aborting this loop must not
                // cut one short between a create and its re-key.
                let cycle = tokio::spawn(async move { orchestrator.sync_all().await });
                match cycle.await {
                    Ok(SyncOutcome::Completed(report)) => {
                        tracing::info!("sync ({trigger}): {report}");
                    }
                    Ok(SyncOutcome::AlreadyRunning) => {
                        tracing::debug!("sync ({trigger}) skipped, cycle in progress");
                    }
                    Ok(SyncOutcome::Skipped(reason)) => {
                        tracing::debug!("sync ({trigger}) skipped: {reason}");
                    }
                    Err(e) => {
                        tracing::error!("sync ({trigger}) task failed: {e}");
                    }
                }
            }
        }));
        tracing::info!("auto-sync started, every {period:?}");
    }

    /// Stop auto-sync. No further cycle starts once this returns; a cycle
    /// already in flight runs to completion.
    pub fn stop(&self) {
        let taken = self.auto_sync.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = taken {
            task.abort();
            tracing::info!("auto-sync stopped");
        }
    }

    /// Current status, with fresh availability and backlog counts.
    pub fn status(&self) -> SyncStatus {
        let mut status = self
            .status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|_| SyncStatus::new(Availability::Offline));
        status.availability = *self.availability.borrow();
        status.syncing = self.is_running();
        status.auto_sync = self.auto_sync_active();
        match (self.store.unsynced_count(), self.store.queue_len()) {
            (Ok(dirty), Ok(queued)) => {
                status.pending_changes = dirty;
                status.queued_mutations = queued;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("could not count pending changes: {e}");
            }
        }
        status
    }

    /// Run one full cycle if nothing else is running and the backend is
    /// reachable with a signed-in session.
    pub async fn sync_all(&self) -> SyncOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SyncOutcome::AlreadyRunning;
        }
        let _busy = BusyGuard(&self.busy);

        if self.session.is_offline_demo() {
            return SyncOutcome::Skipped(SkipReason::OfflineSession);
        }
        if !self.session.is_signed_in() {
            return SyncOutcome::Skipped(SkipReason::NoSession);
        }
        let availability = *self.availability.borrow();
        if availability != Availability::OnlineReady {
            return SyncOutcome::Skipped(SkipReason::NotReady(availability));
        }

        let report = self.run_cycle().await;
        self.record_cycle(&report);
        SyncOutcome::Completed(report)
    }

    async fn run_cycle(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let replay = self.replay_queue(&mut report).await;
        if self.step_failed(SyncStep::Replay, replay, &mut report) {
            return report;
        }

        let queued = match self.store.queued_local_ids() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("could not read queued ids: {e}");
                HashSet::new()
            }
        };
        for kind in PUSH_KINDS {
            let result = self.push_kind(kind, &queued, &mut report).await;
            if self.step_failed(SyncStep::Push(kind), result, &mut report) {
                return report;
            }
        }

        let mut pulls: Vec<EntityKind> = PULL_KINDS.to_vec();
        if self.session.role().is_privileged() {
            pulls.extend(PRIVILEGED_KINDS);
        }
        if self.options.include_chat {
            pulls.extend(CHAT_KINDS);
        }
        for kind in pulls {
            let result = self.pull_kind(kind, &mut report).await;
            if self.step_failed(SyncStep::Pull(kind), result, &mut report) {
                return report;
            }
        }

        report
    }

    /// Record a failed step. Returns true when the cycle cannot go on
    /// because the session is gone.
    fn step_failed(&self, step: SyncStep, result: SyncResult<()>, report: &mut SyncReport) -> bool {
        let Err(err) = result else {
            return false;
        };
        tracing::warn!("{step} failed: {err}");
        let fatal = matches!(err, SyncError::AuthExpired);
        report.failures.push(StepFailure {
            step,
            error: err.to_string(),
        });
        fatal
    }

    fn record_cycle(&self, report: &SyncReport) {
        let Ok(mut status) = self.status.write() else {
            return;
        };
        status.cycles += 1;
        match report.failures.first() {
            None => {
                status.last_sync = Some(now_millis());
                status.last_error = None;
            }
            Some(failure) => {
                status.last_error = Some(format!("{}: {}", failure.step, failure.error));
            }
        }
    }

    /// Deliver queued mutations oldest first. Stops at the first transient
    /// failure so later entries keep their order.
    async fn replay_queue(&self, report: &mut SyncReport) -> SyncResult<()> {
        for entry in self.store.list_queued()? {
            if let Some(local_id) = entry.local_id.as_deref() {
                if entry.method == Method::Create && self.store.resolve_alias(local_id)?.is_some() {
                    // Created and re-keyed before, only the dequeue was lost.
                    self.store.dequeue(entry.id)?;
                    continue;
                }
            }

            let (resource, payload) = self.prepare_replay(&entry)?;
            let started = now_millis();
            match self.gateway.send(entry.method, &resource, payload).await {
                Ok(body) => {
                    self.settle_replayed(&entry, &resource, &body, started)?;
                    self.store.dequeue(entry.id)?;
                    report.replayed += 1;
                }
                Err(err) if entry.method == Method::Delete && err.is_not_found() => {
                    self.store.dequeue(entry.id)?;
                    report.replayed += 1;
                }
                Err(err) if err.is_transient() || matches!(err, SyncError::AuthExpired) => {
                    tracing::info!(
                        "replay paused at #{} ({} {resource}): {err}",
                        entry.id,
                        entry.method.as_str()
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "dropping queued {} {resource} (#{}): {err}",
                        entry.method.as_str(),
                        entry.id
                    );
                    self.store.dequeue(entry.id)?;
                    let edited = match (entry.method, entry.local_id.as_deref()) {
                        (Method::Create, Some(local_id)) => Some(local_id),
                        (Method::Update, _) => resource.id.as_deref(),
                        _ => None,
                    };
                    if let Some(id) = edited {
                        drop_rejected_edit(&self.store, &self.gateway, resource.kind, id).await?;
                    }
                    report.rejected += 1;
                }
            }
        }
        Ok(())
    }

    /// Map local ids in a queued call onto server ids, and send creates with
    /// the record's current state rather than the state at enqueue time.
    fn prepare_replay(&self, entry: &QueuedMutation) -> SyncResult<(Resource, Option<Value>)> {
        let kind = entry.resource.kind;
        let mut resource = entry.resource.clone();
        if let Some(id) = resource.id.clone().filter(|id| is_local_id(id)) {
            if let Some(server_id) = self.store.resolve_alias(&id)? {
                resource = resource.with_id(server_id);
            }
        }

        let mut payload = entry.payload.clone();
        if entry.method == Method::Create {
            if let Some(local_id) = entry.local_id.as_deref() {
                if let Some(record) = self.store.get(kind, local_id)? {
                    payload = Some(Value::Object(record.create_payload()));
                }
            }
        }
        if let (Some(field), Some(Value::Object(body))) = (kind.parent_field(), payload.as_mut()) {
            let parent = body.get(field).and_then(normalize_reference);
            if let Some(parent) = parent.filter(|id| is_local_id(id)) {
                if let Some(server_id) = self.store.resolve_alias(&parent)? {
                    body.insert(field.to_string(), Value::String(server_id));
                }
            }
        }
        Ok((resource, payload))
    }

    fn settle_replayed(
        &self,
        entry: &QueuedMutation,
        resource: &Resource,
        body: &Value,
        started: chrono::DateTime<chrono::Utc>,
    ) -> SyncResult<()> {
        let kind = resource.kind;
        match (entry.method, entry.local_id.as_deref(), resource.id.as_deref()) {
            (Method::Create, Some(local_id), _) => {
                let server_id = lift_proto::assigned_id(body).ok_or_else(|| {
                    SyncError::Protocol(format!("create of {kind} returned no id"))
                })?;
                if self.store.get(kind, local_id)?.is_some() {
                    self.store.rekey(kind, local_id, &server_id, started)?;
                }
            }
            (Method::Update, _, Some(id)) => {
                self.store.mark_synced(kind, id, entry.enqueued_at)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn push_kind(
        &self,
        kind: EntityKind,
        queued: &HashSet<String>,
        report: &mut SyncReport,
    ) -> SyncResult<()> {
        let dirty = self.store.get_all(kind, &RecordFilter::unsynced())?;
        for record in dirty {
            if queued.contains(&record.id) {
                tracing::debug!("{kind} {} waits for its queued create", record.id);
                continue;
            }
            if record.parent_id.as_deref().is_some_and(is_local_id) {
                tracing::debug!("{kind} {} waits for its parent to sync", record.id);
                continue;
            }
            match self.push_record(&record).await {
                Ok(()) => report.pushed += 1,
                Err(err) if err.is_transient() || matches!(err, SyncError::AuthExpired) => {
                    return Err(err);
                }
                Err(err @ (SyncError::ValidationRejected { .. } | SyncError::Forbidden(_))) => {
                    tracing::warn!("backend refused {kind} {}, dropping the edit: {err}", record.id);
                    drop_rejected_edit(&self.store, &self.gateway, kind, &record.id).await?;
                    report.rejected += 1;
                }
                Err(err) => {
                    tracing::warn!("push of {kind} {} failed, will retry: {err}", record.id);
                }
            }
        }
        Ok(())
    }

    async fn push_record(&self, record: &SyncRecord) -> SyncResult<()> {
        let started = now_millis();
        if record.is_local() {
            let body = self
                .gateway
                .send(
                    Method::Create,
                    &Resource::collection(record.kind),
                    Some(Value::Object(record.create_payload())),
                )
                .await?;
            let server_id = lift_proto::assigned_id(&body).ok_or_else(|| {
                SyncError::Protocol(format!("create of {} returned no id", record.kind))
            })?;
            self.store.rekey(record.kind, &record.id, &server_id, started)?;
            tracing::debug!("created {} {} as {server_id}", record.kind, record.id);
        } else {
            self.gateway
                .send(
                    Method::Update,
                    &Resource::record(record.kind, &record.id),
                    Some(Value::Object(record.client_patch())),
                )
                .await?;
            self.store.mark_synced(record.kind, &record.id, started)?;
            tracing::debug!("updated {} {}", record.kind, record.id);
        }
        Ok(())
    }

    /// Pull records changed since the checkpoint. The first pull of a kind
    /// is a full listing, which also removes records the server dropped.
    async fn pull_kind(&self, kind: EntityKind, report: &mut SyncReport) -> SyncResult<()> {
        let since = self.store.checkpoint(kind)?;
        let requested_at = now_millis();
        let remote: Vec<SyncRecord> = self
            .gateway
            .list(kind, since)
            .await?
            .into_iter()
            .map(|r| SyncRecord::from_remote(kind, r))
            .collect();

        let mut applied = 0;
        for record in &remote {
            if self.store.apply_remote(record)?.is_some() {
                applied += 1;
            }
        }

        let mut deleted = 0;
        if since.is_none() {
            let local = self.store.get_all(kind, &RecordFilter::all())?;
            for id in merge_records(&local, &remote).deletes {
                if self.store.delete_synced(kind, &id)? {
                    deleted += 1;
                }
            }
        }

        self.store.set_checkpoint(kind, requested_at)?;
        if applied > 0 || deleted > 0 {
            tracing::debug!("pulled {kind}: {applied} written, {deleted} deleted");
        }
        report.pulled += applied;
        report.deleted += deleted;
        Ok(())
    }
}

/// Undo a local edit the backend refused, so it is neither retried nor
/// left blocking later pulls. A local-only record goes away with what it
/// owns; a server record is put back to the server's copy.
pub(crate) async fn drop_rejected_edit(
    store: &LocalStore,
    gateway: &Gateway,
    kind: EntityKind,
    id: &str,
) -> SyncResult<()> {
    if is_local_id(id) {
        return remove_tree(store, kind, id);
    }
    match gateway.get(kind, id).await {
        Ok(remote) => {
            store.upsert(&SyncRecord::from_remote(kind, remote))?;
            tracing::debug!("restored server copy of {kind} {id}");
            Ok(())
        }
        Err(err) if err.is_not_found() => remove_tree(store, kind, id),
        Err(err) => {
            tracing::warn!("could not fetch {kind} {id}, it refreshes on the next pull: {err}");
            store.discard_edit(kind, id)?;
            Ok(())
        }
    }
}

fn remove_tree(store: &LocalStore, kind: EntityKind, id: &str) -> SyncResult<()> {
    match store.delete_cascade(kind, id) {
        Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}
