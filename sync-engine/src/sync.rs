//! The sync engine drains the mutation queue against the remote service.
//!
//! A run goes `Idle -> Draining -> (Success | PartialFailure | Offline) -> Idle`.
//! Only one run is active at a time; a trigger that arrives mid-run is folded
//! into one extra pass of the active run. Everything the engine knows beyond
//! the mutation log is in memory and rebuilt on restart.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::AuthProvider;
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityEvent;
use crate::entity::{EntityType, MutationAction};
use crate::error::Result;
use crate::events::{DrainOutcome, PendingItem, SyncEvent, SyncPhase, SyncReport, SyncStatus, SyncTrigger};
use crate::queue::MutationQueue;
use crate::remote::{RemoteError, RemoteRecord, RemoteService, RequestContext};
use crate::storage::{NewMutation, PendingMutation, Storage};
use crate::store::CreateAck;

const EVENT_CAPACITY: usize = 256;

/// Derived view of sync progress. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncCursor {
    /// Highest sequence id acked since the process started.
    pub last_acked: Option<u64>,
    /// Oldest pending mutation, the point a restart resumes from.
    pub lowest_unacked: Option<u64>,
    pub is_syncing: bool,
    pub is_online: bool,
}

enum Step {
    Acked,
    Transient(String),
    Rejected(String),
    Unauthorized,
}

/// Clears the draining flag however the run ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine<S: Storage> {
    queue: MutationQueue<S>,
    remote: Arc<dyn RemoteService>,
    auth: Arc<dyn AuthProvider>,
    config: SyncConfig,
    online: AtomicBool,
    draining: AtomicBool,
    rerun: AtomicBool,
    cancelled: AtomicBool,
    last_acked: AtomicU64,
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<SyncStatus>,
}

impl<S: Storage> SyncEngine<S> {
    pub fn new(
        queue: MutationQueue<S>,
        remote: Arc<dyn RemoteService>,
        auth: Arc<dyn AuthProvider>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(SyncStatus::default());
        let engine = Self {
            queue,
            remote,
            auth,
            config,
            online: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            last_acked: AtomicU64::new(0),
            events,
            status,
        };
        if let Err(e) = engine.refresh_status() {
            warn!(error = %e, "could not read queue counts");
        }
        engine
    }

    pub fn queue(&self) -> &MutationQueue<S> {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) != online {
            self.emit(SyncEvent::ConnectivityChanged { online });
            self.status.send_modify(|s| s.is_online = online);
        }
    }

    /// Stops the active run before its next mutation. The mutation in flight
    /// is finished and acked (or left pending) first.
    pub fn cancel(&self) {
        if self.is_syncing() {
            info!("sync run cancellation requested");
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub fn cursor(&self) -> Result<SyncCursor> {
        let last = self.last_acked.load(Ordering::SeqCst);
        Ok(SyncCursor {
            last_acked: (last > 0).then_some(last),
            lowest_unacked: self.queue.lowest_unacked()?,
            is_syncing: self.is_syncing(),
            is_online: self.is_online(),
        })
    }

    pub fn refresh_status(&self) -> Result<()> {
        let all = self.queue.lock()?.all_mutations()?;
        let dead = all.iter().filter(|m| m.is_dead_letter()).count();
        self.status.send_modify(|s| {
            s.pending_count = all.len() - dead;
            s.dead_letter_count = dead;
        });
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Runs one drain. Returns `Coalesced` straight away when a run is
    /// already active; that run then makes one more pass.
    pub async fn sync_now(&self, trigger: SyncTrigger) -> Result<SyncReport> {
        if !self.is_online() {
            debug!(?trigger, "offline, drain skipped");
            return Ok(SyncReport::new(trigger, DrainOutcome::Offline));
        }
        if self.draining.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            self.rerun.store(true, Ordering::SeqCst);
            return Ok(SyncReport::new(trigger, DrainOutcome::Coalesced));
        }
        let _guard = DrainGuard(&self.draining);
        self.cancelled.store(false, Ordering::SeqCst);
        self.rerun.store(false, Ordering::SeqCst);
        self.status.send_modify(|s| s.phase = SyncPhase::Draining);
        self.emit(SyncEvent::RunStarted { trigger });
        info!(?trigger, "sync run started");

        let mut report = SyncReport::new(trigger, DrainOutcome::Success);
        let result = loop {
            if let Err(e) = self.drain(&mut report).await {
                break Err(e);
            }
            if report.outcome != DrainOutcome::Success || !self.rerun.swap(false, Ordering::SeqCst) {
                break Ok(());
            }
            debug!("coalesced trigger, draining again");
        };

        self.status.send_modify(|s| s.phase = SyncPhase::Idle);
        self.refresh_status()?;
        result?;

        if report.outcome == DrainOutcome::Success && report.dead_lettered > 0 {
            report.outcome = DrainOutcome::PartialFailure;
        }
        info!(
            outcome = ?report.outcome,
            acked = report.acked,
            remapped = report.remapped,
            dead_lettered = report.dead_lettered,
            "sync run finished"
        );
        self.emit(SyncEvent::RunFinished(report.clone()));
        Ok(report)
    }

    async fn drain(&self, report: &mut SyncReport) -> Result<()> {
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        loop {
            let Some(token) = self.auth.token() else {
                info!("no bearer token, sync deferred");
                report.outcome = DrainOutcome::Deferred;
                return Ok(());
            };
            let batch = self.queue.next_batch(self.config.batch_size)?;
            if batch.is_empty() {
                return Ok(());
            }

            for queued in batch {
                if self.cancelled.load(Ordering::SeqCst) {
                    report.outcome = DrainOutcome::Cancelled;
                    return Ok(());
                }
                if !self.is_online() {
                    report.outcome = DrainOutcome::Offline;
                    return Ok(());
                }

                // An earlier Create in this batch may have remapped the id.
                let Some(m) = self.queue.lock()?.get_mutation(queued.sequence_id)? else {
                    continue;
                };
                if m.is_dead_letter() || blocked.contains(&(m.entity_type, m.entity_id.clone())) {
                    continue;
                }

                match self.push(&m, &token, report).await? {
                    Step::Acked => {}
                    Step::Rejected(reason) => {
                        blocked.insert((m.entity_type, m.entity_id.clone()));
                        self.dead_letter(&m, &reason, report)?;
                    }
                    Step::Transient(reason) => {
                        self.transient_failure(&m, &reason, report)?;
                        return Ok(());
                    }
                    Step::Unauthorized => {
                        warn!(sequence_id = m.sequence_id, "server refused credentials, sync deferred");
                        report.outcome = DrainOutcome::Deferred;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn push(&self, m: &PendingMutation, token: &str, report: &mut SyncReport) -> Result<Step> {
        let key = format!("{}:{}:{}", m.entity_type, m.entity_id, m.sequence_id);
        let ctx = RequestContext { token, idempotency_key: &key };

        let call = async {
            match m.action {
                MutationAction::Create => self.remote.create(m.entity_type, &m.payload, ctx).await.map(Some),
                MutationAction::Update => {
                    self.remote.update(m.entity_type, &m.entity_id, &m.payload, ctx).await.map(Some)
                }
                MutationAction::Delete => self.remote.delete(m.entity_type, &m.entity_id, ctx).await.map(|_| None),
            }
        };
        let response = match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(response) => response,
            Err(_) => Err(RemoteError::Transient(format!(
                "request timed out after {:?}",
                self.config.request_timeout
            ))),
        };

        match response {
            Ok(record) => {
                self.apply_ack(m, record, report)?;
                Ok(Step::Acked)
            }
            Err(RemoteError::Transient(reason)) => Ok(Step::Transient(reason)),
            Err(e @ RemoteError::Rejected { .. }) => Ok(Step::Rejected(e.to_string())),
            Err(RemoteError::Unauthorized) => Ok(Step::Unauthorized),
        }
    }

    fn apply_ack(&self, m: &PendingMutation, record: Option<RemoteRecord>, report: &mut SyncReport) -> Result<()> {
        let mut acked_id = m.entity_id.clone();

        match (m.action, record) {
            (MutationAction::Create, Some(record)) => {
                let ack = self.queue.lock()?.ack_create(m.sequence_id, m.entity_type, &m.entity_id, &record.id)?;
                match ack {
                    CreateAck::Acked => {}
                    CreateAck::Remapped { from, to } => {
                        info!(entity_type = %m.entity_type, from = %from, to = %to, "remapped temporary id");
                        report.remapped += 1;
                        acked_id = to.clone();
                        self.emit(SyncEvent::IdRemapped { entity_type: m.entity_type, from, to });
                    }
                    CreateAck::Orphaned => {
                        // Deleted locally while the Create was in flight.
                        let sequence_id = self.queue.lock()?.append_mutation(NewMutation {
                            entity_type: m.entity_type,
                            entity_id: record.id.clone(),
                            action: MutationAction::Delete,
                            payload: Value::Null,
                            created_at: Utc::now(),
                        })?;
                        warn!(
                            entity_type = %m.entity_type,
                            server_id = %record.id,
                            sequence_id,
                            "create acked after local delete, queued compensating delete"
                        );
                        return Ok(());
                    }
                }
            }
            _ => {
                self.queue.ack(m.sequence_id)?;
            }
        }

        debug!(sequence_id = m.sequence_id, entity_type = %m.entity_type, entity_id = %acked_id, "acked");
        self.last_acked.fetch_max(m.sequence_id, Ordering::SeqCst);
        report.acked += 1;
        self.emit(SyncEvent::Acked { sequence_id: m.sequence_id, entity_type: m.entity_type, entity_id: acked_id });
        Ok(())
    }

    fn dead_letter(&self, m: &PendingMutation, reason: &str, report: &mut SyncReport) -> Result<()> {
        self.queue.lock()?.dead_letter(m.sequence_id, reason)?;
        warn!(
            sequence_id = m.sequence_id,
            entity_type = %m.entity_type,
            entity_id = %m.entity_id,
            reason,
            "mutation dead-lettered"
        );
        report.dead_lettered += 1;
        self.emit(SyncEvent::DeadLettered {
            sequence_id: m.sequence_id,
            entity_type: m.entity_type,
            entity_id: m.entity_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn transient_failure(&self, m: &PendingMutation, reason: &str, report: &mut SyncReport) -> Result<()> {
        report.outcome = DrainOutcome::PartialFailure;
        let updated = self.queue.lock()?.record_transient_failure(m.sequence_id, reason, self.config.max_attempts)?;
        let Some(updated) = updated else {
            return Ok(());
        };

        if updated.is_dead_letter() {
            let reason = updated.last_error.clone().unwrap_or_else(|| reason.to_string());
            warn!(sequence_id = m.sequence_id, attempts = updated.attempts, "retries exhausted");
            report.dead_lettered += 1;
            self.emit(SyncEvent::DeadLettered {
                sequence_id: m.sequence_id,
                entity_type: m.entity_type,
                entity_id: m.entity_id.clone(),
                reason,
            });
        }

        let delay = self.config.backoff_for(updated.attempts);
        info!(sequence_id = m.sequence_id, attempts = updated.attempts, ?delay, error = reason, "transient failure, backing off");
        report.retry_after = Some(delay);
        self.emit(SyncEvent::RetryScheduled { sequence_id: m.sequence_id, attempts: updated.attempts, delay });
        Ok(())
    }

    /// Refreshes local rows of `entity_type` from the server. Rows with queued
    /// local mutations are left alone. Returns how many rows were written.
    pub async fn pull(&self, entity_type: EntityType, owner_id: Option<&str>) -> Result<usize> {
        if !self.is_online() {
            return Ok(0);
        }
        let Some(token) = self.auth.token() else {
            return Ok(0);
        };

        let records = match tokio::time::timeout(
            self.config.request_timeout,
            self.remote.list(entity_type, owner_id, &token),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(RemoteError::Transient("list request timed out".to_string()).into()),
        };

        let owner_field = entity_type.owner_field();
        let mut applied = 0;
        let mut store = self.queue.lock()?;
        for record in records {
            let owner = record.payload
                .get(owner_field)
                .and_then(Value::as_str)
                .or(owner_id)
                .unwrap_or_default()
                .to_string();
            if store.upsert_canonical(entity_type, &record.id, &owner, record.payload)? {
                applied += 1;
            }
        }
        debug!(entity_type = %entity_type, applied, "pulled canonical records");
        Ok(applied)
    }
}

impl<S: Storage + 'static> SyncEngine<S> {
    /// Starts the background runner. It drains on connectivity restoration,
    /// manual requests, new local writes while online and expired backoff.
    pub fn spawn(
        self: Arc<Self>,
        connectivity: Option<broadcast::Receiver<ConnectivityEvent>>,
    ) -> (SyncHandle<S>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = SyncHandle { engine: self.clone(), commands: tx };
        let task = tokio::spawn(run_background(self, rx, connectivity));
        (handle, task)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    SyncNow,
    Cancel,
    Shutdown,
}

enum Wake {
    Command(Option<Command>),
    Connectivity(std::result::Result<ConnectivityEvent, broadcast::error::RecvError>),
    Enqueued,
    RetryDue,
}

async fn next_connectivity(
    rx: &mut Option<broadcast::Receiver<ConnectivityEvent>>,
) -> std::result::Result<ConnectivityEvent, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_background<S: Storage + 'static>(
    engine: Arc<SyncEngine<S>>,
    mut commands: mpsc::Receiver<Command>,
    mut connectivity: Option<broadcast::Receiver<ConnectivityEvent>>,
) {
    let enqueued: Arc<Notify> = engine.queue.enqueued();
    let mut retry_at: Option<Instant> = None;
    let mut shutdown = false;

    if engine.is_online() {
        retry_at = run_once(&engine, SyncTrigger::Startup, &mut commands, &mut shutdown).await;
    }

    while !shutdown {
        let wake = tokio::select! {
            cmd = commands.recv() => Wake::Command(cmd),
            event = next_connectivity(&mut connectivity) => Wake::Connectivity(event),
            _ = enqueued.notified() => Wake::Enqueued,
            _ = retry_due(retry_at) => Wake::RetryDue,
        };

        let trigger = match wake {
            Wake::Command(Some(Command::SyncNow)) => SyncTrigger::Manual,
            Wake::Command(Some(Command::Cancel)) => continue,
            Wake::Command(Some(Command::Shutdown)) | Wake::Command(None) => break,
            Wake::Connectivity(Ok(ConnectivityEvent::Online)) => {
                engine.set_online(true);
                retry_at = None;
                SyncTrigger::ConnectivityRestored
            }
            Wake::Connectivity(Ok(ConnectivityEvent::Offline)) => {
                engine.set_online(false);
                continue;
            }
            Wake::Connectivity(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "connectivity events lagged");
                continue;
            }
            Wake::Connectivity(Err(broadcast::error::RecvError::Closed)) => {
                connectivity = None;
                continue;
            }
            Wake::Enqueued => {
                if let Err(e) = engine.refresh_status() {
                    warn!(error = %e, "could not read queue counts");
                }
                if retry_at.is_some_and(|at| at > Instant::now()) {
                    continue;
                }
                SyncTrigger::Enqueued
            }
            Wake::RetryDue => {
                retry_at = None;
                SyncTrigger::Retry
            }
        };

        if engine.is_online() {
            retry_at = run_once(&engine, trigger, &mut commands, &mut shutdown).await;
        }
    }
    debug!("sync runner stopped");
}

/// Drives one run while still answering commands, so a cancel or shutdown
/// lands between mutations of the active run.
async fn run_once<S: Storage + 'static>(
    engine: &Arc<SyncEngine<S>>,
    trigger: SyncTrigger,
    commands: &mut mpsc::Receiver<Command>,
    shutdown: &mut bool,
) -> Option<Instant> {
    let run = engine.sync_now(trigger);
    tokio::pin!(run);
    let mut commands_open = true;

    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            cmd = commands.recv(), if commands_open => match cmd {
                Some(Command::SyncNow) => engine.rerun.store(true, Ordering::SeqCst),
                Some(Command::Cancel) => engine.cancel(),
                Some(Command::Shutdown) | None => {
                    commands_open = cmd.is_some();
                    *shutdown = true;
                    engine.cancel();
                }
            },
        }
    };

    match result {
        Ok(report) => report.retry_after.map(|delay| Instant::now() + delay),
        Err(e) => {
            error!(error = %e, ?trigger, "sync run failed");
            None
        }
    }
}

/// UI-facing surface of a running engine.
pub struct SyncHandle<S: Storage> {
    engine: Arc<SyncEngine<S>>,
    commands: mpsc::Sender<Command>,
}

impl<S: Storage> Clone for SyncHandle<S> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), commands: self.commands.clone() }
    }
}

impl<S: Storage> SyncHandle<S> {
    pub fn engine(&self) -> &Arc<SyncEngine<S>> {
        &self.engine
    }

    fn send(&self, command: Command) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            // A full channel already holds a request that will cause a run.
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => debug!(?command, "sync runner already stopped"),
        }
    }

    pub fn trigger_manual_sync(&self) {
        self.send(Command::SyncNow);
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    pub fn list_pending_mutations(&self) -> Result<Vec<PendingItem>> {
        Ok(self.engine.queue.pending()?.iter().map(pending_item).collect())
    }

    pub fn list_dead_letters(&self) -> Result<Vec<PendingItem>> {
        Ok(self.engine.queue.dead_letters()?.iter().map(pending_item).collect())
    }

    /// Discards a dead-lettered mutation. The entity's local row keeps the
    /// rejected write; a later pull restores the server's copy.
    pub fn clear_dead_letter(&self, sequence_id: u64) -> Result<bool> {
        let cleared = self.engine.queue.clear_dead_letter(sequence_id)?;
        if cleared {
            info!(sequence_id, "dead letter cleared by user");
            self.engine.refresh_status()?;
        }
        Ok(cleared)
    }

    pub fn requeue_dead_letter(&self, sequence_id: u64) -> Result<bool> {
        let requeued = self.engine.queue.requeue_dead_letter(sequence_id)?;
        if requeued {
            info!(sequence_id, "dead letter requeued by user");
            self.engine.refresh_status()?;
        }
        Ok(requeued)
    }

    pub fn is_online(&self) -> bool {
        self.engine.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.engine.is_syncing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.engine.status()
    }
}

pub fn describe(m: &PendingMutation) -> String {
    let verb = match m.action {
        MutationAction::Create => "Create",
        MutationAction::Update => "Update",
        MutationAction::Delete => "Delete",
    };
    format!("{} {} {}", verb, m.entity_type, m.entity_id)
}

fn pending_item(m: &PendingMutation) -> PendingItem {
    PendingItem {
        sequence_id: m.sequence_id,
        entity_type: m.entity_type,
        description: describe(m),
        created_at: m.created_at,
        attempts: m.attempts,
        last_error: m.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::auth::StaticToken;
    use crate::entity::{Booking, Prediction, PredictionStatus, Tractor, TractorModel};
    use crate::remote::{InMemoryRemote, RemoteCall};
    use crate::repository::{BookingRepository, PredictionRepository, TractorRepository};
    use crate::storage::MemoryStorage;
    use crate::store::LocalStore;

    fn tractor(hours: f64) -> Tractor {
        Tractor::new("coop-1", TractorModel::Mf240, "SN-001", hours)
    }

    fn booking() -> Booking {
        Booking {
            tractor_id: "SRV-7".into(),
            member_id: "member-1".into(),
            coop_id: "coop-1".into(),
            start_date: "2024-05-01".into(),
            end_date: "2024-05-02".into(),
            booking_status: "pending".into(),
            payment_status: "unpaid".into(),
            payment_amount_rwf: 20_000,
        }
    }

    fn engine_with(remote: Arc<InMemoryRemote>, auth: StaticToken, config: SyncConfig) -> Arc<SyncEngine<MemoryStorage>> {
        let queue = MutationQueue::new(LocalStore::volatile());
        let engine = SyncEngine::new(queue, remote, Arc::new(auth), config);
        engine.set_online(true);
        Arc::new(engine)
    }

    fn engine(remote: Arc<InMemoryRemote>) -> Arc<SyncEngine<MemoryStorage>> {
        engine_with(remote, StaticToken::new("token"), SyncConfig::default())
    }

    fn tractors(engine: &SyncEngine<MemoryStorage>) -> TractorRepository<MemoryStorage> {
        TractorRepository::new(engine.queue().clone())
    }

    #[tokio::test]
    async fn test_create_then_update_drains_under_server_id() {
        let remote = Arc::new(InMemoryRemote::starting_at(42));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        let mut events = engine.subscribe();

        let created = repo.create(tractor(100.0)).unwrap();
        repo.update(&created.id, tractor(120.0)).unwrap();

        let report = engine.sync_now(SyncTrigger::ConnectivityRestored).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Success);
        assert_eq!(report.acked, 2);
        assert_eq!(report.remapped, 1);

        assert_eq!(remote.get(EntityType::Tractor, "SRV-42").unwrap()["engine_hours"], 120.0);
        assert_eq!(remote.len(), 1);
        assert_eq!(remote.calls()[1], RemoteCall {
            action: MutationAction::Update,
            entity_type: EntityType::Tractor,
            entity_id: Some("SRV-42".into()),
        });

        let local = repo.get_by_id("SRV-42").unwrap().unwrap();
        assert!(local.synced);
        assert_eq!(local.data.engine_hours, 120.0);
        assert!(repo.get_by_id(&created.id).unwrap().is_none());
        assert!(engine.queue().pending().unwrap().is_empty());
        assert_eq!(engine.cursor().unwrap().last_acked, Some(2));

        let mut remapped = false;
        while let Ok(event) = events.try_recv() {
            if let SyncEvent::IdRemapped { from, to, .. } = event {
                assert_eq!(from, created.id);
                assert_eq!(to, "SRV-42");
                remapped = true;
            }
        }
        assert!(remapped);
    }

    #[tokio::test]
    async fn test_transient_failure_backs_off_and_keeps_mutation() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        repo.create(tractor(1.0)).unwrap();

        remote.fail_next(RemoteError::Transient("HTTP 503: unavailable".into()));
        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::PartialFailure);
        assert_eq!(report.retry_after, Some(engine.config().backoff_for(1)));

        let pending = engine.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("503"));

        let report = engine.sync_now(SyncTrigger::Retry).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Success);
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_dead_letter() {
        let remote = Arc::new(InMemoryRemote::new());
        let config = SyncConfig::default().with_max_attempts(2);
        let engine = engine_with(remote.clone(), StaticToken::new("token"), config);
        tractors(&engine).create(tractor(1.0)).unwrap();

        remote.fail_next(RemoteError::Transient("timeout".into()));
        remote.fail_next(RemoteError::Transient("timeout".into()));
        engine.sync_now(SyncTrigger::Manual).await.unwrap();
        let report = engine.sync_now(SyncTrigger::Retry).await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        let dead = engine.queue().dead_letters().unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("retries exhausted"));
        assert_eq!(*engine.status().borrow(), SyncStatus {
            phase: SyncPhase::Idle,
            is_online: true,
            pending_count: 0,
            dead_letter_count: 1,
        });
    }

    #[tokio::test]
    async fn test_rejection_dead_letters_only_that_entity() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        let bookings = BookingRepository::new(engine.queue().clone());

        remote.insert(EntityType::Tractor, "SRV-7", serde_json::to_value(tractor(10.0)).unwrap());
        engine.queue().lock().unwrap()
            .upsert_canonical(EntityType::Tractor, "SRV-7", "coop-1", serde_json::to_value(tractor(10.0)).unwrap())
            .unwrap();
        remote.reject_entity(EntityType::Tractor, "SRV-7", 409, "serial number already registered");

        repo.update("SRV-7", tractor(11.0)).unwrap();
        bookings.create(booking()).unwrap();
        repo.update("SRV-7", tractor(12.0)).unwrap();

        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::PartialFailure);
        assert_eq!(report.acked, 1);
        assert_eq!(report.dead_lettered, 1);

        let dead = engine.queue().dead_letters().unwrap();
        assert_eq!(dead[0].sequence_id, 1);
        assert!(dead[0].last_error.as_deref().unwrap().contains("409"));
        let held: Vec<u64> = engine.queue().pending().unwrap().iter().map(|m| m.sequence_id).collect();
        assert_eq!(held, vec![3]);
        assert!(!repo.get_by_id("SRV-7").unwrap().unwrap().synced);

        remote.accept_entity(EntityType::Tractor, "SRV-7");
        assert!(engine.queue().clear_dead_letter(1).unwrap());
        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Success);
        assert_eq!(remote.get(EntityType::Tractor, "SRV-7").unwrap()["engine_hours"], 12.0);
        assert!(repo.get_by_id("SRV-7").unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_missing_or_refused_token_defers() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine_with(remote.clone(), StaticToken::empty(), SyncConfig::default());
        tractors(&engine).create(tractor(1.0)).unwrap();

        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Deferred);
        assert!(remote.calls().is_empty());

        let engine = self::engine(remote.clone());
        tractors(&engine).create(tractor(1.0)).unwrap();
        remote.fail_next(RemoteError::Unauthorized);
        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Deferred);
        assert_eq!(engine.queue().pending().unwrap()[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_offline_skips_drain() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine(remote.clone());
        tractors(&engine).create(tractor(1.0)).unwrap();
        engine.set_online(false);

        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Offline);
        assert!(remote.calls().is_empty());
        assert_eq!(engine.queue().pending_count().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_lands_between_mutations() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(50)));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        for hours in [1.0, 2.0, 3.0] {
            repo.create(tractor(hours)).unwrap();
        }

        let (report, _) = tokio::join!(engine.sync_now(SyncTrigger::Manual), async {
            tokio::time::sleep(Duration::from_millis(70)).await;
            engine.cancel();
        });
        let report = report.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Cancelled);
        assert_eq!(report.acked, 2);
        assert_eq!(engine.queue().pending_count().unwrap(), 1);
        assert_eq!(remote.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_going_offline_mid_batch_leaves_rest_queued() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(50)));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        for hours in [1.0, 2.0, 3.0] {
            repo.create(tractor(hours)).unwrap();
        }
        let mut events = engine.subscribe();

        let (report, _) = tokio::join!(engine.sync_now(SyncTrigger::Manual), async {
            while let Ok(event) = events.recv().await {
                if matches!(event, SyncEvent::Acked { .. }) {
                    engine.set_online(false);
                    break;
                }
            }
        });
        let report = report.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Offline);
        assert_eq!(report.acked, 2);
        assert_eq!(remote.len(), 2);

        let pending = engine.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
        assert!(pending[0].last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_request_counts_as_transient() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_secs(10)));
        let config = SyncConfig::default().with_request_timeout(Duration::from_secs(1));
        let engine = engine_with(remote.clone(), StaticToken::new("token"), config);
        tractors(&engine).create(tractor(1.0)).unwrap();

        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::PartialFailure);
        assert_eq!(report.retry_after, Some(engine.config().backoff_for(1)));
        assert!(remote.is_empty());

        let pending = engine.queue().pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap().contains("timed out"));
        assert!(engine.queue().dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prediction_for_offline_tractor_follows_server_id() {
        let remote = Arc::new(InMemoryRemote::starting_at(42));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        let predictions = PredictionRepository::new(engine.queue().clone());

        let created = repo.create(tractor(480.0)).unwrap();
        predictions
            .create(Prediction {
                tractor_id: created.id.clone(),
                task_name: "engine oil change".into(),
                description: None,
                status: PredictionStatus::DueSoon,
                urgency_level: 2,
                hours_remaining: 20.0,
                recommendation: None,
            })
            .unwrap();

        let report = engine.sync_now(SyncTrigger::Manual).await.unwrap();
        assert_eq!(report.outcome, DrainOutcome::Success);
        assert_eq!(report.acked, 2);

        assert_eq!(remote.get(EntityType::Prediction, "SRV-43").unwrap()["tractor_id"], "SRV-42");
        let local = predictions.list_by_owner("SRV-42").unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].data.tractor_id, "SRV-42");
        assert!(local[0].synced);
        assert!(predictions.list_by_owner(&created.id).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_is_coalesced() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(20)));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        repo.create(tractor(1.0)).unwrap();

        let (first, second) = tokio::join!(engine.sync_now(SyncTrigger::Manual), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            repo.create(tractor(2.0)).unwrap();
            engine.sync_now(SyncTrigger::Enqueued).await
        });
        assert_eq!(second.unwrap().outcome, DrainOutcome::Coalesced);
        let first = first.unwrap();
        assert_eq!(first.outcome, DrainOutcome::Success);
        assert_eq!(first.acked, 2);
        assert!(!engine.is_syncing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_acked_after_local_delete_is_compensated() {
        let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(50)));
        let engine = engine(remote.clone());
        let repo = tractors(&engine);
        let created = repo.create(tractor(1.0)).unwrap();

        let (report, deleted) = tokio::join!(engine.sync_now(SyncTrigger::Manual), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            repo.delete(&created.id)
        });
        deleted.unwrap();
        report.unwrap();

        assert!(remote.is_empty());
        let actions: Vec<MutationAction> = remote.calls().iter().map(|c| c.action).collect();
        assert_eq!(actions, vec![MutationAction::Create, MutationAction::Delete]);
        assert!(engine.queue().lock().unwrap().all_mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_skips_rows_with_local_writes() {
        let remote = Arc::new(InMemoryRemote::new());
        let engine = engine(remote.clone());
        let repo = tractors(&engine);

        let mut other = tractor(5.0);
        other.coop_id = "coop-2".into();
        remote.insert(EntityType::Tractor, "SRV-1", json!({
            "id": "SRV-1", "coop_id": "coop-1", "model": "MF_375", "serial_number": "A", "engine_hours": 40.0
        }));
        remote.insert(EntityType::Tractor, "SRV-2", serde_json::to_value(&other).unwrap());

        assert_eq!(engine.pull(EntityType::Tractor, Some("coop-1")).await.unwrap(), 1);
        let pulled = repo.get_by_id("SRV-1").unwrap().unwrap();
        assert!(pulled.synced);
        assert_eq!(pulled.data.model, TractorModel::Mf375);
        assert!(repo.get_by_id("SRV-2").unwrap().is_none());

        repo.update("SRV-1", tractor(41.0)).unwrap();
        assert_eq!(engine.pull(EntityType::Tractor, Some("coop-1")).await.unwrap(), 0);
        assert_eq!(repo.get_by_id("SRV-1").unwrap().unwrap().data.engine_hours, 41.0);
    }

    #[tokio::test]
    async fn test_runner_drains_when_connectivity_returns() {
        let remote = Arc::new(InMemoryRemote::new());
        let queue = MutationQueue::new(LocalStore::volatile());
        let repo = TractorRepository::new(queue.clone());
        repo.create(tractor(5.0)).unwrap();

        let engine = Arc::new(SyncEngine::new(
            queue,
            remote.clone(),
            Arc::new(StaticToken::new("token")),
            SyncConfig::default(),
        ));
        let mut events = engine.subscribe();
        let (tx, rx) = broadcast::channel(4);
        let (handle, task) = engine.clone().spawn(Some(rx));

        let pending = handle.list_pending_mutations().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].description.starts_with("Create tractor local-"));

        tx.send(ConnectivityEvent::Online).unwrap();
        loop {
            if let SyncEvent::RunFinished(report) = events.recv().await.unwrap() {
                assert_eq!(report.trigger, SyncTrigger::ConnectivityRestored);
                assert_eq!(report.acked, 1);
                break;
            }
        }
        assert!(handle.is_online());
        assert!(handle.list_pending_mutations().unwrap().is_empty());
        assert_eq!(handle.status().borrow().pending_count, 0);

        handle.shutdown();
        task.await.unwrap();
    }
}
