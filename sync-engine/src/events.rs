//! Observable sync state for the UI layer.
//!
//! Discrete happenings go out on a broadcast channel as [`SyncEvent`]s; the
//! current summary is kept in a watch channel as [`SyncStatus`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entity::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    ConnectivityRestored,
    Manual,
    /// Scheduled after a transient failure once the backoff has elapsed.
    Retry,
    /// A local write was queued while online.
    Enqueued,
    Startup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
}

/// How a drain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every eligible mutation was acked.
    Success,
    /// The run stopped on a transient failure or dead-lettered something.
    PartialFailure,
    Offline,
    /// No bearer token, or the server answered 401.
    Deferred,
    Cancelled,
    /// Another run was active; it will loop once more instead.
    Coalesced,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub outcome: DrainOutcome,
    pub acked: usize,
    pub remapped: usize,
    pub dead_lettered: usize,
    /// Set when a transient failure left work behind.
    pub retry_after: Option<Duration>,
}

impl SyncReport {
    pub(crate) fn new(trigger: SyncTrigger, outcome: DrainOutcome) -> Self {
        Self { trigger, outcome, acked: 0, remapped: 0, dead_lettered: 0, retry_after: None }
    }

    pub fn made_progress(&self) -> bool {
        self.acked + self.dead_lettered > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SyncEvent {
    ConnectivityChanged { online: bool },
    RunStarted { trigger: SyncTrigger },
    Acked { sequence_id: u64, entity_type: EntityType, entity_id: String },
    /// A temporary id was replaced by the server's. Rows and queued payloads
    /// that referenced the old id already carry the new one.
    IdRemapped { entity_type: EntityType, from: String, to: String },
    /// Permanent rejection or retries exhausted. Needs user review.
    DeadLettered { sequence_id: u64, entity_type: EntityType, entity_id: String, reason: String },
    RetryScheduled { sequence_id: u64, attempts: u32, delay: Duration },
    RunFinished(SyncReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_online: bool,
    pub pending_count: usize,
    pub dead_letter_count: usize,
}

impl SyncStatus {
    pub fn is_syncing(&self) -> bool {
        self.phase == SyncPhase::Draining
    }
}

/// A queued mutation as shown in the pending list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingItem {
    pub sequence_id: u64,
    pub entity_type: EntityType,
    /// e.g. "Update tractor SRV-42"
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
}
