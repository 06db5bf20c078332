#[cfg(feature = "sqlite")]
mod sqlite;
mod memory;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
pub use memory::MemoryStorage;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{EntityType, MutationAction};
use crate::error::Result;

/// One row of an entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub owner_id: String,
    pub payload: Value,
    pub synced: bool,
    pub local_revision: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Pending,
    DeadLetter,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::DeadLetter => "dead_letter",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "dead_letter" => MutationState::DeadLetter,
            _ => MutationState::Pending,
        }
    }
}

/// A row of the pending-mutation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub sequence_id: u64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub state: MutationState,
}

impl PendingMutation {
    pub fn is_dead_letter(&self) -> bool {
        self.state == MutationState::DeadLetter
    }

    pub fn targets(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }
}

/// A mutation before the log has assigned it a sequence id.
#[derive(Debug, Clone)]
pub struct NewMutation {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub action: MutationAction,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub owner_id: Option<String>,
    pub unsynced_only: bool,
}

impl EntityFilter {
    pub fn of_type(entity_type: EntityType) -> Self {
        Self { entity_type: Some(entity_type), ..Default::default() }
    }

    pub fn owned_by(mut self, owner_id: &str) -> Self {
        self.owner_id = Some(owner_id.to_string());
        self
    }

    pub fn unsynced(mut self) -> Self {
        self.unsynced_only = true;
        self
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        self.entity_type.map_or(true, |t| t == record.entity_type)
            && self.owner_id.as_deref().map_or(true, |o| o == record.owner_id)
            && (!self.unsynced_only || !record.synced)
    }
}

/// Backend contract for the local store: entity rows plus the mutation log.
///
/// Sequence ids handed out by `append_mutation` are strictly increasing and
/// never reused, even after the row holding them is removed.
pub trait Storage: Send {
    fn get_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>>;
    fn put_entity(&mut self, record: &EntityRecord) -> Result<()>;
    fn delete_entity(&mut self, entity_type: EntityType, entity_id: &str) -> Result<bool>;
    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>>;

    fn append_mutation(&mut self, mutation: &NewMutation) -> Result<u64>;
    fn get_mutation(&self, sequence_id: u64) -> Result<Option<PendingMutation>>;
    fn update_mutation(&mut self, mutation: &PendingMutation) -> Result<()>;
    fn remove_mutation(&mut self, sequence_id: u64) -> Result<bool>;
    /// Every log row, any state, ascending by sequence id.
    fn mutations(&self) -> Result<Vec<PendingMutation>>;
    fn mutations_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<PendingMutation>>;

    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;
}

pub(crate) fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
