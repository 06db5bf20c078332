use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::entity::{is_temp_id, EntityType, MutationAction};
use crate::error::{Error, Result};
#[cfg(feature = "sqlite")]
use crate::storage::SqliteStorage;
use crate::storage::{
    EntityFilter, EntityRecord, MemoryStorage, MutationState, NewMutation, PendingMutation, Storage,
};

/// An optimistic local write, applied to the entity table and queued in the
/// mutation log as one unit.
#[derive(Debug, Clone)]
pub(crate) struct LocalWrite {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub owner_id: String,
    pub action: MutationAction,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Queued { sequence_id: u64, record: Option<EntityRecord> },
    /// Delete of a never-synced temporary entity: the row and its queued
    /// Create/Updates were dropped instead of queueing a Delete.
    Collapsed { removed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAck {
    Acked,
    Remapped { from: String, to: String },
    /// The Create's log row was already gone (collapsed by a local delete
    /// while the request was in flight).
    Orphaned,
}

/// The durable local store: entity rows plus the pending-mutation log.
pub struct LocalStore<S: Storage> {
    storage: S,
}

#[cfg(feature = "sqlite")]
impl LocalStore<SqliteStorage> {
    pub fn open(path: &str) -> Result<Self> {
        let storage = SqliteStorage::open(path)?;
        Ok(Self { storage })
    }

    pub fn open_in_memory() -> Result<Self> {
        let storage = SqliteStorage::open_in_memory()?;
        Ok(Self { storage })
    }
}

impl LocalStore<MemoryStorage> {
    pub fn volatile() -> Self {
        Self { storage: MemoryStorage::new() }
    }
}

impl<S: Storage> LocalStore<S> {
    pub fn with_storage(storage: S) -> Self {
        Self { storage }
    }

    fn transaction<T>(&mut self, f: impl FnOnce(&mut S) -> Result<T>) -> Result<T> {
        self.storage.begin_transaction()?;
        match f(&mut self.storage) {
            Ok(value) => {
                self.storage.commit_transaction()?;
                Ok(value)
            }
            Err(e) => {
                self.storage.rollback_transaction()?;
                Err(e)
            }
        }
    }

    pub fn get(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        self.storage.get_entity(entity_type, entity_id)
    }

    pub fn list(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        self.storage.list_entities(filter)
    }

    pub(crate) fn commit_local_write(&mut self, write: LocalWrite) -> Result<WriteOutcome> {
        let outcome = self.transaction(|storage| {
            let existing = storage.get_entity(write.entity_type, &write.entity_id)?;
            let not_found = || Error::NotFound {
                entity_type: write.entity_type.to_string(),
                entity_id: write.entity_id.clone(),
            };

            match write.action {
                MutationAction::Create | MutationAction::Update => {
                    if write.action == MutationAction::Update && existing.is_none() {
                        return Err(not_found());
                    }
                    let record = EntityRecord {
                        entity_type: write.entity_type,
                        entity_id: write.entity_id.clone(),
                        owner_id: write.owner_id.clone(),
                        payload: write.payload.clone(),
                        synced: false,
                        local_revision: existing.map_or(1, |r| r.local_revision + 1),
                        updated_at: Utc::now(),
                    };
                    storage.put_entity(&record)?;
                    let sequence_id = storage.append_mutation(&NewMutation {
                        entity_type: write.entity_type,
                        entity_id: write.entity_id.clone(),
                        action: write.action,
                        payload: write.payload.clone(),
                        created_at: record.updated_at,
                    })?;
                    Ok(WriteOutcome::Queued { sequence_id, record: Some(record) })
                }
                MutationAction::Delete => {
                    if existing.is_none() {
                        return Err(not_found());
                    }
                    let queued = storage.mutations_for_entity(write.entity_type, &write.entity_id)?;
                    let never_synced = is_temp_id(&write.entity_id)
                        && queued.iter().any(|m| m.action == MutationAction::Create);

                    storage.delete_entity(write.entity_type, &write.entity_id)?;

                    if never_synced {
                        for m in &queued {
                            storage.remove_mutation(m.sequence_id)?;
                        }
                        return Ok(WriteOutcome::Collapsed { removed: queued.len() });
                    }

                    let sequence_id = storage.append_mutation(&NewMutation {
                        entity_type: write.entity_type,
                        entity_id: write.entity_id.clone(),
                        action: MutationAction::Delete,
                        payload: Value::Null,
                        created_at: Utc::now(),
                    })?;
                    Ok(WriteOutcome::Queued { sequence_id, record: None })
                }
            }
        })?;

        match &outcome {
            WriteOutcome::Queued { sequence_id, .. } => debug!(
                sequence_id,
                entity_type = %write.entity_type,
                entity_id = %write.entity_id,
                action = %write.action,
                "queued local mutation"
            ),
            WriteOutcome::Collapsed { removed } => info!(
                entity_type = %write.entity_type,
                entity_id = %write.entity_id,
                removed,
                "collapsed delete of never-synced entity"
            ),
        }
        Ok(outcome)
    }

    /// Appends a mutation with no accompanying entity write. Used only for the
    /// compensating Delete of an orphaned server-side Create.
    pub(crate) fn append_mutation(&mut self, mutation: NewMutation) -> Result<u64> {
        self.transaction(|storage| storage.append_mutation(&mutation))
    }

    pub fn get_mutation(&self, sequence_id: u64) -> Result<Option<PendingMutation>> {
        self.storage.get_mutation(sequence_id)
    }

    /// Every log row, pending and dead-lettered, ascending.
    pub fn all_mutations(&self) -> Result<Vec<PendingMutation>> {
        self.storage.mutations()
    }

    pub fn pending_mutations(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.storage.mutations()?
            .into_iter()
            .filter(|m| m.state == MutationState::Pending)
            .collect())
    }

    pub fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.storage.mutations()?
            .into_iter()
            .filter(|m| m.is_dead_letter())
            .collect())
    }

    pub fn has_mutations_for(&self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        Ok(!self.storage.mutations_for_entity(entity_type, entity_id)?.is_empty())
    }

    /// Removes a log row. Acking an id that is already gone is a no-op.
    pub fn ack_mutation(&mut self, sequence_id: u64) -> Result<bool> {
        self.transaction(|storage| ack_in(storage, sequence_id))
    }

    /// Acks a successful Create and, when the server assigned a different id,
    /// rewrites the entity row, every queued mutation and every reference
    /// held by dependent rows to use it.
    pub(crate) fn ack_create(
        &mut self,
        sequence_id: u64,
        entity_type: EntityType,
        local_id: &str,
        server_id: &str,
    ) -> Result<CreateAck> {
        self.transaction(|storage| {
            if storage.get_mutation(sequence_id)?.is_none() {
                return Ok(CreateAck::Orphaned);
            }
            let remapped = local_id != server_id;
            if remapped {
                remap_in(storage, entity_type, local_id, server_id)?;
            }
            ack_in(storage, sequence_id)?;
            Ok(if remapped {
                CreateAck::Remapped { from: local_id.to_string(), to: server_id.to_string() }
            } else {
                CreateAck::Acked
            })
        })
    }

    pub fn remap_entity_id(&mut self, entity_type: EntityType, from: &str, to: &str) -> Result<usize> {
        self.transaction(|storage| remap_in(storage, entity_type, from, to))
    }

    /// Counts a transient failure against a mutation. Once `max_attempts` is
    /// reached the mutation moves to the dead-letter view.
    pub(crate) fn record_transient_failure(
        &mut self,
        sequence_id: u64,
        error: &str,
        max_attempts: u32,
    ) -> Result<Option<PendingMutation>> {
        self.transaction(|storage| {
            let Some(mut m) = storage.get_mutation(sequence_id)? else {
                return Ok(None);
            };
            m.attempts += 1;
            if m.attempts >= max_attempts {
                m.state = MutationState::DeadLetter;
                m.last_error = Some(format!("retries exhausted after {} attempts: {}", m.attempts, error));
            } else {
                m.last_error = Some(error.to_string());
            }
            storage.update_mutation(&m)?;
            Ok(Some(m))
        })
    }

    pub(crate) fn dead_letter(&mut self, sequence_id: u64, reason: &str) -> Result<Option<PendingMutation>> {
        self.transaction(|storage| {
            let Some(mut m) = storage.get_mutation(sequence_id)? else {
                return Ok(None);
            };
            m.attempts += 1;
            m.state = MutationState::DeadLetter;
            m.last_error = Some(reason.to_string());
            storage.update_mutation(&m)?;
            Ok(Some(m))
        })
    }

    /// Discards a dead-lettered mutation at the user's request. Pending
    /// mutations are never discarded this way.
    pub fn clear_dead_letter(&mut self, sequence_id: u64) -> Result<bool> {
        self.transaction(|storage| match storage.get_mutation(sequence_id)? {
            Some(m) if m.is_dead_letter() => ack_in(storage, sequence_id),
            _ => Ok(false),
        })
    }

    /// Moves a dead-lettered mutation back into the active queue.
    pub fn requeue_dead_letter(&mut self, sequence_id: u64) -> Result<bool> {
        self.transaction(|storage| match storage.get_mutation(sequence_id)? {
            Some(mut m) if m.is_dead_letter() => {
                m.state = MutationState::Pending;
                m.attempts = 0;
                m.last_error = None;
                storage.update_mutation(&m)?;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    /// Writes a canonical server record. Skipped while local mutations for the
    /// entity are still queued, since the local write is newer.
    pub fn upsert_canonical(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        owner_id: &str,
        payload: Value,
    ) -> Result<bool> {
        self.transaction(|storage| {
            if !storage.mutations_for_entity(entity_type, entity_id)?.is_empty() {
                return Ok(false);
            }
            let existing = storage.get_entity(entity_type, entity_id)?;
            storage.put_entity(&EntityRecord {
                entity_type,
                entity_id: entity_id.to_string(),
                owner_id: owner_id.to_string(),
                payload,
                synced: true,
                local_revision: existing.map_or(0, |r| r.local_revision),
                updated_at: Utc::now(),
            })?;
            Ok(true)
        })
    }
}

fn ack_in<S: Storage>(storage: &mut S, sequence_id: u64) -> Result<bool> {
    let Some(m) = storage.get_mutation(sequence_id)? else {
        return Ok(false);
    };
    storage.remove_mutation(sequence_id)?;
    refresh_synced(storage, m.entity_type, &m.entity_id)?;
    Ok(true)
}

fn refresh_synced<S: Storage>(storage: &mut S, entity_type: EntityType, entity_id: &str) -> Result<()> {
    if let Some(mut record) = storage.get_entity(entity_type, entity_id)? {
        let synced = storage.mutations_for_entity(entity_type, entity_id)?.is_empty();
        if record.synced != synced {
            record.synced = synced;
            storage.put_entity(&record)?;
        }
    }
    Ok(())
}

fn remap_in<S: Storage>(storage: &mut S, entity_type: EntityType, from: &str, to: &str) -> Result<usize> {
    if let Some(mut record) = storage.get_entity(entity_type, from)? {
        storage.delete_entity(entity_type, from)?;
        record.entity_id = to.to_string();
        storage.put_entity(&record)?;
    }
    let queued = storage.mutations_for_entity(entity_type, from)?;
    for mut m in queued.iter().cloned() {
        m.entity_id = to.to_string();
        storage.update_mutation(&m)?;
    }
    remap_references_in(storage, entity_type, from, to)?;
    Ok(queued.len())
}

/// Points rows and log payloads that reference `from` at `to`. Dead letters
/// are included so a requeue sends the server id.
fn remap_references_in<S: Storage>(storage: &mut S, target: EntityType, from: &str, to: &str) -> Result<usize> {
    let mut rewritten = 0;
    for dependent in EntityType::ALL {
        for &(field, referenced) in dependent.reference_fields() {
            if referenced != target {
                continue;
            }
            for mut record in storage.list_entities(&EntityFilter::of_type(dependent))? {
                let owner_matches = dependent.owner_field() == field && record.owner_id == from;
                if !rewrite_reference(&mut record.payload, field, from, to) && !owner_matches {
                    continue;
                }
                if dependent.owner_field() == field {
                    record.owner_id = to.to_string();
                }
                storage.put_entity(&record)?;
                rewritten += 1;
            }
            for mut m in storage.mutations()? {
                if m.entity_type == dependent && rewrite_reference(&mut m.payload, field, from, to) {
                    storage.update_mutation(&m)?;
                    rewritten += 1;
                }
            }
        }
    }
    if rewritten > 0 {
        debug!(%target, from, to, rewritten, "rewrote references to remapped id");
    }
    Ok(rewritten)
}

fn rewrite_reference(payload: &mut Value, field: &str, from: &str, to: &str) -> bool {
    match payload.get_mut(field) {
        Some(value) if value.as_str() == Some(from) => {
            *value = Value::String(to.to_string());
            true
        }
        _ => false,
    }
}
