use std::collections::BTreeMap;

use super::{EntityFilter, EntityRecord, NewMutation, PendingMutation, MutationState, Storage};
use crate::entity::EntityType;
use crate::error::Result;

#[derive(Clone, Default)]
struct State {
    entities: BTreeMap<(EntityType, String), EntityRecord>,
    log: BTreeMap<u64, PendingMutation>,
    last_sequence_id: u64,
}

/// Volatile backend. `begin_transaction` snapshots the state so `rollback`
/// restores it exactly.
#[derive(Default)]
pub struct MemoryStorage {
    state: State,
    snapshot: Option<State>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Option<EntityRecord>> {
        Ok(self.state.entities.get(&(entity_type, entity_id.to_string())).cloned())
    }

    fn put_entity(&mut self, record: &EntityRecord) -> Result<()> {
        self.state
            .entities
            .insert((record.entity_type, record.entity_id.clone()), record.clone());
        Ok(())
    }

    fn delete_entity(&mut self, entity_type: EntityType, entity_id: &str) -> Result<bool> {
        Ok(self.state.entities.remove(&(entity_type, entity_id.to_string())).is_some())
    }

    fn list_entities(&self, filter: &EntityFilter) -> Result<Vec<EntityRecord>> {
        Ok(self.state.entities.values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    fn append_mutation(&mut self, mutation: &NewMutation) -> Result<u64> {
        self.state.last_sequence_id += 1;
        let sequence_id = self.state.last_sequence_id;
        self.state.log.insert(sequence_id, PendingMutation {
            sequence_id,
            entity_type: mutation.entity_type,
            entity_id: mutation.entity_id.clone(),
            action: mutation.action,
            payload: mutation.payload.clone(),
            created_at: mutation.created_at,
            attempts: 0,
            last_error: None,
            state: MutationState::Pending,
        });
        Ok(sequence_id)
    }

    fn get_mutation(&self, sequence_id: u64) -> Result<Option<PendingMutation>> {
        Ok(self.state.log.get(&sequence_id).cloned())
    }

    fn update_mutation(&mut self, mutation: &PendingMutation) -> Result<()> {
        if let Some(row) = self.state.log.get_mut(&mutation.sequence_id) {
            *row = mutation.clone();
        }
        Ok(())
    }

    fn remove_mutation(&mut self, sequence_id: u64) -> Result<bool> {
        Ok(self.state.log.remove(&sequence_id).is_some())
    }

    fn mutations(&self) -> Result<Vec<PendingMutation>> {
        Ok(self.state.log.values().cloned().collect())
    }

    fn mutations_for_entity(&self, entity_type: EntityType, entity_id: &str) -> Result<Vec<PendingMutation>> {
        Ok(self.state.log.values()
            .filter(|m| m.targets(entity_type, entity_id))
            .cloned()
            .collect())
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.state.clone());
        }
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.take() {
            // The sequence counter survives rollback so ids are never handed out twice.
            let last_sequence_id = self.state.last_sequence_id;
            self.state = snapshot;
            self.state.last_sequence_id = last_sequence_id;
        }
        Ok(())
    }
}
