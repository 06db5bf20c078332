use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::entity::EntityType;
use crate::error::{Error, Result};
use crate::storage::{PendingMutation, Storage};
use crate::store::{LocalStore, LocalWrite, WriteOutcome};

pub type SharedStore<S> = Arc<Mutex<LocalStore<S>>>;

pub(crate) fn lock_store<S: Storage>(store: &SharedStore<S>) -> Result<MutexGuard<'_, LocalStore<S>>> {
    store
        .lock()
        .map_err(|_| Error::LocalStorage("local store lock poisoned".to_string()))
}

/// FIFO view over the pending-mutation log.
///
/// The log itself is the only state; the queue can be dropped and rebuilt
/// from the store at any time and resumes from the same unacked set.
pub struct MutationQueue<S: Storage> {
    store: SharedStore<S>,
    enqueued: Arc<Notify>,
}

impl<S: Storage> Clone for MutationQueue<S> {
    fn clone(&self) -> Self {
        Self { store: self.store.clone(), enqueued: self.enqueued.clone() }
    }
}

impl<S: Storage> MutationQueue<S> {
    pub fn new(store: LocalStore<S>) -> Self {
        Self::from_shared(Arc::new(Mutex::new(store)))
    }

    pub fn from_shared(store: SharedStore<S>) -> Self {
        Self { store, enqueued: Arc::new(Notify::new()) }
    }

    pub fn store(&self) -> &SharedStore<S> {
        &self.store
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, LocalStore<S>>> {
        lock_store(&self.store)
    }

    pub(crate) fn enqueued(&self) -> Arc<Notify> {
        self.enqueued.clone()
    }

    pub(crate) fn enqueue(&self, write: LocalWrite) -> Result<WriteOutcome> {
        let outcome = self.lock()?.commit_local_write(write)?;
        if matches!(outcome, WriteOutcome::Queued { .. }) {
            self.enqueued.notify_one();
        }
        Ok(outcome)
    }

    /// Up to `max` pending mutations in ascending sequence order. Entities
    /// with a dead-lettered mutation are held back until the user resolves it.
    pub fn next_batch(&self, max: usize) -> Result<Vec<PendingMutation>> {
        let all = self.lock()?.all_mutations()?;
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();
        let mut batch = Vec::new();

        for m in all {
            if batch.len() >= max {
                break;
            }
            let key = (m.entity_type, m.entity_id.clone());
            if m.is_dead_letter() {
                blocked.insert(key);
            } else if !blocked.contains(&key) {
                batch.push(m);
            }
        }
        Ok(batch)
    }

    pub fn peek(&self) -> Result<Option<PendingMutation>> {
        Ok(self.next_batch(1)?.into_iter().next())
    }

    pub fn ack(&self, sequence_id: u64) -> Result<bool> {
        self.lock()?.ack_mutation(sequence_id)
    }

    pub fn pending(&self) -> Result<Vec<PendingMutation>> {
        self.lock()?.pending_mutations()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    pub fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
        self.lock()?.dead_letters()
    }

    pub fn clear_dead_letter(&self, sequence_id: u64) -> Result<bool> {
        self.lock()?.clear_dead_letter(sequence_id)
    }

    pub fn requeue_dead_letter(&self, sequence_id: u64) -> Result<bool> {
        let requeued = self.lock()?.requeue_dead_letter(sequence_id)?;
        if requeued {
            self.enqueued.notify_one();
        }
        Ok(requeued)
    }

    pub fn lowest_unacked(&self) -> Result<Option<u64>> {
        Ok(self.lock()?.pending_mutations()?.first().map(|m| m.sequence_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MutationAction;
    use serde_json::json;

    fn write(ty: EntityType, id: &str, action: MutationAction) -> LocalWrite {
        LocalWrite {
            entity_type: ty,
            entity_id: id.to_string(),
            owner_id: "owner".to_string(),
            action,
            payload: json!({}),
        }
    }

    fn queued(outcome: WriteOutcome) -> u64 {
        match outcome {
            WriteOutcome::Queued { sequence_id, .. } => sequence_id,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_next_batch_preserves_order_and_limit() {
        let queue = MutationQueue::new(LocalStore::volatile());
        let mut seqs = Vec::new();
        for i in 0..5 {
            seqs.push(queued(queue.enqueue(write(EntityType::Tractor, &format!("SRV-{}", i), MutationAction::Create)).unwrap()));
        }

        let batch = queue.next_batch(3).unwrap();
        assert_eq!(batch.iter().map(|m| m.sequence_id).collect::<Vec<_>>(), seqs[..3].to_vec());
        assert_eq!(queue.peek().unwrap().unwrap().sequence_id, seqs[0]);
        assert_eq!(queue.lowest_unacked().unwrap(), Some(seqs[0]));
    }

    #[test]
    fn test_dead_letter_blocks_only_its_entity() {
        let queue = MutationQueue::new(LocalStore::volatile());
        let s1 = queued(queue.enqueue(write(EntityType::Tractor, "T2", MutationAction::Create)).unwrap());
        let s2 = queued(queue.enqueue(write(EntityType::Tractor, "T2", MutationAction::Update)).unwrap());
        let s3 = queued(queue.enqueue(write(EntityType::Booking, "B1", MutationAction::Create)).unwrap());

        queue.lock().unwrap().dead_letter(s1, "HTTP 409").unwrap();

        let batch: Vec<u64> = queue.next_batch(10).unwrap().iter().map(|m| m.sequence_id).collect();
        assert_eq!(batch, vec![s3]);
        assert_eq!(queue.pending_count().unwrap(), 2, "s2 stays pending behind the dead letter");

        assert!(queue.clear_dead_letter(s1).unwrap());
        let batch: Vec<u64> = queue.next_batch(10).unwrap().iter().map(|m| m.sequence_id).collect();
        assert_eq!(batch, vec![s2, s3]);
    }

    #[test]
    fn test_ack_twice_is_noop() {
        let queue = MutationQueue::new(LocalStore::volatile());
        let s1 = queued(queue.enqueue(write(EntityType::Tractor, "SRV-1", MutationAction::Create)).unwrap());
        assert!(queue.ack(s1).unwrap());
        assert!(!queue.ack(s1).unwrap());
        assert!(!queue.ack(42).unwrap());
        assert!(queue.peek().unwrap().is_none());
    }
}
