use std::marker::PhantomData;

use crate::entity::{new_temp_id, Booking, DomainEntity, Entity, MutationAction, Prediction, Tractor};
use crate::error::{Error, Result};
use crate::queue::MutationQueue;
use crate::storage::{EntityFilter, EntityRecord, Storage};
use crate::store::{LocalWrite, WriteOutcome};

/// Read/write access to one entity type.
///
/// Writes land in the local store and the mutation log in one transaction and
/// return without touching the network. Reads never leave the device.
pub struct Repository<T: DomainEntity, S: Storage> {
    queue: MutationQueue<S>,
    _entity: PhantomData<fn() -> T>,
}

pub type TractorRepository<S> = Repository<Tractor, S>;
pub type PredictionRepository<S> = Repository<Prediction, S>;
pub type BookingRepository<S> = Repository<Booking, S>;

impl<T: DomainEntity, S: Storage> Clone for Repository<T, S> {
    fn clone(&self) -> Self {
        Self { queue: self.queue.clone(), _entity: PhantomData }
    }
}

impl<T: DomainEntity, S: Storage> Repository<T, S> {
    pub fn new(queue: MutationQueue<S>) -> Self {
        Self { queue, _entity: PhantomData }
    }

    /// Creates the entity under a fresh temporary id. The id is replaced by
    /// the server-assigned one once the Create is acknowledged.
    pub fn create(&self, data: T) -> Result<Entity<T>> {
        data.validate()?;
        let id = new_temp_id();
        self.write(id, MutationAction::Create, &data)
    }

    pub fn update(&self, id: &str, data: T) -> Result<Entity<T>> {
        data.validate()?;
        self.write(id.to_string(), MutationAction::Update, &data)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let write = LocalWrite {
            entity_type: T::ENTITY_TYPE,
            entity_id: id.to_string(),
            owner_id: String::new(),
            action: MutationAction::Delete,
            payload: serde_json::Value::Null,
        };
        self.queue.enqueue(write)?;
        Ok(())
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Entity<T>>> {
        let record = self.queue.lock()?.get(T::ENTITY_TYPE, id)?;
        record.map(decode).transpose()
    }

    pub fn list_by_owner(&self, owner_id: &str) -> Result<Vec<Entity<T>>> {
        let filter = EntityFilter::of_type(T::ENTITY_TYPE).owned_by(owner_id);
        self.list(&filter)
    }

    pub fn list_unsynced(&self) -> Result<Vec<Entity<T>>> {
        self.list(&EntityFilter::of_type(T::ENTITY_TYPE).unsynced())
    }

    fn list(&self, filter: &EntityFilter) -> Result<Vec<Entity<T>>> {
        let records = self.queue.lock()?.list(filter)?;
        records.into_iter().map(decode).collect()
    }

    fn write(&self, id: String, action: MutationAction, data: &T) -> Result<Entity<T>> {
        let write = LocalWrite {
            entity_type: T::ENTITY_TYPE,
            entity_id: id,
            owner_id: data.owner_id().to_string(),
            action,
            payload: serde_json::to_value(data)?,
        };
        match self.queue.enqueue(write)? {
            WriteOutcome::Queued { record: Some(record), .. } => decode(record),
            other => Err(Error::LocalStorage(format!("unexpected write outcome {:?}", other))),
        }
    }
}

fn decode<T: DomainEntity>(record: EntityRecord) -> Result<Entity<T>> {
    Ok(Entity {
        data: serde_json::from_value(record.payload)?,
        id: record.entity_id,
        synced: record.synced,
        local_revision: record.local_revision,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{is_temp_id, TractorModel};
    use crate::store::LocalStore;

    fn repo() -> TractorRepository<crate::storage::MemoryStorage> {
        Repository::new(MutationQueue::new(LocalStore::volatile()))
    }

    #[test]
    fn test_create_returns_immediately_with_temp_id() {
        let tractors = repo();
        let t = tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "SN-1", 100.0)).unwrap();
        assert!(is_temp_id(&t.id));
        assert!(!t.synced);
        assert_eq!(t.local_revision, 1);

        let read = tractors.get_by_id(&t.id).unwrap().unwrap();
        assert_eq!(read, t);
    }

    #[test]
    fn test_invalid_payload_writes_nothing() {
        let tractors = repo();
        let err = tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "", 1.0)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(tractors.queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_list_by_owner() {
        let tractors = repo();
        tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "A", 1.0)).unwrap();
        tractors.create(Tractor::new("coop-1", TractorModel::Mf375, "B", 2.0)).unwrap();
        tractors.create(Tractor::new("coop-2", TractorModel::Mf240, "C", 3.0)).unwrap();

        let owned = tractors.list_by_owner("coop-1").unwrap();
        assert_eq!(owned.len(), 2);
        assert!(owned.iter().all(|t| t.data.coop_id == "coop-1"));
        assert_eq!(tractors.list_unsynced().unwrap().len(), 3);
    }

    #[test]
    fn test_update_and_delete() {
        let tractors = repo();
        let t = tractors.create(Tractor::new("coop-1", TractorModel::Mf240, "SN", 100.0)).unwrap();

        let mut data = t.data.clone();
        data.engine_hours = 120.0;
        let updated = tractors.update(&t.id, data).unwrap();
        assert_eq!(updated.local_revision, 2);
        assert_eq!(updated.data.engine_hours, 120.0);

        tractors.delete(&t.id).unwrap();
        assert!(tractors.get_by_id(&t.id).unwrap().is_none());
        assert!(matches!(tractors.delete(&t.id), Err(Error::NotFound { .. })));
    }
}
