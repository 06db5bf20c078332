#![allow(dead_code)]

use sync_engine::{
    LocalStore, MemoryStorage, MutationQueue, SqliteStorage, Storage, Tractor, TractorModel, TractorRepository,
};

pub fn generate_tractor(idx: usize) -> Tractor {
    let coops = ["coop-kigali", "coop-huye", "coop-musanze", "coop-rubavu"];
    let model = if idx % 3 == 0 { TractorModel::Mf375 } else { TractorModel::Mf240 };
    let mut tractor = Tractor::new(coops[idx % 4], model, &format!("SN-{:06}", idx), (idx % 5_000) as f64);
    tractor.purchase_date = Some(format!("20{:02}-0{}-1{}", 10 + idx % 14, 1 + idx % 9, idx % 10));
    tractor
}

/// Creates `entities` tractors offline and edits each `updates` times.
pub fn fill<S: Storage>(queue: &MutationQueue<S>, entities: usize, updates: usize) -> Vec<String> {
    let repo = TractorRepository::new(queue.clone());
    let mut ids = Vec::with_capacity(entities);
    for i in 0..entities {
        let created = repo.create(generate_tractor(i)).unwrap();
        for u in 0..updates {
            let mut edited = created.data.clone();
            edited.engine_hours += (u + 1) as f64;
            repo.update(&created.id, edited).unwrap();
        }
        ids.push(created.id);
    }
    ids
}

pub fn queue_sqlite(entities: usize, updates: usize) -> MutationQueue<SqliteStorage> {
    let queue = MutationQueue::new(LocalStore::open_in_memory().unwrap());
    fill(&queue, entities, updates);
    queue
}

pub fn queue_memory(entities: usize, updates: usize) -> MutationQueue<MemoryStorage> {
    let queue = MutationQueue::new(LocalStore::volatile());
    fill(&queue, entities, updates);
    queue
}
