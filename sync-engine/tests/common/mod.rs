#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sync_engine::remote::{RemoteError, RemoteRecord, RemoteService, RequestContext};
use sync_engine::{
    EntityType, InMemoryRemote, LocalStore, MutationQueue, SqliteStorage, StaticToken, SyncConfig, SyncEngine,
    Tractor, TractorModel, TractorRepository,
};

pub type Engine = Arc<SyncEngine<SqliteStorage>>;

pub fn tractor(hours: f64) -> Tractor {
    Tractor::new("coop-1", TractorModel::Mf240, "SN-001", hours)
}

pub fn db_path(dir: &Path) -> String {
    dir.join("fieldops.db").to_string_lossy().into_owned()
}

/// Opens the store at `path` as a fresh process would, already online.
pub fn open(path: &str, remote: Arc<dyn RemoteService>) -> (Engine, TractorRepository<SqliteStorage>) {
    let queue = MutationQueue::new(LocalStore::open(path).unwrap());
    let repo = TractorRepository::new(queue.clone());
    let engine = SyncEngine::new(queue, remote, Arc::new(StaticToken::new("token")), SyncConfig::default());
    engine.set_online(true);
    (Arc::new(engine), repo)
}

/// Forwards every call to the server but loses the response of call number
/// `lose_at` (1-based), as if the network dropped after the server applied it.
pub struct LossyRemote {
    pub inner: Arc<InMemoryRemote>,
    lose_at: usize,
    seen: AtomicUsize,
}

impl LossyRemote {
    pub fn new(inner: Arc<InMemoryRemote>, lose_at: usize) -> Self {
        Self { inner, lose_at, seen: AtomicUsize::new(0) }
    }

    fn lose(&self) -> bool {
        self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.lose_at
    }
}

fn dropped() -> RemoteError {
    RemoteError::Transient("connection reset before response".to_string())
}

#[async_trait]
impl RemoteService for LossyRemote {
    async fn create(
        &self,
        entity_type: EntityType,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError> {
        let result = self.inner.create(entity_type, payload, ctx).await;
        if self.lose() { Err(dropped()) } else { result }
    }

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError> {
        let result = self.inner.update(entity_type, entity_id, payload, ctx).await;
        if self.lose() { Err(dropped()) } else { result }
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        ctx: RequestContext<'_>,
    ) -> Result<(), RemoteError> {
        let result = self.inner.delete(entity_type, entity_id, ctx).await;
        if self.lose() { Err(dropped()) } else { result }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        owner_id: Option<&str>,
        token: &str,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        self.inner.list(entity_type, owner_id, token).await
    }
}
