use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{RemoteError, RemoteRecord, RemoteService, RequestContext};
use crate::entity::{EntityType, MutationAction};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub action: MutationAction,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<(EntityType, String), Value>,
    next_id: u64,
    idempotency: HashMap<String, String>,
    scripted: VecDeque<RemoteError>,
    rejections: HashMap<(EntityType, String), (u16, String)>,
    unreachable: bool,
    calls: Vec<RemoteCall>,
}

/// In-process reference server. Assigns ids `SRV-<n>`, honours idempotency
/// keys and lets callers inject failures.
pub struct InMemoryRemote {
    inner: Mutex<Inner>,
    latency: Duration,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// The first Create will be assigned `SRV-<next_id>`.
    pub fn starting_at(next_id: u64) -> Self {
        Self {
            inner: Mutex::new(Inner { next_id, ..Default::default() }),
            latency: Duration::ZERO,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// The next call fails with `error` regardless of its target.
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().scripted.push_back(error);
    }

    /// Every write to this entity is rejected until `accept_entity` is called.
    pub fn reject_entity(&self, entity_type: EntityType, entity_id: &str, status: u16, message: &str) {
        self.lock()
            .rejections
            .insert((entity_type, entity_id.to_string()), (status, message.to_string()));
    }

    pub fn accept_entity(&self, entity_type: EntityType, entity_id: &str) {
        self.lock().rejections.remove(&(entity_type, entity_id.to_string()));
    }

    /// Seeds a record as if another client had created it.
    pub fn insert(&self, entity_type: EntityType, entity_id: &str, payload: Value) {
        self.lock().records.insert((entity_type, entity_id.to_string()), payload);
    }

    pub fn get(&self, entity_type: EntityType, entity_id: &str) -> Option<Value> {
        self.lock().records.get(&(entity_type, entity_id.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    async fn enter(
        &self,
        action: MutationAction,
        entity_type: EntityType,
        entity_id: Option<&str>,
    ) -> Result<(), RemoteError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut inner = self.lock();
        if inner.unreachable {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        inner.calls.push(RemoteCall {
            action,
            entity_type,
            entity_id: entity_id.map(str::to_string),
        });
        if let Some(error) = inner.scripted.pop_front() {
            return Err(error);
        }
        if let Some(id) = entity_id {
            if let Some((status, message)) = inner.rejections.get(&(entity_type, id.to_string())) {
                return Err(RemoteError::Rejected { status: *status, message: message.clone() });
            }
        }
        Ok(())
    }
}

fn with_id(payload: &Value, id: &str) -> Value {
    let mut body = payload.clone();
    if let Value::Object(map) = &mut body {
        map.insert("id".to_string(), Value::String(id.to_string()));
    }
    body
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn create(
        &self,
        entity_type: EntityType,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError> {
        self.enter(MutationAction::Create, entity_type, None).await?;
        let mut inner = self.lock();

        if let Some(id) = inner.idempotency.get(ctx.idempotency_key).cloned() {
            let stored = inner.records.get(&(entity_type, id.clone())).cloned().unwrap_or(Value::Null);
            return Ok(RemoteRecord { id, payload: stored });
        }

        let id = format!("SRV-{}", inner.next_id);
        inner.next_id += 1;
        let body = with_id(payload, &id);
        inner.records.insert((entity_type, id.clone()), body.clone());
        inner.idempotency.insert(ctx.idempotency_key.to_string(), id.clone());
        Ok(RemoteRecord { id, payload: body })
    }

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        _ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError> {
        self.enter(MutationAction::Update, entity_type, Some(entity_id)).await?;
        let mut inner = self.lock();
        let key = (entity_type, entity_id.to_string());
        if !inner.records.contains_key(&key) {
            return Err(RemoteError::Rejected { status: 404, message: format!("{} not found", entity_id) });
        }
        let body = with_id(payload, entity_id);
        inner.records.insert(key, body.clone());
        Ok(RemoteRecord { id: entity_id.to_string(), payload: body })
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        _ctx: RequestContext<'_>,
    ) -> Result<(), RemoteError> {
        self.enter(MutationAction::Delete, entity_type, Some(entity_id)).await?;
        self.lock().records.remove(&(entity_type, entity_id.to_string()));
        Ok(())
    }

    async fn list(
        &self,
        entity_type: EntityType,
        owner_id: Option<&str>,
        _token: &str,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        if self.lock().unreachable {
            return Err(RemoteError::Transient("connection refused".to_string()));
        }
        let inner = self.lock();
        let owner_field = entity_type.owner_field();
        Ok(inner.records.iter()
            .filter(|((ty, _), _)| *ty == entity_type)
            .filter(|(_, payload)| {
                owner_id.map_or(true, |owner| payload.get(owner_field).and_then(Value::as_str) == Some(owner))
            })
            .map(|((_, id), payload)| RemoteRecord { id: id.clone(), payload: payload.clone() })
            .collect())
    }
}
