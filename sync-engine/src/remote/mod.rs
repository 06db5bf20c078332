//! Remote service adapter.
//!
//! The sync engine only sees the [`RemoteService`] trait. Responses are
//! classified into success, transient failure (timeouts, 5xx, 408, 429),
//! permanent rejection (other 4xx, unfollowed 3xx) and missing authorization
//! (401).

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{InMemoryRemote, RemoteCall};

use async_trait::async_trait;
use serde_json::Value;

use crate::entity::EntityType;
use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("{0}")]
    Transient(String),
    #[error("HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("HTTP 401: unauthorized")]
    Unauthorized,
}

impl RemoteError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 => RemoteError::Unauthorized,
            408 | 429 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
            // The client follows redirects, so a 3xx here means a loop or a
            // missing Location. Resending cannot fix either.
            300..=499 => RemoteError::Rejected { status, message },
            _ => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transient(msg) => Error::TransientNetwork(msg),
            RemoteError::Rejected { status, message } => Error::PermanentRejection { status, message },
            RemoteError::Unauthorized => Error::AuthUnavailable,
        }
    }
}

/// Canonical server copy of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRecord {
    pub id: String,
    pub payload: Value,
}

/// Per-request metadata. The idempotency key lets the server deduplicate a
/// mutation that is resent after a crash between response and ack.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub token: &'a str,
    pub idempotency_key: &'a str,
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn create(
        &self,
        entity_type: EntityType,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError>;

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> Result<RemoteRecord, RemoteError>;

    /// Deleting an id the server does not know succeeds.
    async fn delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        ctx: RequestContext<'_>,
    ) -> Result<(), RemoteError>;

    async fn list(
        &self,
        entity_type: EntityType,
        owner_id: Option<&str>,
        token: &str,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;
}
