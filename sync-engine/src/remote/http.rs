use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;

use super::{RemoteError, RemoteRecord, RemoteService, RequestContext};
use crate::entity::EntityType;
use crate::error::{Error, Result};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// REST adapter: `POST /entities/{type}`, `PUT /entities/{type}/{id}`,
/// `DELETE /entities/{type}/{id}` and `GET /entities/{type}?owner=`.
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::TransientNetwork(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    fn collection_url(&self, entity_type: EntityType) -> String {
        format!("{}/entities/{}", self.base_url, entity_type.collection())
    }

    fn entity_url(&self, entity_type: EntityType, entity_id: &str) -> String {
        format!("{}/{}", self.collection_url(entity_type), entity_id)
    }

    async fn send(&self, request: RequestBuilder) -> std::result::Result<Response, RemoteError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "remote call failed");
        Err(RemoteError::from_status(status.as_u16(), body))
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Transient(format!("request timed out: {}", e))
    } else {
        RemoteError::Transient(format!("transport error: {}", e))
    }
}

async fn read_record(response: Response, fallback_id: Option<&str>) -> std::result::Result<RemoteRecord, RemoteError> {
    let body: Value = response.json().await.map_err(transport_error)?;
    record_from_json(body, fallback_id)
}

fn record_from_json(body: Value, fallback_id: Option<&str>) -> std::result::Result<RemoteRecord, RemoteError> {
    let id = match body.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => fallback_id
            .map(str::to_string)
            .ok_or_else(|| RemoteError::Transient("response carried no entity id".to_string()))?,
    };
    Ok(RemoteRecord { id, payload: body })
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn create(
        &self,
        entity_type: EntityType,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        let request = self.client
            .post(self.collection_url(entity_type))
            .bearer_auth(ctx.token)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key)
            .json(payload);
        let response = self.send(request).await?;
        read_record(response, None).await
    }

    async fn update(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &Value,
        ctx: RequestContext<'_>,
    ) -> std::result::Result<RemoteRecord, RemoteError> {
        let request = self.client
            .put(self.entity_url(entity_type, entity_id))
            .bearer_auth(ctx.token)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key)
            .json(payload);
        let response = self.send(request).await?;
        read_record(response, Some(entity_id)).await
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        ctx: RequestContext<'_>,
    ) -> std::result::Result<(), RemoteError> {
        let request = self.client
            .delete(self.entity_url(entity_type, entity_id))
            .bearer_auth(ctx.token)
            .header(IDEMPOTENCY_HEADER, ctx.idempotency_key);
        match self.send(request).await {
            Ok(_) => Ok(()),
            // Already gone, e.g. a resend after a crash between response and ack.
            Err(RemoteError::Rejected { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        entity_type: EntityType,
        owner_id: Option<&str>,
        token: &str,
    ) -> std::result::Result<Vec<RemoteRecord>, RemoteError> {
        let mut request = self.client.get(self.collection_url(entity_type)).bearer_auth(token);
        if let Some(owner) = owner_id {
            request = request.query(&[("owner", owner)]);
        }
        let response = self.send(request).await?;
        let body: Value = response.json().await.map_err(transport_error)?;
        match body {
            Value::Array(items) => items.into_iter().map(|item| record_from_json(item, None)).collect(),
            other => Err(RemoteError::Transient(format!("expected a JSON array, got {}", other))),
        }
    }
}
