//! Search engine egress
//!
//! The forwarder and reconciler hand augmented batches (content items
//! followed by COMMIT markers) to a [`SearchEngineClient`]. Concrete
//! clients are chosen by [`EngineFactory`] from the configured engine type.

pub mod elasticsearch;
pub mod factory;
pub mod memory;
pub mod solr;

pub use elasticsearch::ElasticsearchClient;
pub use factory::{EngineBuilder, EngineFactory};
pub use memory::RecordingEngine;
pub use solr::SolrClient;

use crate::config::{ConfigError, EngineConfig};
use crate::error::{Result, SyncError};
use crate::job::JobItem;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait SearchEngineClient: Send + Sync {
    fn engine_type(&self) -> &str;

    /// Apply a batch in order. All-or-nothing from the caller's view: any
    /// error means the batch must be treated as not indexed.
    async fn index(&self, items: &[JobItem]) -> Result<()>;
}

/// Index/core naming shared by the HTTP engines
pub fn target_name(site: &str, locale: &str) -> String {
    format!("{}_{}", site, locale)
}

/// Engine document id. Targets are shared across environments, so the id
/// carries the environment whenever the item names one.
pub fn document_id(item: &JobItem) -> Option<String> {
    item.object_id.as_ref().map(|id| {
        if item.environment.is_empty() {
            id.clone()
        } else {
            format!("{}:{}", item.environment, id)
        }
    })
}

/// Engine document for one object in one site
pub fn document(item: &JobItem, site: &str) -> Map<String, Value> {
    let mut doc: Map<String, Value> = item
        .attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    if let Some(id) = document_id(item) {
        doc.insert("id".into(), Value::String(id));
    }
    if let Some(object_id) = &item.object_id {
        doc.insert("objectId".into(), Value::String(object_id.clone()));
    }
    doc.insert("site".into(), Value::String(site.to_string()));
    doc.insert("locale".into(), Value::String(item.locale.clone()));
    doc.insert("environment".into(), Value::String(item.environment.clone()));
    if let Some(checksum) = &item.checksum {
        doc.insert("checksum".into(), Value::String(checksum.clone()));
    }
    doc
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    Basic { username: String, password: String },
    ApiKey(String),
}

impl Credentials {
    pub fn from_config(config: &EngineConfig) -> Self {
        match (&config.username, &config.password, &config.api_key) {
            (Some(username), Some(password), _) => Credentials::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            (_, _, Some(key)) => Credentials::ApiKey(key.clone()),
            _ => Credentials::None,
        }
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Credentials::None => request,
            Credentials::Basic { username, password } => request.basic_auth(username, Some(password)),
            Credentials::ApiKey(key) => request.header("Authorization", format!("ApiKey {}", key)),
        }
    }
}

/// Map an HTTP failure status to retry semantics
pub fn classify_status(status: u16, body: &str) -> SyncError {
    let retryable = status >= 500 || status == 429 || status == 408;
    if retryable {
        SyncError::EngineUnavailable(format!("HTTP {}: {}", status, body))
    } else {
        SyncError::EngineRejected {
            status,
            message: body.to_string(),
        }
    }
}

fn classify_transport(err: reqwest::Error) -> SyncError {
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), &err.to_string());
    }
    SyncError::EngineUnavailable(err.to_string())
}

/// Authenticated HTTP client bound to one engine base URL
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    credentials: Credentials,
}

impl HttpTransport {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| ConfigError::invalid("engine", e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            credentials: Credentials::from_config(config),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let request = self.client.post(self.url(path)).json(body);
        self.send(request).await
    }

    pub async fn post_ndjson(&self, path: &str, body: String) -> Result<Value> {
        let request = self
            .client
            .post(self.url(path))
            .header("Content-Type", "application/x-ndjson")
            .body(body);
        self.send(request).await
    }

    pub async fn post_empty(&self, path: &str) -> Result<Value> {
        self.send(self.client.post(self.url(path))).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let response = self
            .credentials
            .apply(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_transport)?;
        debug!(status = status.as_u16(), bytes = body.len(), "Engine responded");

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}
