//! Elasticsearch plugin
//!
//! Content goes out as one `_bulk` NDJSON request into indices named
//! `{site}_{locale}` (lowercased). COMMIT markers become `_refresh` calls
//! issued after the bulk request.

use super::{
    classify_status, document, document_id, target_name, HttpTransport, SearchEngineClient,
};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::job::{JobAction, JobItem};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

pub fn index_name(site: &str, locale: &str) -> String {
    target_name(site, locale).to_lowercase()
}

/// NDJSON bulk body for the content items, None if there are none
pub fn bulk_body(items: &[JobItem]) -> Result<Option<String>> {
    let mut body = String::new();

    for item in items.iter().filter(|item| !item.is_commit()) {
        let Some(id) = document_id(item) else {
            continue;
        };
        for (site, locale) in item.site_locale_pairs() {
            let index = index_name(&site, &locale);
            match item.action {
                JobAction::Create => {
                    let action = json!({ "index": { "_index": index, "_id": id } });
                    body.push_str(&serde_json::to_string(&action)?);
                    body.push('\n');
                    body.push_str(&serde_json::to_string(&document(item, &site))?);
                    body.push('\n');
                }
                JobAction::Delete => {
                    let action = json!({ "delete": { "_index": index, "_id": id } });
                    body.push_str(&serde_json::to_string(&action)?);
                    body.push('\n');
                }
                JobAction::Commit => {}
            }
        }
    }

    Ok((!body.is_empty()).then_some(body))
}

/// Indices to refresh, in first-seen order
pub fn refresh_targets(items: &[JobItem]) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for item in items.iter().filter(|item| item.is_commit()) {
        for (site, locale) in item.site_locale_pairs() {
            let index = index_name(&site, &locale);
            if !targets.contains(&index) {
                targets.push(index);
            }
        }
    }
    targets
}

/// First failed item of a bulk response. Deleting a missing document is
/// not a failure.
pub fn bulk_failure(response: &Value) -> Option<SyncError> {
    if !response.get("errors").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let items = response.get("items").and_then(Value::as_array)?;
    items.iter().find_map(|entry| {
        let (op, result) = entry.as_object()?.iter().next()?;
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(500) as u16;
        if (200..300).contains(&status) || (op == "delete" && status == 404) {
            return None;
        }
        let reason = result
            .get("error")
            .map(|e| e.to_string())
            .unwrap_or_else(|| format!("{} failed", op));
        Some(classify_status(status, &reason))
    })
}

pub struct ElasticsearchClient {
    transport: HttpTransport,
}

impl ElasticsearchClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
        })
    }
}

#[async_trait]
impl SearchEngineClient for ElasticsearchClient {
    fn engine_type(&self) -> &str {
        "elasticsearch"
    }

    async fn index(&self, items: &[JobItem]) -> Result<()> {
        if let Some(body) = bulk_body(items)? {
            let response = self.transport.post_ndjson("_bulk", body).await?;
            if let Some(err) = bulk_failure(&response) {
                return Err(err);
            }
        }

        let targets = refresh_targets(items);
        for index in &targets {
            self.transport
                .post_empty(&format!("{}/_refresh", index))
                .await?;
        }
        info!(items = items.len(), refreshed = targets.len(), "Elasticsearch bulk applied");
        Ok(())
    }
}
