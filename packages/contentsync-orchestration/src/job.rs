use crate::error::{Result, SyncError};
use crate::session::SynchronizationSession;
use chrono::{DateTime, Utc};
use contentsync_storage::LedgerKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Job action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobAction {
    Create,
    Delete,
    /// Durability boundary for one (site, locale)
    Commit,
}

impl JobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobAction::Create => "CREATE",
            JobAction::Delete => "DELETE",
            JobAction::Commit => "COMMIT",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATE" => Ok(JobAction::Create),
            "DELETE" => Ok(JobAction::Delete),
            "COMMIT" => Ok(JobAction::Commit),
            _ => Err(SyncError::serialization(format!("Invalid job action: {}", s))),
        }
    }
}

impl std::fmt::Display for JobAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One content-change notification from a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobItem {
    pub action: JobAction,

    /// Required for CREATE and DELETE, absent for COMMIT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    pub site_names: Vec<String>,

    pub locale: String,

    /// Empty means "use the engine's configured environment"
    #[serde(default)]
    pub environment: String,

    /// Content fingerprint; derived from `attributes` when omitted on CREATE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

fn owned<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl JobItem {
    fn with_action<I, S>(action: JobAction, object_id: Option<String>, sites: I, locale: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action,
            object_id,
            site_names: owned(sites),
            locale: locale.to_string(),
            environment: String::new(),
            checksum: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn create<I, S>(object_id: impl Into<String>, sites: I, locale: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_action(JobAction::Create, Some(object_id.into()), sites, locale)
    }

    pub fn delete<I, S>(object_id: impl Into<String>, sites: I, locale: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_action(JobAction::Delete, Some(object_id.into()), sites, locale)
    }

    pub fn commit<I, S>(sites: I, locale: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_action(JobAction::Commit, None, sites, locale)
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn is_commit(&self) -> bool {
        self.action == JobAction::Commit
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object_id.as_deref()
    }

    /// Check the structural rules of the action. Malformed items are
    /// rejected at ingress and never enqueued.
    pub fn validate(&self) -> Result<()> {
        let has_object = self
            .object_id
            .as_deref()
            .map(|id| !id.trim().is_empty())
            .unwrap_or(false);

        match self.action {
            JobAction::Create | JobAction::Delete if !has_object => {
                return Err(SyncError::invalid(format!(
                    "{} requires an objectId",
                    self.action
                )));
            }
            JobAction::Commit if self.object_id.is_some() => {
                return Err(SyncError::invalid("COMMIT must not carry an objectId"));
            }
            _ => {}
        }

        if self.site_names.is_empty() || self.site_names.iter().any(|s| s.trim().is_empty()) {
            return Err(SyncError::invalid(format!(
                "{} requires at least one non-empty site name",
                self.action
            )));
        }
        if self.locale.trim().is_empty() {
            return Err(SyncError::invalid(format!(
                "{} requires a locale",
                self.action
            )));
        }
        Ok(())
    }

    /// SHA-256 (hex) over the canonical JSON of `attributes`
    pub fn derive_checksum(&self) -> String {
        // BTreeMap keys serialize in order; nested objects are sorted by serde_json's Map.
        let canonical = serde_json::to_vec(&self.attributes).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    /// Producer checksum if present, else derived
    pub fn effective_checksum(&self) -> String {
        match &self.checksum {
            Some(checksum) => checksum.clone(),
            None => self.derive_checksum(),
        }
    }

    /// Ledger key of this item within `source`; None for COMMIT
    pub fn ledger_key(&self, source: &str) -> Option<LedgerKey> {
        self.object_id
            .as_ref()
            .map(|id| LedgerKey::new(id.clone(), source, self.environment.clone(), self.locale.clone()))
    }

    /// Distinct (site, locale) pairs targeted by this item, in site order
    pub fn site_locale_pairs(&self) -> Vec<(String, String)> {
        let mut seen = HashSet::new();
        self.site_names
            .iter()
            .filter(|site| seen.insert(site.as_str()))
            .map(|site| (site.clone(), self.locale.clone()))
            .collect()
    }
}

/// Queue payload: everything one `send()` call accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobBatch {
    pub batch_id: Uuid,
    pub session: SynchronizationSession,
    pub items: Vec<JobItem>,
    /// Delivery attempt, starting at 1
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl JobBatch {
    pub fn new(session: SynchronizationSession, items: Vec<JobItem>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            session,
            items,
            attempt: 1,
            published_at: Utc::now(),
        }
    }

    /// Same batch, next delivery attempt
    pub fn redelivered(mut self) -> Self {
        self.attempt += 1;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
