//! Change detection
//!
//! Compares an incoming job item against the indexing ledger and decides
//! whether it must be forwarded. Decisions are pure reads; the forwarder
//! applies their ledger effects only once the search engine accepted the
//! batch (see [`ChangeDetector::confirm_unchanged`]).

use crate::config::SiteConfig;
use crate::error::Result;
use crate::job::{JobAction, JobItem};
use crate::session::SynchronizationSession;
use chrono::Utc;
use contentsync_storage::{IndexingLedger, IndexingLedgerEntry, LedgerKey, SyncStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Configured sites and the locales each one accepts
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: HashMap<String, SiteConfig>,
}

/// Sites of one item split into configured and unknown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteResolution {
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

impl SiteRegistry {
    pub fn new(sites: &[SiteConfig]) -> Self {
        Self {
            sites: sites
                .iter()
                .map(|site| (site.name.clone(), site.clone()))
                .collect(),
        }
    }

    pub fn accepts(&self, site: &str, locale: &str) -> bool {
        self.sites
            .get(site)
            .map(|config| config.accepts_locale(locale))
            .unwrap_or(false)
    }

    pub fn resolve(&self, item: &JobItem) -> SiteResolution {
        let mut accepted = Vec::new();
        let mut rejected = Vec::new();
        for site in &item.site_names {
            let bucket = if self.accepts(site, &item.locale) {
                &mut accepted
            } else {
                &mut rejected
            };
            if !bucket.contains(site) {
                bucket.push(site.clone());
            }
        }
        SiteResolution { accepted, rejected }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Skip,
    Delete,
    Error,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Skip => "skip",
            ChangeKind::Delete => "delete",
            ChangeKind::Error => "error",
        }
    }
}

/// Outcome of comparing one content item with the ledger
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeDecision {
    /// No ledger entry yet
    Create {
        key: LedgerKey,
        sites: Vec<String>,
        checksum: String,
    },
    /// Checksum or site set differs from the ledger
    Update {
        key: LedgerKey,
        sites: Vec<String>,
        checksum: String,
        previous: IndexingLedgerEntry,
        /// Sites the object was indexed into and no longer targets
        dropped_sites: Vec<String>,
    },
    /// Identical content already indexed
    Skip { previous: IndexingLedgerEntry },
    /// Producer-requested removal; `previous` is None if never indexed
    Delete {
        key: LedgerKey,
        sites: Vec<String>,
        previous: Option<IndexingLedgerEntry>,
        /// Sites of `previous` the DELETE does not name; the entry survives
        /// with these when non-empty
        remaining_sites: Vec<String>,
    },
    /// Unknown target; logged IGNORED, never retried
    Error { reason: String },
}

impl ChangeDecision {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeDecision::Create { .. } => ChangeKind::Create,
            ChangeDecision::Update { .. } => ChangeKind::Update,
            ChangeDecision::Skip { .. } => ChangeKind::Skip,
            ChangeDecision::Delete { .. } => ChangeKind::Delete,
            ChangeDecision::Error { .. } => ChangeKind::Error,
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(
            self,
            ChangeDecision::Create { .. }
                | ChangeDecision::Update { .. }
                | ChangeDecision::Delete { .. }
        )
    }
}

fn same_sites(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|site| b.contains(site))
}

pub struct ChangeDetector {
    ledger: Arc<dyn IndexingLedger>,
    sites: SiteRegistry,
}

impl ChangeDetector {
    pub fn new(ledger: Arc<dyn IndexingLedger>, sites: SiteRegistry) -> Self {
        Self { ledger, sites }
    }

    pub fn sites(&self) -> &SiteRegistry {
        &self.sites
    }

    /// Decide what to do with a CREATE or DELETE item
    pub async fn decide(
        &self,
        session: &SynchronizationSession,
        item: &JobItem,
    ) -> Result<ChangeDecision> {
        let key = match item.ledger_key(&session.source) {
            Some(key) => key,
            None => {
                return Ok(ChangeDecision::Error {
                    reason: format!("{} item has no objectId", item.action),
                })
            }
        };

        let resolution = self.sites.resolve(item);
        if resolution.accepted.is_empty() {
            return Ok(ChangeDecision::Error {
                reason: format!(
                    "no configured site among [{}] for locale '{}'",
                    resolution.rejected.join(", "),
                    item.locale
                ),
            });
        }
        if !resolution.rejected.is_empty() {
            warn!(
                object_id = %key.object_id,
                locale = %item.locale,
                rejected = ?resolution.rejected,
                "Dropping unconfigured sites from item"
            );
        }

        let previous = self.ledger.get(&key).await?;
        let sites = resolution.accepted;

        let decision = match item.action {
            JobAction::Delete => {
                let remaining_sites = previous
                    .as_ref()
                    .map(|previous| {
                        previous
                            .sites
                            .iter()
                            .filter(|site| !sites.contains(site))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                ChangeDecision::Delete {
                    key,
                    sites,
                    previous,
                    remaining_sites,
                }
            }
            JobAction::Create => {
                let checksum = item.effective_checksum();
                match previous {
                    None => ChangeDecision::Create {
                        key,
                        sites,
                        checksum,
                    },
                    Some(previous)
                        if previous.checksum == checksum && same_sites(&previous.sites, &sites) =>
                    {
                        ChangeDecision::Skip { previous }
                    }
                    Some(previous) => {
                        let dropped_sites = previous
                            .sites
                            .iter()
                            .filter(|site| !sites.contains(site))
                            .cloned()
                            .collect();
                        ChangeDecision::Update {
                            key,
                            sites,
                            checksum,
                            previous,
                            dropped_sites,
                        }
                    }
                }
            }
            JobAction::Commit => ChangeDecision::Error {
                reason: "COMMIT items are not change-detected".to_string(),
            },
        };

        debug!(
            source = %session.source,
            object_id = item.object_id().unwrap_or("-"),
            decision = decision.kind().as_str(),
            "Change detected"
        );
        Ok(decision)
    }

    /// Apply a SKIP: the content is unchanged but this pass saw it, so a
    /// full session stamps its transaction id. Standalone sessions leave the
    /// entry alone.
    pub async fn confirm_unchanged(
        &self,
        session: &SynchronizationSession,
        previous: &IndexingLedgerEntry,
    ) -> Result<bool> {
        if session.standalone {
            return Ok(false);
        }
        Ok(self
            .ledger
            .touch_transaction(&previous.key(), &session.transaction_id)
            .await?)
    }

    /// Ledger entry left after a DELETE removed some of its sites. The
    /// transaction stamp is kept: a removal does not confirm the rest.
    pub fn narrowed_entry(
        previous: &IndexingLedgerEntry,
        remaining_sites: Vec<String>,
    ) -> IndexingLedgerEntry {
        let mut entry = previous.clone();
        entry.sites = remaining_sites;
        entry.modified_at = Utc::now();
        entry.status = SyncStatus::Deindexed;
        entry
    }

    /// Ledger entry to write once a CREATE/UPDATE has been indexed
    pub fn indexed_entry(
        session: &SynchronizationSession,
        key: LedgerKey,
        sites: Vec<String>,
        checksum: String,
        previous: Option<&IndexingLedgerEntry>,
    ) -> IndexingLedgerEntry {
        let mut entry = IndexingLedgerEntry::new(key, checksum, session.transaction_id.clone(), sites);

        match previous {
            Some(previous) => {
                entry.created_at = previous.created_at;
                if session.standalone {
                    // Keep the full-session stamp so staleness stays visible to reconciliation
                    entry.transaction_id = previous.transaction_id.clone();
                    entry.standalone = previous.standalone;
                }
            }
            None => entry.standalone = session.standalone,
        }
        entry
    }
}
