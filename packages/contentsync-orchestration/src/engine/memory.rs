//! In-process engine that records what it was asked to do
//!
//! Keeps the batches it accepted and the resulting document set per
//! `{site}_{locale}` target, documents keyed by (environment, object id).
//! Failures can be scripted ahead of time.

use super::{target_name, SearchEngineClient};
use crate::error::{Result, SyncError};
use crate::job::{JobAction, JobItem};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient,
    Permanent,
}

#[derive(Default)]
struct State {
    batches: Vec<Vec<JobItem>>,
    documents: BTreeMap<String, BTreeSet<(String, String)>>,
    /// One slot per upcoming call; None lets the call through
    script: VecDeque<Option<ScriptedFailure>>,
    calls: usize,
}

#[derive(Clone, Default)]
pub struct RecordingEngine {
    state: Arc<Mutex<State>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls (after anything already scripted)
    pub fn fail_next(&self, failure: ScriptedFailure, times: usize) {
        let mut state = self.state.lock();
        state.script.extend(std::iter::repeat(Some(failure)).take(times));
    }

    /// Let the next `times` calls through before any failure scripted after
    pub fn pass_next(&self, times: usize) {
        let mut state = self.state.lock();
        state.script.extend(std::iter::repeat(None).take(times));
    }

    /// Accepted batches, in order
    pub fn batches(&self) -> Vec<Vec<JobItem>> {
        self.state.lock().batches.clone()
    }

    /// Every accepted item, flattened
    pub fn items(&self) -> Vec<JobItem> {
        self.state.lock().batches.iter().flatten().cloned().collect()
    }

    /// Calls received, including failed ones
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Whether the object is indexed in the target, in any environment
    pub fn contains(&self, site: &str, locale: &str, object_id: &str) -> bool {
        self.state
            .lock()
            .documents
            .get(&target_name(site, locale))
            .map(|docs| docs.iter().any(|(_, id)| id == object_id))
            .unwrap_or(false)
    }

    pub fn contains_in(&self, site: &str, locale: &str, environment: &str, object_id: &str) -> bool {
        self.state
            .lock()
            .documents
            .get(&target_name(site, locale))
            .map(|docs| docs.contains(&(environment.to_string(), object_id.to_string())))
            .unwrap_or(false)
    }

    pub fn document_count(&self, site: &str, locale: &str) -> usize {
        self.state
            .lock()
            .documents
            .get(&target_name(site, locale))
            .map(BTreeSet::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchEngineClient for RecordingEngine {
    fn engine_type(&self) -> &str {
        "memory"
    }

    async fn index(&self, items: &[JobItem]) -> Result<()> {
        let mut state = self.state.lock();
        state.calls += 1;

        match state.script.pop_front().flatten() {
            Some(ScriptedFailure::Transient) => {
                return Err(SyncError::EngineUnavailable("scripted outage".into()))
            }
            Some(ScriptedFailure::Permanent) => {
                return Err(SyncError::EngineRejected {
                    status: 400,
                    message: "scripted rejection".into(),
                })
            }
            None => {}
        }

        for item in items {
            let Some(id) = &item.object_id else {
                continue;
            };
            for (site, locale) in item.site_locale_pairs() {
                let docs = state
                    .documents
                    .entry(target_name(&site, &locale))
                    .or_default();
                let doc = (item.environment.clone(), id.clone());
                match item.action {
                    JobAction::Create => {
                        docs.insert(doc);
                    }
                    JobAction::Delete => {
                        docs.remove(&doc);
                    }
                    JobAction::Commit => {}
                }
            }
        }
        state.batches.push(items.to_vec());
        Ok(())
    }
}
