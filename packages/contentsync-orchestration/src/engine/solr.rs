//! Solr plugin
//!
//! One core per (site, locale), named `{site}_{locale}`. Each core receives
//! its commands in batch order, consecutive adds and deletes folded into
//! one JSON update request.

use super::{document, document_id, target_name, HttpTransport, SearchEngineClient};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::job::{JobAction, JobItem};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum SolrCommand {
    Add(Vec<Value>),
    Delete(Vec<String>),
    Commit,
}

impl SolrCommand {
    pub fn body(&self) -> Value {
        match self {
            SolrCommand::Add(docs) => Value::Array(docs.clone()),
            SolrCommand::Delete(ids) => json!({ "delete": ids }),
            SolrCommand::Commit => json!({ "commit": {} }),
        }
    }
}

/// Per-core command lists, cores in first-seen order
pub fn plan(items: &[JobItem]) -> Vec<(String, Vec<SolrCommand>)> {
    let mut cores: Vec<(String, Vec<SolrCommand>)> = Vec::new();

    for item in items {
        for (site, locale) in item.site_locale_pairs() {
            let core = target_name(&site, &locale);
            let idx = match cores.iter().position(|(name, _)| *name == core) {
                Some(idx) => idx,
                None => {
                    cores.push((core, Vec::new()));
                    cores.len() - 1
                }
            };
            let commands = &mut cores[idx].1;

            match (item.action, commands.last_mut()) {
                (JobAction::Create, Some(SolrCommand::Add(docs))) => {
                    docs.push(Value::Object(document(item, &site)));
                }
                (JobAction::Create, _) => {
                    commands.push(SolrCommand::Add(vec![Value::Object(document(item, &site))]));
                }
                (JobAction::Delete, last) => {
                    let Some(id) = document_id(item) else {
                        continue;
                    };
                    match last {
                        Some(SolrCommand::Delete(ids)) => ids.push(id),
                        _ => commands.push(SolrCommand::Delete(vec![id])),
                    }
                }
                (JobAction::Commit, Some(SolrCommand::Commit)) => {}
                (JobAction::Commit, _) => commands.push(SolrCommand::Commit),
            }
        }
    }

    cores
}

pub struct SolrClient {
    transport: HttpTransport,
}

impl SolrClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            transport: HttpTransport::new(config)?,
        })
    }
}

#[async_trait]
impl SearchEngineClient for SolrClient {
    fn engine_type(&self) -> &str {
        "solr"
    }

    async fn index(&self, items: &[JobItem]) -> Result<()> {
        for (core, commands) in plan(items) {
            let path = format!("solr/{}/update", core);
            for command in &commands {
                self.transport.post_json(&path, &command.body()).await?;
            }
            info!(core = %core, requests = commands.len(), "Solr core updated");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_groups_runs_per_core() {
        let items = vec![
            JobItem::create("p1", ["docs"], "en").with_checksum("h1"),
            JobItem::create("p2", ["docs", "blog"], "en").with_checksum("h2"),
            JobItem::delete("p3", ["docs"], "en"),
            JobItem::delete("p4", ["docs"], "en"),
            JobItem::commit(["docs"], "en"),
            JobItem::commit(["blog"], "en"),
        ];

        let plan = plan(&items);
        assert_eq!(plan.len(), 2);

        let (core, commands) = &plan[0];
        assert_eq!(core, "docs_en");
        assert_eq!(commands.len(), 3);
        assert!(matches!(&commands[0], SolrCommand::Add(docs) if docs.len() == 2));
        assert_eq!(
            commands[1],
            SolrCommand::Delete(vec!["p3".to_string(), "p4".to_string()])
        );
        assert_eq!(commands[2], SolrCommand::Commit);

        let (core, commands) = &plan[1];
        assert_eq!(core, "blog_en");
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn test_interleaved_actions_keep_order() {
        let items = vec![
            JobItem::delete("p1", ["docs"], "pt"),
            JobItem::create("p1", ["docs"], "pt"),
        ];
        let plan = plan(&items);
        let commands = &plan[0].1;
        assert!(matches!(commands[0], SolrCommand::Delete(_)));
        assert!(matches!(commands[1], SolrCommand::Add(_)));
    }

    #[test]
    fn test_environments_do_not_share_ids() {
        let items = vec![
            JobItem::delete("p1", ["docs"], "en").with_environment("live"),
            JobItem::delete("p1", ["docs"], "en").with_environment("preview"),
        ];
        let plan = plan(&items);
        assert_eq!(
            plan[0].1[0],
            SolrCommand::Delete(vec!["live:p1".to_string(), "preview:p1".to_string()])
        );
    }

    #[test]
    fn test_command_bodies() {
        assert_eq!(
            SolrCommand::Delete(vec!["p1".into()]).body(),
            json!({"delete": ["p1"]})
        );
        assert_eq!(SolrCommand::Commit.body(), json!({"commit": {}}));
        assert!(SolrCommand::Add(vec![json!({"id": "p1"})]).body().is_array());
    }
}
