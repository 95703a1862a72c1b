use super::{ElasticsearchClient, RecordingEngine, SearchEngineClient, SolrClient};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub type EngineBuilder =
    Box<dyn Fn(&EngineConfig) -> Result<Arc<dyn SearchEngineClient>> + Send + Sync>;

/// Engine plugins keyed by engine type
pub struct EngineFactory {
    builders: HashMap<String, EngineBuilder>,
}

impl EngineFactory {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// `solr`, `elasticsearch` and `memory`
    pub fn with_defaults() -> Self {
        let mut factory = Self::empty();
        factory.register("solr", |config| {
            Ok(Arc::new(SolrClient::new(config)?) as Arc<dyn SearchEngineClient>)
        });
        factory.register("elasticsearch", |config| {
            Ok(Arc::new(ElasticsearchClient::new(config)?) as Arc<dyn SearchEngineClient>)
        });
        factory.register("memory", |_| {
            Ok(Arc::new(RecordingEngine::new()) as Arc<dyn SearchEngineClient>)
        });
        factory
    }

    /// Add or replace a plugin
    pub fn register<F>(&mut self, engine_type: &str, builder: F)
    where
        F: Fn(&EngineConfig) -> Result<Arc<dyn SearchEngineClient>> + Send + Sync + 'static,
    {
        self.builders
            .insert(engine_type.to_lowercase(), Box::new(builder));
    }

    pub fn supports(&self, engine_type: &str) -> bool {
        self.builders.contains_key(&engine_type.to_lowercase())
    }

    pub fn build(&self, config: &EngineConfig) -> Result<Arc<dyn SearchEngineClient>> {
        let engine_type = config.engine_type.to_lowercase();
        let builder = self
            .builders
            .get(&engine_type)
            .ok_or_else(|| SyncError::UnknownEngine(config.engine_type.clone()))?;

        let engine = builder(config)?;
        info!(engine_type = %engine_type, url = %config.url, "Search engine client ready");
        Ok(engine)
    }
}

impl Default for EngineFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}
