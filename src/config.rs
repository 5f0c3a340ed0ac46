//! Runtime configuration.
//!
//! [`PipelineConfig`] holds pure pipeline knobs and has sensible defaults.
//! [`ResearchConfig`] adds endpoints, credentials and the store path, read
//! from the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gateway::{ChatCompletionsAdapter, ProviderError};
use crate::search::{SearchError, SonarAdapter};
use crate::store::{SqliteConversationStore, StoreError};

pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_SEARCH_BASE_URL: &str = "https://api.perplexity.ai";
pub const DEFAULT_SEARCH_MODEL: &str = "sonar-pro";
pub const DEFAULT_MODEL: &str = "gpt-4.1";

const LLM_HTTP_TIMEOUT: Duration = Duration::from_secs(120);
const SEARCH_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

/// Knobs for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_model")]
    pub router_model: String,
    /// Model used for expansion and mapping.
    #[serde(default = "default_model")]
    pub planner_model: String,
    #[serde(default = "default_model")]
    pub synthesis_model: String,
    #[serde(default = "default_classify_timeout_secs")]
    pub classify_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    /// Clamped to 1..=3 at use.
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
    /// Recent turns handed to the router and synthesizer.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_classify_timeout_secs() -> u64 {
    15
}

fn default_search_timeout_secs() -> u64 {
    30
}

fn default_max_sub_queries() -> usize {
    3
}

fn default_context_turns() -> usize {
    10
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            router_model: default_model(),
            planner_model: default_model(),
            synthesis_model: default_model(),
            classify_timeout_secs: default_classify_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
            max_sub_queries: default_max_sub_queries(),
            context_turns: default_context_turns(),
        }
    }
}

impl PipelineConfig {
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_secs(self.classify_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn with_models(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        self.router_model = model.clone();
        self.planner_model = model.clone();
        self.synthesis_model = model;
        self
    }
}

/// Everything the binary needs to assemble a driver.
#[derive(Debug, Clone)]
pub struct ResearchConfig {
    pub llm_api_key: Option<String>,
    pub llm_base_url: String,
    pub search_api_key: Option<String>,
    pub search_base_url: String,
    pub search_model: String,
    pub store_path: PathBuf,
    pub pipeline: PipelineConfig,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            llm_api_key: None,
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            search_api_key: None,
            search_base_url: DEFAULT_SEARCH_BASE_URL.to_string(),
            search_model: DEFAULT_SEARCH_MODEL.to_string(),
            store_path: SqliteConversationStore::default_path(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ResearchConfig {
    /// Read from the process environment. Missing credentials are left as
    /// `None` and reported when the corresponding client is built.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        cfg.llm_api_key = non_empty("LLM_API_KEY");
        if let Some(url) = non_empty("LLM_BASE_URL") {
            cfg.llm_base_url = url;
        }
        cfg.search_api_key = non_empty("SEARCH_API_KEY");
        if let Some(url) = non_empty("SEARCH_BASE_URL") {
            cfg.search_base_url = url;
        }
        if let Some(model) = non_empty("SEARCH_MODEL") {
            cfg.search_model = model;
        }
        if let Some(path) = non_empty("RESEARCH_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(model) = non_empty("RESEARCH_ROUTER_MODEL") {
            cfg.pipeline.router_model = model;
        }
        if let Some(model) = non_empty("RESEARCH_PLANNER_MODEL") {
            cfg.pipeline.planner_model = model;
        }
        if let Some(model) = non_empty("RESEARCH_SYNTHESIS_MODEL") {
            cfg.pipeline.synthesis_model = model;
        }
        if let Some(raw) = non_empty("RESEARCH_CONTEXT_TURNS") {
            cfg.pipeline.context_turns = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "RESEARCH_CONTEXT_TURNS",
                value: raw.clone(),
            })?;
        }
        Ok(cfg)
    }

    pub fn chat_adapter(&self) -> Result<ChatCompletionsAdapter, ProviderError> {
        let key = self
            .llm_api_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("LLM_API_KEY not set"))?;
        ChatCompletionsAdapter::with_config(key, self.llm_base_url.as_str(), LLM_HTTP_TIMEOUT)
    }

    pub fn search_adapter(&self) -> Result<SonarAdapter, SearchError> {
        let key = self
            .search_api_key
            .as_deref()
            .ok_or_else(|| SearchError::Config("SEARCH_API_KEY not set".into()))?;
        SonarAdapter::with_config(
            key,
            self.search_base_url.as_str(),
            self.search_model.as_str(),
            SEARCH_HTTP_TIMEOUT,
        )
    }

    pub fn open_store(&self) -> Result<SqliteConversationStore, StoreError> {
        SqliteConversationStore::new(&self.store_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ResearchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.llm_base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.search_base_url, "https://api.perplexity.ai");
        assert_eq!(cfg.search_model, "sonar-pro");
        assert!(cfg.llm_api_key.is_none());
        assert_eq!(cfg.pipeline.classify_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.pipeline.search_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.pipeline.max_sub_queries, 3);
        assert_eq!(cfg.pipeline.context_turns, 10);
    }

    #[test]
    fn environment_overrides_defaults() {
        let cfg = ResearchConfig::from_lookup(lookup(&[
            ("LLM_API_KEY", "sk-1"),
            ("SEARCH_MODEL", "sonar"),
            ("RESEARCH_ROUTER_MODEL", "router-x"),
            ("RESEARCH_CONTEXT_TURNS", "4"),
            ("SEARCH_API_KEY", "  "),
        ]))
        .unwrap();
        assert_eq!(cfg.llm_api_key.as_deref(), Some("sk-1"));
        assert_eq!(cfg.search_model, "sonar");
        assert_eq!(cfg.pipeline.router_model, "router-x");
        assert_eq!(cfg.pipeline.planner_model, DEFAULT_MODEL);
        assert_eq!(cfg.pipeline.context_turns, 4);
        assert!(cfg.search_api_key.is_none());
    }

    #[test]
    fn store_path_comes_only_from_the_lookup() {
        let cfg = ResearchConfig::from_lookup(lookup(&[("RESEARCH_STORE_PATH", "")])).unwrap();
        assert_eq!(cfg.store_path, SqliteConversationStore::default_path());

        let cfg =
            ResearchConfig::from_lookup(lookup(&[("RESEARCH_STORE_PATH", "/tmp/r.sqlite")]))
                .unwrap();
        assert_eq!(cfg.store_path, PathBuf::from("/tmp/r.sqlite"));
    }

    #[test]
    fn missing_keys_are_config_errors() {
        let cfg = ResearchConfig::from_lookup(lookup(&[])).unwrap();
        assert!(matches!(cfg.chat_adapter(), Err(ProviderError::Config(_))));
        assert!(matches!(cfg.search_adapter(), Err(SearchError::Config(_))));
    }

    #[test]
    fn bad_number_is_reported() {
        let err = ResearchConfig::from_lookup(lookup(&[("RESEARCH_CONTEXT_TURNS", "ten")]))
            .unwrap_err();
        assert!(err.to_string().contains("RESEARCH_CONTEXT_TURNS"));
    }

    #[test]
    fn pipeline_config_deserializes_with_defaults() {
        let cfg: PipelineConfig = serde_json::from_str(r#"{"max_sub_queries": 2}"#).unwrap();
        assert_eq!(cfg.max_sub_queries, 2);
        assert_eq!(cfg.classify_timeout_secs, 15);
    }
}
