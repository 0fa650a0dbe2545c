use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QuarryError, Result};

/// Top-level Quarry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub models: RoleModels,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
}

/// Budgets and limits for the research pipeline.
///
/// The two retry budgets are independent: `max_search_retries`
/// bounds the per-query search loop (empty or content-poor results), while
/// `max_refiner_retries` bounds how often the quality gate may ask for
/// another search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_max_search_retries")]
    pub max_search_retries: u32,
    #[serde(default = "default_max_refiner_retries")]
    pub max_refiner_retries: u32,
    /// Total augmentation calls per step, the first one included: the
    /// default of 3 means one attempt plus two retries with the same prompt.
    /// Values below 1 are raised to 1.
    #[serde(default = "default_max_augment_attempts")]
    pub max_augment_attempts: u32,
    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,
    /// Documents whose trimmed content is not longer than this are dropped.
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,
    #[serde(default = "default_dependency_excerpt_chars")]
    pub dependency_excerpt_chars: usize,
    #[serde(default = "default_conversation_tail")]
    pub conversation_tail: usize,
    #[serde(default = "default_max_conversation_history")]
    pub max_conversation_history: usize,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_search_retries: default_max_search_retries(),
            max_refiner_retries: default_max_refiner_retries(),
            max_augment_attempts: default_max_augment_attempts(),
            max_search_results: default_max_search_results(),
            min_content_chars: default_min_content_chars(),
            dependency_excerpt_chars: default_dependency_excerpt_chars(),
            conversation_tail: default_conversation_tail(),
            max_conversation_history: default_max_conversation_history(),
            workspace: default_workspace(),
        }
    }
}

fn default_max_search_retries() -> u32 { 3 }
fn default_max_refiner_retries() -> u32 { 1 }
fn default_max_augment_attempts() -> u32 { 3 }
fn default_max_search_results() -> usize { 5 }
fn default_min_content_chars() -> usize { 50 }
fn default_dependency_excerpt_chars() -> usize { 300 }
fn default_conversation_tail() -> usize { 3 }
fn default_max_conversation_history() -> usize { 10 }
fn default_workspace() -> String { "~/.quarry".to_string() }

/// Session continuity settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are not resumed.
    #[serde(default = "default_session_timeout")]
    pub timeout_minutes: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_session_timeout(),
        }
    }
}

fn default_session_timeout() -> i64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.3 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Pipeline roles that may run on their own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Strategist,
    Refiner,
    Augmenter,
    Synthesizer,
    Judge,
}

impl ModelRole {
    /// Temperature used when the role inherits the main model.
    pub fn default_temperature(&self) -> f32 {
        match self {
            ModelRole::Strategist => 0.3,
            ModelRole::Refiner => 0.2,
            ModelRole::Augmenter => 0.4,
            ModelRole::Synthesizer => 0.4,
            ModelRole::Judge => 0.0,
        }
    }
}

/// Optional per-role model overrides (`[models.<role>]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleModels {
    #[serde(default)]
    pub strategist: Option<ModelConfig>,
    #[serde(default)]
    pub refiner: Option<ModelConfig>,
    #[serde(default)]
    pub augmenter: Option<ModelConfig>,
    #[serde(default)]
    pub synthesizer: Option<ModelConfig>,
    #[serde(default)]
    pub judge: Option<ModelConfig>,
}

impl RoleModels {
    fn get(&self, role: ModelRole) -> Option<&ModelConfig> {
        match role {
            ModelRole::Strategist => self.strategist.as_ref(),
            ModelRole::Refiner => self.refiner.as_ref(),
            ModelRole::Augmenter => self.augmenter.as_ref(),
            ModelRole::Synthesizer => self.synthesizer.as_ref(),
            ModelRole::Judge => self.judge.as_ref(),
        }
    }
}

/// Web search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    pub api_key: String,
}

fn default_search_provider() -> String { "tavily".to_string() }

impl AppConfig {
    /// Configuration with every section defaulted around one main model.
    pub fn from_model(model: ModelConfig) -> Self {
        Self {
            research: ResearchConfig::default(),
            session: SessionConfig::default(),
            model,
            fallback_models: Vec::new(),
            models: RoleModels::default(),
            web_search: None,
        }
    }

    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| QuarryError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);
        debug!(path = %path.display(), "Loaded config file");

        toml::from_str(&expanded).map_err(|e| QuarryError::Config(e.to_string()))
    }

    /// Model settings for a pipeline role. An explicit `[models.<role>]`
    /// section wins; otherwise the main model is used with the role's
    /// default temperature.
    pub fn model_for(&self, role: ModelRole) -> ModelConfig {
        match self.models.get(role) {
            Some(explicit) => explicit.clone(),
            None => {
                let mut inherited = self.model.clone();
                inherited.temperature = role.default_temperature();
                inherited
            }
        }
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.research.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => {
                    warn!(var = %var_name, "Config references an unset environment variable");
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_QUARRY_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_QUARRY_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_QUARRY_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_QUARRY_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_QUARRY_VAR}\"");
    }

    #[test]
    fn test_research_defaults_from_minimal_toml() {
        let toml_str = r#"
[model]
model_id = "claude-sonnet-4-20250514"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.research.max_search_retries, 3);
        assert_eq!(config.research.max_refiner_retries, 1);
        assert_eq!(config.research.max_augment_attempts, 3);
        assert_eq!(config.research.max_search_results, 5);
        assert_eq!(config.research.min_content_chars, 50);
        assert_eq!(config.research.dependency_excerpt_chars, 300);
        assert_eq!(config.research.conversation_tail, 3);
        assert_eq!(config.research.max_conversation_history, 10);
        assert_eq!(config.session.timeout_minutes, 30);
        assert_eq!(config.model.provider, "anthropic");
        assert!(config.web_search.is_none());
    }

    #[test]
    fn test_model_for_inherits_main_model_with_role_temperature() {
        let toml_str = r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
temperature = 0.7
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let refiner = config.model_for(ModelRole::Refiner);
        assert_eq!(refiner.model_id, "gpt-4o-mini");
        assert_eq!(refiner.provider, "openai");
        assert_eq!(refiner.temperature, 0.2);
        assert_eq!(config.model_for(ModelRole::Augmenter).temperature, 0.4);
        assert_eq!(config.model_for(ModelRole::Strategist).temperature, 0.3);
    }

    #[test]
    fn test_model_for_prefers_explicit_role_section() {
        let toml_str = r#"
[model]
model_id = "claude-sonnet-4-20250514"

[models.strategist]
provider = "openai"
model_id = "gpt-4o-mini"
temperature = 0.1
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let strategist = config.model_for(ModelRole::Strategist);
        assert_eq!(strategist.provider, "openai");
        assert_eq!(strategist.model_id, "gpt-4o-mini");
        assert_eq!(strategist.temperature, 0.1);
        assert_eq!(
            config.model_for(ModelRole::Synthesizer).model_id,
            "claude-sonnet-4-20250514"
        );
    }

    #[test]
    fn test_workspace_dir_absolute_path_unchanged() {
        let toml_str = r#"
[research]
workspace = "/var/lib/quarry"

[model]
model_id = "m"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workspace_dir(), PathBuf::from("/var/lib/quarry"));
    }
}
