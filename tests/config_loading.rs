use std::io::Write;

use quarry_core::config::{AppConfig, ModelRole};

fn load(toml_content: &str) -> AppConfig {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");
    AppConfig::load(tmp.path()).expect("load config")
}

#[test]
fn test_load_full_config_from_file() {
    let config = load(
        r#"
[research]
max_search_retries = 2
max_refiner_retries = 0
max_search_results = 8
min_content_chars = 20
workspace = "/tmp/quarry-test"

[session]
timeout_minutes = 5

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 5
initial_backoff_ms = 200

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o-mini"

[models.judge]
provider = "openai"
model_id = "gpt-4o"
temperature = 0.0

[web_search]
provider = "serper"
api_key = "serper-key"
"#,
    );

    assert_eq!(config.research.max_search_retries, 2);
    assert_eq!(config.research.max_refiner_retries, 0);
    assert_eq!(config.research.max_search_results, 8);
    assert_eq!(config.research.min_content_chars, 20);
    assert_eq!(config.session.timeout_minutes, 5);
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);

    let retry = config.model.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 200);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o-mini");

    let search = config.web_search.as_ref().expect("web search present");
    assert_eq!(search.provider, "serper");
    assert_eq!(search.api_key, "serper-key");

    assert_eq!(config.workspace_dir().to_str(), Some("/tmp/quarry-test"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("QUARRY_TEST_SEARCH_KEY", "expanded-key-value");

    let config = load(
        r#"
[model]
model_id = "test-model"

[web_search]
api_key = "${QUARRY_TEST_SEARCH_KEY}"
"#,
    );
    let search = config.web_search.expect("web search present");
    assert_eq!(search.api_key, "expanded-key-value");
    assert_eq!(search.provider, "tavily");

    std::env::remove_var("QUARRY_TEST_SEARCH_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let config = load(
        r#"
[model]
model_id = "llama3.2"
"#,
    );

    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.research.max_search_retries, 3);
    assert_eq!(config.research.max_refiner_retries, 1);
    assert_eq!(config.research.max_augment_attempts, 3);
    assert_eq!(config.research.max_search_results, 5);
    assert_eq!(config.research.min_content_chars, 50);
    assert_eq!(config.research.max_conversation_history, 10);
    assert_eq!(config.session.timeout_minutes, 30);
    assert!(config.fallback_models.is_empty());
    assert!(config.web_search.is_none());
    assert!(config.model.retry.is_none());
}

#[test]
fn test_role_models_inherit_main_model() {
    let config = load(
        r#"
[model]
provider = "openai"
model_id = "gpt-4o"
temperature = 0.9

[models.synthesizer]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
temperature = 0.7
"#,
    );

    let refiner = config.model_for(ModelRole::Refiner);
    assert_eq!(refiner.model_id, "gpt-4o");
    assert_eq!(refiner.provider, "openai");
    assert!((refiner.temperature - 0.2).abs() < f32::EPSILON);

    let synthesizer = config.model_for(ModelRole::Synthesizer);
    assert_eq!(synthesizer.provider, "anthropic");
    assert!((synthesizer.temperature - 0.7).abs() < f32::EPSILON);
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/quarry.toml")).unwrap_err();
    assert!(err.to_string().contains("quarry.toml"));
}
