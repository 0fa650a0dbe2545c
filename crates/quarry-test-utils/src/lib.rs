//! Deterministic in-process doubles for the LLM and web search seams.

pub mod llm;
pub mod search;

pub use llm::{Reply, ScriptedLlm};
pub use search::{document, ScriptedSearch};

use quarry_core::config::ModelConfig;

/// A model config that never reaches the network when used with the doubles.
pub fn test_model() -> ModelConfig {
    ModelConfig {
        provider: "openai".into(),
        model_id: "scripted".into(),
        api_key: None,
        base_url: None,
        max_tokens: 512,
        temperature: 0.0,
        retry: None,
    }
}
