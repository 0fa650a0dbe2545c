use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use quarry_core::config::ModelConfig;
use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, ExecutionStep, SearchQuery, StepMode};

use crate::text::{extract_json, truncate_chars};

const AUGMENTER_PROMPT: &str = r#"You rewrite one step of a research plan using facts that earlier steps have already found.

Replace generic references in the step with the concrete names, dates and figures from the previous results. Keep the step's purpose. If the step runs in fanout mode and the previous results mention several entities, emit one query per entity.

Reply with JSON only, keeping step_id unchanged:
{"step_id": 2, "description": "rewritten description", "queries": [{"query": "search text", "purpose": "why"}]}"#;

/// Characters of each conversation message given to the augmenter.
const CONVERSATION_EXCERPT_CHARS: usize = 200;

#[derive(Deserialize, Debug)]
struct AugmentedStep {
    step_id: u32,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "search_queries")]
    queries: Vec<SearchQuery>,
}

/// Rewrites a dependent step's queries from the results of its dependencies.
pub struct ContextAugmenter {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    max_attempts: u32,
}

impl ContextAugmenter {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, max_attempts: u32) -> Self {
        Self {
            llm,
            config,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Produce a rewritten copy of `step`. Only the description and queries
    /// may change. When every attempt fails the original step is returned.
    pub async fn augment(
        &self,
        step: &ExecutionStep,
        original_query: &str,
        dependency_text: &str,
        conversation_tail: &[ChatMessage],
    ) -> ExecutionStep {
        info!(step_id = step.step_id, "Augmenting step from dependency results");
        let prompt = build_user_prompt(step, original_query, dependency_text, conversation_tail);

        for attempt in 1..=self.max_attempts {
            match self.try_augment(step, &prompt).await {
                Ok(rewritten) => {
                    debug!(
                        step_id = step.step_id,
                        queries = rewritten.queries.len(),
                        attempt,
                        "Step augmented"
                    );
                    return rewritten;
                }
                Err(e) => {
                    warn!(step_id = step.step_id, attempt, error = %e, "Augmentation attempt failed");
                }
            }
        }

        warn!(step_id = step.step_id, "Augmentation exhausted, keeping original step");
        step.clone()
    }

    async fn try_augment(&self, step: &ExecutionStep, prompt: &str) -> Result<ExecutionStep> {
        let messages = vec![
            ChatMessage::system(AUGMENTER_PROMPT),
            ChatMessage::user(prompt),
        ];
        let response = quarry_llm::generate_text(self.llm.as_ref(), &self.config, messages).await?;
        parse_augmented(&response, step)
    }
}

fn build_user_prompt(
    step: &ExecutionStep,
    original_query: &str,
    dependency_text: &str,
    conversation_tail: &[ChatMessage],
) -> String {
    let conversation = if conversation_tail.is_empty() {
        "(no previous conversation)".to_string()
    } else {
        conversation_tail
            .iter()
            .map(|m| {
                format!(
                    "{}: {}",
                    m.role.as_str(),
                    truncate_chars(&m.content, CONVERSATION_EXCERPT_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let step_json = serde_json::to_string_pretty(step).unwrap_or_else(|_| step.description.clone());
    let mode_hint = match step.mode {
        StepMode::Fanout => "fanout: expand into one query per entity found above",
        StepMode::Sequential => "sequential: a single query is issued",
    };

    format!(
        "Original question: {}\n\nConversation:\n{}\n\nPrevious results:\n{}\n\nStep to rewrite ({}):\n{}",
        original_query,
        conversation,
        if dependency_text.is_empty() {
            "(no previous results)"
        } else {
            dependency_text
        },
        mode_hint,
        step_json
    )
}

/// Parse the model's rewrite and carry the step's identity over. A reply for
/// a different step, or one without queries, is rejected.
fn parse_augmented(response: &str, step: &ExecutionStep) -> Result<ExecutionStep> {
    let parsed: AugmentedStep = serde_json::from_str(extract_json(response))
        .map_err(|e| QuarryError::LlmParse(format!("augmented step: {}", e)))?;

    if parsed.step_id != step.step_id {
        return Err(QuarryError::LlmParse(format!(
            "augmented step id {} does not match step {}",
            parsed.step_id, step.step_id
        )));
    }
    let queries: Vec<SearchQuery> = parsed
        .queries
        .into_iter()
        .filter(|q| !q.query.trim().is_empty())
        .collect();
    if queries.is_empty() {
        return Err(QuarryError::LlmParse("augmented step has no queries".into()));
    }

    let description = if parsed.description.trim().is_empty() {
        step.description.clone()
    } else {
        parsed.description
    };
    Ok(step.rewritten(description, queries))
}
