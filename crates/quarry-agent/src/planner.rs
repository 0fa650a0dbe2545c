use std::sync::Arc;

use tracing::{debug, info, warn};

use quarry_core::config::ModelConfig;
use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, ResearchPlan};

use crate::text::{extract_json, extract_tagged};

const STRATEGIST_PROMPT: &str = r#"You plan web research. Given a conversation and a current question, produce an execution plan for a research system. Do not answer the question yourself.

Rules:
- Rewrite queries so they are self-contained: full entity names, no pronouns that depend on earlier turns.
- Use "single" execution when one round of searching answers the question; use "chain" when later searches need facts found by earlier ones.
- Each step is either "fetch" (issue web searches) or "synthesize" (combine what is already known, no queries).
- A fetch step runs its queries "sequential" (only the first query is issued) or "fanout" (all queries run concurrently and independently).
- "depends_on" lists only step_ids of earlier steps. Use [] when a step has no dependencies.
- End a chain with a synthesize step.
- Keep the number of steps and queries small.

Reply with the plan inside <response></response> tags as JSON matching:
{
  "execution_type": "single" | "chain",
  "steps": [
    {
      "step_id": 1,
      "description": "what this step finds out",
      "kind": "fetch" | "synthesize",
      "mode": "sequential" | "fanout",
      "depends_on": [],
      "queries": [{"query": "search text", "purpose": "why"}]
    }
  ],
  "rationale": "one sentence",
  "confidence": 0.0-1.0
}"#;

/// Turns a user question into a validated research plan.
///
/// Planning never fails: generation errors, unparsable output and plans that
/// violate the structural invariants all degrade to
/// [`ResearchPlan::fallback`].
pub struct PlanBuilder {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl PlanBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { llm, config }
    }

    pub async fn plan(&self, query: &str, history: &[ChatMessage]) -> ResearchPlan {
        info!(query = %query, "Planning research");

        match self.try_plan(query, history).await {
            Ok(plan) => {
                info!(
                    execution_type = %plan.execution_type,
                    steps = plan.steps.len(),
                    confidence = plan.confidence,
                    "Plan ready"
                );
                plan
            }
            Err(e) => {
                warn!(error = %e, "Planning failed, using single-step fallback");
                ResearchPlan::fallback(query, e)
            }
        }
    }

    async fn try_plan(&self, query: &str, history: &[ChatMessage]) -> Result<ResearchPlan> {
        let messages = vec![
            ChatMessage::system(STRATEGIST_PROMPT),
            ChatMessage::user(build_user_prompt(query, history)),
        ];
        let response = quarry_llm::generate_text(self.llm.as_ref(), &self.config, messages).await?;
        debug!(response = %response, "Strategist response");
        parse_plan(&response)
    }
}

fn build_user_prompt(query: &str, history: &[ChatMessage]) -> String {
    let history_text = if history.is_empty() {
        "(no previous conversation)".to_string()
    } else {
        history
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "<conversation_history>\n{}\n</conversation_history>\n\n<current_query>\n{}\n</current_query>",
        history_text, query
    )
}

/// Parse and validate a plan from raw model output.
pub fn parse_plan(response: &str) -> Result<ResearchPlan> {
    let body = extract_tagged(response, "response").unwrap_or_else(|| response.to_string());
    let plan: ResearchPlan = serde_json::from_str(extract_json(&body))
        .map_err(|e| QuarryError::LlmParse(format!("plan: {}", e)))?;
    plan.validate()?;
    Ok(plan)
}
