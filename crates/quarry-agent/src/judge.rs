use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use quarry_core::config::ModelConfig;
use quarry_core::traits::LlmClient;
use quarry_core::types::ChatMessage;

use crate::research::ResearchOutcome;
use crate::text::{extract_json, truncate_chars};

const JUDGE_PROMPT: &str = r#"You evaluate the workflow of a web research agent. Score each component from 0.0 to 1.0:
- strategy: was the plan (single vs chain, steps, dependencies) appropriate for the question?
- search: were the queries specific and effective?
- refinement: did the extracted information answer the queries?
- context: were dependent queries improved using earlier results? Score 1.0 when no step needed it.
- answer: is the final answer accurate, complete and grounded in its citations?

Be strict; reserve 1.0 for exceptional work. Reply with JSON only:
{"strategy_score": 0.0, "search_score": 0.0, "refinement_score": 0.0, "context_score": 0.0, "answer_score": 0.0, "overall_score": 0.0, "reasoning": "short explanation"}"#;

const EXTRACT_PREVIEW_CHARS: usize = 200;

/// Component scores for one research outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    #[serde(default)]
    pub strategy_score: f32,
    #[serde(default)]
    pub search_score: f32,
    #[serde(default)]
    pub refinement_score: f32,
    #[serde(default)]
    pub context_score: f32,
    #[serde(default)]
    pub answer_score: f32,
    #[serde(default)]
    pub overall_score: f32,
    #[serde(default)]
    pub reasoning: String,
}

impl Evaluation {
    /// Neutral scores used when the judge cannot be consulted.
    pub fn neutral(reason: impl Into<String>) -> Self {
        Self {
            strategy_score: 0.5,
            search_score: 0.5,
            refinement_score: 0.5,
            context_score: 0.5,
            answer_score: 0.5,
            overall_score: 0.5,
            reasoning: reason.into(),
        }
    }

    pub fn weighted_overall(&self) -> f32 {
        self.strategy_score * 0.20
            + self.search_score * 0.20
            + self.refinement_score * 0.20
            + self.context_score * 0.10
            + self.answer_score * 0.30
    }
}

/// LLM-as-judge over a completed research call.
pub struct ResearchJudge {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl ResearchJudge {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { llm, config }
    }

    pub async fn evaluate(&self, outcome: &ResearchOutcome) -> Evaluation {
        let messages = vec![
            ChatMessage::system(JUDGE_PROMPT),
            ChatMessage::user(build_prompt(outcome)),
        ];

        match quarry_llm::generate_text(self.llm.as_ref(), &self.config, messages).await {
            Ok(response) => {
                let evaluation = parse_evaluation(&response);
                info!(overall = evaluation.overall_score, "Research evaluated");
                evaluation
            }
            Err(e) => {
                warn!(error = %e, "Judge LLM call failed");
                Evaluation::neutral(format!("judge unavailable: {}", e))
            }
        }
    }
}

fn build_prompt(outcome: &ResearchOutcome) -> String {
    let mut out = format!("<question>{}</question>\n\n<plan>\n", outcome.query);

    match &outcome.plan {
        Some(plan) => {
            out.push_str(&format!(
                "Type: {}\nRationale: {}\nConfidence: {:.2}\n",
                plan.execution_type, plan.rationale, plan.confidence
            ));
            for step in &plan.steps {
                let queries: Vec<&str> = step.queries.iter().map(|q| q.query.as_str()).collect();
                out.push_str(&format!(
                    "- step {} {:?}/{:?} depends_on {:?}: {}\n  queries: {}\n",
                    step.step_id,
                    step.kind,
                    step.mode,
                    step.depends_on,
                    step.description,
                    queries.join(" | ")
                ));
            }
        }
        None => out.push_str("(planning did not complete)\n"),
    }
    out.push_str("</plan>\n\n<execution>\n");

    for step in &outcome.executed_steps {
        let planned = outcome
            .plan
            .as_ref()
            .and_then(|p| p.steps.iter().find(|s| s.step_id == step.step_id));
        if let Some(planned) = planned {
            if planned.queries != step.queries {
                let rewritten: Vec<&str> = step.queries.iter().map(|q| q.query.as_str()).collect();
                out.push_str(&format!(
                    "Step {} queries rewritten from context: {}\n",
                    step.step_id,
                    rewritten.join(" | ")
                ));
            }
        }
        for result in outcome.step_results.get(&step.step_id).into_iter().flatten() {
            out.push_str(&format!(
                "Step {} query '{}' score {:.2} sources {}: {}\n",
                step.step_id,
                result.source_query,
                result.quality,
                result.used_sources.len(),
                truncate_chars(&result.text, EXTRACT_PREVIEW_CHARS)
            ));
        }
    }
    out.push_str("</execution>\n\n");

    out.push_str(&format!("<answer>\n{}\n</answer>\n\n<citations>\n", outcome.answer.answer));
    for (i, c) in outcome.answer.citations.iter().enumerate() {
        out.push_str(&format!("{}. {} ({})\n", i + 1, c.title, c.domain));
    }
    out.push_str("</citations>");
    out
}

/// Parse judge output. The overall score is recomputed from the weighted
/// components when missing or zero; unparsable output is neutral.
pub fn parse_evaluation(response: &str) -> Evaluation {
    match serde_json::from_str::<Evaluation>(extract_json(response)) {
        Ok(mut evaluation) => {
            for score in [
                &mut evaluation.strategy_score,
                &mut evaluation.search_score,
                &mut evaluation.refinement_score,
                &mut evaluation.context_score,
                &mut evaluation.answer_score,
                &mut evaluation.overall_score,
            ] {
                *score = if score.is_finite() { (*score).clamp(0.0, 1.0) } else { 0.0 };
            }
            if evaluation.overall_score == 0.0 {
                evaluation.overall_score = evaluation.weighted_overall();
            }
            evaluation
        }
        Err(e) => {
            warn!(error = %e, "Failed to parse judge response");
            Evaluation::neutral("unparsable judge response")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_recomputed_when_missing() {
        let eval = parse_evaluation(
            r#"{"strategy_score": 1.0, "search_score": 0.5, "refinement_score": 0.5,
                "context_score": 1.0, "answer_score": 1.0, "reasoning": "ok"}"#,
        );
        assert!((eval.overall_score - 0.8).abs() < 1e-6);
        assert_eq!(eval.reasoning, "ok");
    }

    #[test]
    fn test_explicit_overall_kept() {
        let eval = parse_evaluation(
            "```json\n{\"strategy_score\": 0.9, \"answer_score\": 0.9, \"overall_score\": 0.7}\n```",
        );
        assert_eq!(eval.overall_score, 0.7);
        assert_eq!(eval.search_score, 0.0);
    }

    #[test]
    fn test_unparsable_is_neutral() {
        let eval = parse_evaluation("The research looks fine to me.");
        assert_eq!(eval, Evaluation::neutral("unparsable judge response"));
    }

    #[test]
    fn test_scores_are_clamped() {
        let eval = parse_evaluation(r#"{"answer_score": 7.0, "overall_score": -1.0}"#);
        assert_eq!(eval.answer_score, 1.0);
        assert!((eval.overall_score - 0.3).abs() < 1e-6);
    }
}
