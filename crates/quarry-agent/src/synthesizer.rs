use std::collections::HashSet;
use std::sync::Arc;

use tracing::{error, info};

use quarry_core::config::ModelConfig;
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, Citation, Confidence, RefinedResult, ResearchAnswer};

use crate::text::{extract_tagged, truncate_chars};

const SYNTHESIZER_PROMPT: &str = "You are a research assistant writing an answer from numbered research findings.
Ground every statement in the findings and cite them inline as [Source N].
If findings disagree, present both positions and say that they disagree.
If the findings do not fully answer the question, say what is missing.
Do not add knowledge that is not in the findings.";

const SOURCE_EXCERPT_CHARS: usize = 600;
const GENERATION_FAILED: &str = "I encountered an error generating the answer.";
const NOTHING_TO_SYNTHESIZE: &str = "I couldn't find relevant information to answer this question.";

/// Writes the final cited answer from accumulated refined results.
pub struct AnswerSynthesizer {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self { llm, config }
    }

    pub async fn synthesize(&self, query: &str, refined: &[RefinedResult]) -> ResearchAnswer {
        if refined.is_empty() {
            return ResearchAnswer::unsupported(NOTHING_TO_SYNTHESIZE);
        }

        let messages = vec![
            ChatMessage::system(SYNTHESIZER_PROMPT),
            ChatMessage::user(format!(
                "Question: {}\n\nResearch findings:\n{}\n\nWrite a well-structured answer with [Source N] citations.",
                query,
                build_context(refined)
            )),
        ];

        let answer = match quarry_llm::generate_text(self.llm.as_ref(), &self.config, messages).await {
            Ok(text) => extract_tagged(&text, "response").unwrap_or_else(|| text.trim().to_string()),
            Err(e) => {
                error!(error = %e, "Answer generation failed");
                GENERATION_FAILED.to_string()
            }
        };

        let citations = citations_from(refined);
        info!(citations = citations.len(), "Answer synthesized");

        ResearchAnswer {
            answer,
            citations,
            confidence: confidence_for(refined),
            conflicts_detected: detect_conflicts(refined),
        }
    }
}

fn build_context(refined: &[RefinedResult]) -> String {
    refined
        .iter()
        .enumerate()
        .map(|(i, r)| format!("Source {}: {}", i + 1, truncate_chars(&r.text, SOURCE_EXCERPT_CHARS)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Union of used sources, first occurrence of each url wins.
pub fn citations_from(refined: &[RefinedResult]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    refined
        .iter()
        .flat_map(|r| r.used_sources.iter())
        .filter(|s| !s.url.is_empty() && seen.insert(s.url.clone()))
        .map(|s| Citation {
            title: s.title.clone(),
            domain: s.domain.clone(),
            url: s.url.clone(),
        })
        .collect()
}

/// Confidence from the number of sources behind the results, repeats included.
pub fn confidence_for(refined: &[RefinedResult]) -> Confidence {
    match refined.iter().map(|r| r.used_sources.len()).sum::<usize>() {
        n if n >= 3 => Confidence::High,
        2 => Confidence::Medium,
        _ => Confidence::Low,
    }
}

pub fn detect_conflicts(refined: &[RefinedResult]) -> bool {
    refined.iter().any(|r| {
        let text = r.text.to_lowercase();
        ["conflict", "disagree", "however"]
            .iter()
            .any(|marker| text.contains(marker))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::types::SourceRef;
    use quarry_test_utils::{test_model, Reply, ScriptedLlm};

    fn synthesizer(reply: impl Into<Reply>) -> AnswerSynthesizer {
        AnswerSynthesizer::new(Arc::new(ScriptedLlm::replying(reply)), test_model())
    }

    fn source(url: &str) -> SourceRef {
        SourceRef {
            url: url.into(),
            title: format!("title {}", url),
            domain: "example.com".into(),
        }
    }

    fn result(text: &str, sources: Vec<SourceRef>) -> RefinedResult {
        RefinedResult {
            text: text.into(),
            used_sources: sources,
            source_query: "q".into(),
            quality: 0.8,
            failure_reason: None,
        }
    }

    #[test]
    fn test_citations_dedup_by_url() {
        let refined = vec![
            result("a", vec![source("https://a"), source("")]),
            result("b", vec![source("https://b"), source("https://a")]),
        ];
        let urls: Vec<_> = citations_from(&refined).into_iter().map(|c| c.url).collect();
        assert_eq!(urls, vec!["https://a", "https://b"]);
    }

    #[test]
    fn test_confidence_thresholds() {
        assert_eq!(confidence_for(&[result("a", vec![source("1")])]), Confidence::Low);
        assert_eq!(
            confidence_for(&[result("a", vec![source("1"), source("2")])]),
            Confidence::Medium
        );
        assert_eq!(
            confidence_for(&[
                result("a", vec![source("1"), source("2")]),
                result("b", vec![source("1")]),
            ]),
            Confidence::High
        );
    }

    #[test]
    fn test_conflict_markers() {
        assert!(detect_conflicts(&[result("Sources DISAGREE on the date", vec![])]));
        assert!(!detect_conflicts(&[result("Paris is the capital", vec![])]));
    }

    #[test]
    fn test_context_is_numbered_and_truncated() {
        let context = build_context(&[result("first", vec![]), result(&"z".repeat(700), vec![])]);
        assert!(context.starts_with("Source 1: first\n\nSource 2: "));
        assert_eq!(context.len(), "Source 1: first\n\nSource 2: ".len() + 600);
    }

    #[tokio::test]
    async fn test_synthesize_strips_response_tags() {
        let answer = synthesizer("<response>Paris [Source 1]</response>")
            .synthesize("capital?", &[result("Paris", vec![source("https://a")])])
            .await;
        assert_eq!(answer.answer, "Paris [Source 1]");
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn test_generation_failure_keeps_citations() {
        let answer = synthesizer(Reply::fail("HTTP 500"))
            .synthesize("q", &[result("x", vec![source("https://a"), source("https://b")])])
            .await;
        assert_eq!(answer.answer, GENERATION_FAILED);
        assert_eq!(answer.citations.len(), 2);
    }
}
