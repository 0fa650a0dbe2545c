use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use quarry_core::config::ModelConfig;
use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, Document, RefinedResult, SourceRef};

use crate::text::{extract_json, truncate_chars};

const REFINER_PROMPT: &str = r#"You grade web search results against a query. For the numbered documents:
1. Decide whether they answer the query.
2. Extract only the facts relevant to the query as one concise string.
3. List the 0-based indices of the documents you actually used.
4. Score the result from 0.0 (nothing relevant) to 1.0 (complete answer).

Reply with JSON only:
{"score": 0.0-1.0, "reason": "short explanation", "extracted_info": "facts", "source_indices": [0, 2]}"#;

/// Documents shown to the model per refinement.
const PROMPT_DOCUMENTS: usize = 5;
const PROMPT_EXCERPT_CHARS: usize = 500;
/// Documents used by the naive fallback extraction.
const FALLBACK_DOCUMENTS: usize = 3;
const FALLBACK_EXCERPT_CHARS: usize = 400;
const RETRY_THRESHOLD: f32 = 0.5;

/// A refined result plus the quality gate's verdict on it.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub result: RefinedResult,
    pub should_retry: bool,
    pub reason: String,
}

#[derive(Deserialize, Debug)]
struct RefinerResponse {
    score: f32,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    extracted_info: String,
    #[serde(default)]
    source_indices: Vec<usize>,
}

/// The quality gate applied after each search.
pub struct QualityRefiner {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
    max_retries: u32,
}

impl QualityRefiner {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, max_retries: u32) -> Self {
        Self {
            llm,
            config,
            max_retries,
        }
    }

    /// Grade `docs` against `query`. `attempt` is 0-based. Always returns a
    /// refinement; generation or parse failures fall back to naive extraction
    /// with a neutral score.
    pub async fn refine(&self, query: &str, docs: &[Document], attempt: u32) -> Refinement {
        info!(query = %query, documents = docs.len(), attempt = attempt + 1, "Refining search results");

        match self.try_refine(query, docs).await {
            Ok(resp) => {
                let score = if resp.score.is_finite() {
                    resp.score.clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let should_retry = score < RETRY_THRESHOLD && attempt < self.max_retries;
                debug!(query = %query, score, should_retry, "Refiner verdict");
                Refinement {
                    result: RefinedResult {
                        text: resp.extracted_info,
                        used_sources: sources_for(docs, &resp.source_indices),
                        source_query: query.to_string(),
                        quality: score,
                        failure_reason: None,
                    },
                    should_retry,
                    reason: resp.reason,
                }
            }
            Err(e) => {
                let should_retry = attempt < self.max_retries;
                warn!(query = %query, error = %e, should_retry, "Refiner unavailable, using naive extraction");
                let indices: Vec<usize> = (0..docs.len().min(FALLBACK_DOCUMENTS)).collect();
                Refinement {
                    result: RefinedResult {
                        text: naive_extract(docs),
                        used_sources: sources_for(docs, &indices),
                        source_query: query.to_string(),
                        quality: 0.5,
                        failure_reason: None,
                    },
                    should_retry,
                    reason: format!(
                        "refiner error (attempt {}/{}): {}",
                        attempt + 1,
                        self.max_retries + 1,
                        e
                    ),
                }
            }
        }
    }

    async fn try_refine(&self, query: &str, docs: &[Document]) -> Result<RefinerResponse> {
        let messages = vec![
            ChatMessage::system(REFINER_PROMPT),
            ChatMessage::user(build_user_prompt(query, docs)),
        ];
        let response = quarry_llm::generate_text(self.llm.as_ref(), &self.config, messages).await?;
        serde_json::from_str(extract_json(&response))
            .map_err(|e| QuarryError::LlmParse(format!("refiner: {}", e)))
    }
}

fn build_user_prompt(query: &str, docs: &[Document]) -> String {
    let listing = docs
        .iter()
        .take(PROMPT_DOCUMENTS)
        .enumerate()
        .map(|(i, doc)| {
            format!(
                "[{}] {}\n{}",
                i,
                doc.title,
                truncate_chars(doc.body(), PROMPT_EXCERPT_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!("Query: {}\n\nDocuments:\n{}", query, listing)
}

/// Resolve source indices against the document list. Out-of-range and
/// repeated indices are dropped.
fn sources_for(docs: &[Document], indices: &[usize]) -> Vec<SourceRef> {
    let mut seen = BTreeSet::new();
    indices
        .iter()
        .filter(|&&i| i < docs.len() && seen.insert(i))
        .map(|&i| {
            let doc = &docs[i];
            SourceRef {
                url: doc.url.clone(),
                title: doc.title.clone(),
                domain: doc
                    .domain
                    .clone()
                    .unwrap_or_else(|| quarry_search::domain_of(&doc.url)),
            }
        })
        .collect()
}

fn naive_extract(docs: &[Document]) -> String {
    let parts: Vec<String> = docs
        .iter()
        .take(FALLBACK_DOCUMENTS)
        .enumerate()
        .filter(|(_, doc)| !doc.body().is_empty())
        .map(|(i, doc)| {
            format!(
                "[{}] {}: {}",
                i + 1,
                doc.title,
                truncate_chars(doc.body(), FALLBACK_EXCERPT_CHARS)
            )
        })
        .collect();

    if parts.is_empty() {
        "No substantial information found.".to_string()
    } else {
        parts.join("\n\n")
    }
}
