use std::sync::Arc;

use tracing::{debug, info, warn};

use quarry_core::event::EventBus;
use quarry_core::traits::WebSearch;
use quarry_core::types::{Document, RefinedResult, ResearchEvent};

use crate::refiner::QualityRefiner;

const EXHAUSTED_REASON: &str = "All search attempts failed (empty results or no substantial content)";

/// Limits applied by [`QueryResolver`].
#[derive(Debug, Clone, Copy)]
pub struct ResolverLimits {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub max_results: usize,
    /// Documents whose trimmed content is not longer than this are dropped.
    pub min_content_chars: usize,
}

/// Keep whichever result has the higher quality. Ties keep the earlier one.
pub fn best_of(best: Option<RefinedResult>, candidate: RefinedResult) -> Option<RefinedResult> {
    match best {
        Some(current) if current.quality >= candidate.quality => Some(current),
        _ => Some(candidate),
    }
}

/// The per-query search/refine loop. Always produces a result.
pub struct QueryResolver {
    search: Arc<dyn WebSearch>,
    refiner: QualityRefiner,
    events: Arc<EventBus>,
    limits: ResolverLimits,
}

impl QueryResolver {
    pub fn new(
        search: Arc<dyn WebSearch>,
        refiner: QualityRefiner,
        events: Arc<EventBus>,
        limits: ResolverLimits,
    ) -> Self {
        Self {
            search,
            refiner,
            events,
            limits,
        }
    }

    /// Resolve one query into a refined result. `original_query` is the
    /// top-level question and is only used for tracing.
    pub async fn resolve(&self, query: &str, original_query: &str) -> RefinedResult {
        let attempts = self.limits.max_retries + 1;
        let mut best: Option<RefinedResult> = None;

        for attempt in 0..attempts {
            self.events.publish(ResearchEvent::QueryAttempt {
                query: query.to_string(),
                attempt: attempt + 1,
            });

            let docs = match self.fetch(query, attempt).await {
                Some(docs) => docs,
                None => continue,
            };

            let refinement = self.refiner.refine(query, &docs, attempt).await;
            self.events.publish(ResearchEvent::RefinerScored {
                query: query.to_string(),
                attempt: attempt + 1,
                score: refinement.result.quality,
                reason: refinement.reason.clone(),
            });

            if !refinement.should_retry {
                debug!(query = %query, original = %original_query, score = refinement.result.quality, "Query resolved");
                return refinement.result;
            }
            best = best_of(best, refinement.result);
        }

        match best {
            Some(result) => {
                info!(query = %query, score = result.quality, "Retries exhausted, using best result");
                self.events.publish(ResearchEvent::BestResultUsed {
                    query: query.to_string(),
                    score: result.quality,
                });
                result
            }
            None => {
                warn!(query = %query, attempts, "No usable search results");
                RefinedResult::failure(query, EXHAUSTED_REASON)
            }
        }
    }

    /// One search attempt, filtered to documents with substantial content.
    /// `None` marks a failed attempt.
    async fn fetch(&self, query: &str, attempt: u32) -> Option<Vec<Document>> {
        let docs = match self.search.search(query, self.limits.max_results).await {
            Ok(docs) => docs,
            Err(e) => {
                warn!(query = %query, provider = self.search.name(), error = %e, "Search failed");
                self.reject(query, attempt, format!("search failed: {}", e));
                return None;
            }
        };

        if docs.is_empty() {
            self.reject(query, attempt, "no results".to_string());
            return None;
        }

        let total = docs.len();
        let substantial: Vec<Document> = docs
            .into_iter()
            .filter(|d| d.has_substantial_content(self.limits.min_content_chars))
            .collect();
        if substantial.is_empty() {
            self.reject(
                query,
                attempt,
                format!("{} results, none with substantial content", total),
            );
            return None;
        }

        debug!(query = %query, kept = substantial.len(), total, "Search results filtered");
        Some(substantial)
    }

    fn reject(&self, query: &str, attempt: u32, reason: String) {
        debug!(query = %query, attempt = attempt + 1, reason = %reason, "Search attempt rejected");
        self.events.publish(ResearchEvent::SearchRejected {
            query: query.to_string(),
            attempt: attempt + 1,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_test_utils::{test_model, Reply, ScriptedLlm, ScriptedSearch};

    fn result(quality: f32, text: &str) -> RefinedResult {
        RefinedResult {
            text: text.into(),
            used_sources: vec![],
            source_query: "q".into(),
            quality,
            failure_reason: None,
        }
    }

    #[test]
    fn test_best_of_keeps_max_quality() {
        let best = [0.3, 0.7, 0.5]
            .iter()
            .enumerate()
            .fold(None, |acc, (i, q)| best_of(acc, result(*q, &i.to_string())));
        assert_eq!(best.unwrap().text, "1");
    }

    #[test]
    fn test_best_of_tie_keeps_earlier() {
        let best = best_of(Some(result(0.4, "first")), result(0.4, "second"));
        assert_eq!(best.unwrap().text, "first");
    }

    fn doc(content: &str) -> Document {
        Document {
            title: "T".into(),
            url: "https://example.com/a".into(),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    fn substantial() -> Document {
        doc(&"relevant fact ".repeat(10))
    }

    fn resolver(
        search: Vec<std::result::Result<Vec<Document>, String>>,
        llm: ScriptedLlm,
    ) -> (QueryResolver, Arc<ScriptedSearch>, Arc<ScriptedLlm>) {
        let search = Arc::new(ScriptedSearch::script(search));
        let llm = Arc::new(llm);
        let refiner = QualityRefiner::new(llm.clone(), test_model(), 1);
        let limits = ResolverLimits {
            max_retries: 3,
            max_results: 5,
            min_content_chars: 50,
        };
        (
            QueryResolver::new(search.clone(), refiner, Arc::new(EventBus::default()), limits),
            search,
            llm,
        )
    }

    fn replies(replies: &[&str]) -> ScriptedLlm {
        ScriptedLlm::script(replies.iter().map(|r| Reply::from(*r)).collect())
    }

    #[tokio::test]
    async fn test_good_first_attempt_returns_immediately() {
        let (r, search, llm) = resolver(
            vec![Ok(vec![substantial()])],
            replies(&[r#"{"score":0.8,"extracted_info":"fact","source_indices":[0]}"#]),
        );
        let out = r.resolve("q", "q").await;
        assert_eq!(out.quality, 0.8);
        assert_eq!(search.calls().len(), 1);
        assert_eq!(llm.calls(), 1);
    }

    #[tokio::test]
    async fn test_empty_and_thin_results_skip_refiner() {
        let (r, search, llm) = resolver(
            vec![Ok(vec![]), Ok(vec![doc("too short")])],
            ScriptedLlm::failing("refiner should not be called"),
        );
        let out = r.resolve("q", "q").await;
        assert_eq!(out.quality, 0.0);
        assert_eq!(out.failure_reason.as_deref(), Some(EXHAUSTED_REASON));
        assert_eq!(search.calls().len(), 4);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_search_error_counts_as_failed_attempt() {
        let (r, search, _) = resolver(
            vec![Err("down".into()), Ok(vec![substantial()])],
            replies(&[r#"{"score":0.6,"extracted_info":"late","source_indices":[]}"#]),
        );
        let out = r.resolve("q", "q").await;
        assert_eq!(out.text, "late");
        assert_eq!(search.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_low_score_retry_then_stop_returns_current() {
        // 0.4 with budget left -> retry; 0.3 without budget -> stop and
        // return the current attempt even though it scored lower.
        let (r, _, llm) = resolver(
            vec![Ok(vec![substantial()])],
            replies(&[
                r#"{"score":0.4,"extracted_info":"first"}"#,
                r#"{"score":0.3,"extracted_info":"second"}"#,
            ]),
        );
        let out = r.resolve("q", "q").await;
        assert_eq!(out.text, "second");
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_best_result() {
        // Attempt 1 refined (0.4, retry), attempts 2-4 come back empty.
        let (r, search, _) = resolver(
            vec![Ok(vec![substantial()]), Ok(vec![])],
            replies(&[r#"{"score":0.4,"extracted_info":"partial"}"#]),
        );
        let out = r.resolve("q", "q").await;
        assert_eq!(out.text, "partial");
        assert_eq!(out.quality, 0.4);
        assert_eq!(search.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_identical_doubles_give_identical_results() {
        let make = || {
            resolver(
                vec![Ok(vec![substantial()])],
                replies(&[r#"{"score":0.75,"extracted_info":"stable","source_indices":[0]}"#]),
            )
            .0
        };
        let a = make().resolve("q", "q").await;
        let b = make().resolve("q", "q").await;
        assert_eq!(a.text, b.text);
        assert_eq!(a.quality, b.quality);
    }
}
