use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{error, info, warn};

use quarry_core::event::EventBus;
use quarry_core::types::{
    ChatMessage, ExecutionStep, RefinedResult, ResearchEvent, ResearchPlan, StepKind, StepMode,
    StepResults,
};

use crate::augmenter::ContextAugmenter;
use crate::resolver::QueryResolver;
use crate::text::{panic_message, truncate_chars};

/// Everything one plan execution produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    /// Every dispatched query's result per step, failures included.
    pub step_results: StepResults,
    /// Usable results (`quality > 0`) in step order, the input to synthesis.
    pub refined: Vec<RefinedResult>,
    /// Steps as they actually ran, after augmentation.
    pub executed_steps: Vec<ExecutionStep>,
    pub skipped: Vec<u32>,
    pub search_queries: Vec<String>,
    /// Source urls of usable results, first occurrence order.
    pub urls_used: Vec<String>,
}

/// Walks a research plan in dependency order.
pub struct ExecutionEngine {
    resolver: QueryResolver,
    augmenter: ContextAugmenter,
    events: Arc<EventBus>,
    dependency_excerpt_chars: usize,
    conversation_tail: usize,
}

impl ExecutionEngine {
    pub fn new(
        resolver: QueryResolver,
        augmenter: ContextAugmenter,
        events: Arc<EventBus>,
        dependency_excerpt_chars: usize,
        conversation_tail: usize,
    ) -> Self {
        Self {
            resolver,
            augmenter,
            events,
            dependency_excerpt_chars,
            conversation_tail,
        }
    }

    /// Execute every step of `plan`. Steps run one at a time in list order;
    /// only the queries of a fanout step run concurrently.
    pub async fn execute(
        &self,
        plan: &ResearchPlan,
        original_query: &str,
        history: &[ChatMessage],
    ) -> ExecutionOutput {
        let mut out = ExecutionOutput::default();

        for step in &plan.steps {
            let missing: Vec<u32> = step
                .depends_on
                .iter()
                .filter(|id| !out.step_results.contains_key(*id))
                .copied()
                .collect();
            if !missing.is_empty() {
                warn!(step_id = step.step_id, missing = ?missing, "Skipping step with unresolved dependencies");
                self.events.publish(ResearchEvent::StepSkipped {
                    step_id: step.step_id,
                    missing,
                });
                out.skipped.push(step.step_id);
                continue;
            }

            self.events.publish(ResearchEvent::StepStarted {
                step_id: step.step_id,
                description: step.description.clone(),
            });

            if step.kind == StepKind::Synthesize {
                info!(step_id = step.step_id, "Synthesis step, consuming accumulated results");
                out.step_results.insert(step.step_id, Vec::new());
                out.executed_steps.push(step.clone());
                self.finish_step(step.step_id, 0, 0);
                continue;
            }

            let step = if step.depends_on.is_empty() {
                step.clone()
            } else {
                self.contextualize(step, original_query, history, &out.step_results)
                    .await
            };

            let results = self.dispatch(&step, original_query, &mut out.search_queries).await;

            let usable: Vec<&RefinedResult> = results.iter().filter(|r| r.is_usable()).collect();
            self.finish_step(step.step_id, usable.len(), results.len());
            for result in usable {
                for source in &result.used_sources {
                    if !source.url.is_empty() && !out.urls_used.contains(&source.url) {
                        out.urls_used.push(source.url.clone());
                    }
                }
                out.refined.push(result.clone());
            }

            out.step_results.insert(step.step_id, results);
            out.executed_steps.push(step);
        }

        out
    }

    /// Rewrite a dependent step from its dependencies' usable results.
    async fn contextualize(
        &self,
        step: &ExecutionStep,
        original_query: &str,
        history: &[ChatMessage],
        step_results: &StepResults,
    ) -> ExecutionStep {
        let context = dependency_text(step, step_results, self.dependency_excerpt_chars);
        if context.is_empty() {
            info!(step_id = step.step_id, "Dependencies produced nothing usable, running step as planned");
            return step.clone();
        }

        self.events.publish(ResearchEvent::AugmentStarted {
            step_id: step.step_id,
        });
        let tail = &history[history.len().saturating_sub(self.conversation_tail)..];
        self.augmenter
            .augment(step, original_query, &context, tail)
            .await
    }

    async fn dispatch(
        &self,
        step: &ExecutionStep,
        original_query: &str,
        search_queries: &mut Vec<String>,
    ) -> Vec<RefinedResult> {
        match step.mode {
            StepMode::Sequential => match step.queries.first() {
                Some(q) => {
                    search_queries.push(q.query.clone());
                    vec![self.resolve_isolated(&q.query, original_query).await]
                }
                None => {
                    warn!(step_id = step.step_id, "Fetch step has no queries");
                    Vec::new()
                }
            },
            StepMode::Fanout => {
                search_queries.extend(step.queries.iter().map(|q| q.query.clone()));
                // join_all yields outputs in input order regardless of completion order.
                join_all(
                    step.queries
                        .iter()
                        .map(|q| self.resolve_isolated(&q.query, original_query)),
                )
                .await
            }
        }
    }

    /// Resolve a query, converting a panic anywhere below into a
    /// zero-quality result for that query alone.
    async fn resolve_isolated(&self, query: &str, original_query: &str) -> RefinedResult {
        match AssertUnwindSafe(self.resolver.resolve(query, original_query))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(query = %query, reason = %reason, "Query resolution panicked");
                RefinedResult::failure(query, reason)
            }
        }
    }

    fn finish_step(&self, step_id: u32, usable: usize, total: usize) {
        info!(step_id, usable, total, "Step finished");
        self.events.publish(ResearchEvent::StepFinished {
            step_id,
            usable,
            total,
        });
    }
}

/// Usable dependency results as a numbered list, each entry truncated.
fn dependency_text(step: &ExecutionStep, step_results: &StepResults, excerpt_chars: usize) -> String {
    step.depends_on
        .iter()
        .filter_map(|id| step_results.get(id))
        .flatten()
        .filter(|r| r.is_usable())
        .enumerate()
        .map(|(i, r)| format!("[{}] {}", i + 1, truncate_chars(&r.text, excerpt_chars)))
        .collect::<Vec<_>>()
        .join("\n")
}
