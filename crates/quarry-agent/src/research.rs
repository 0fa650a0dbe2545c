use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use tracing::{error, info, warn};

use quarry_core::config::{AppConfig, ModelRole};
use quarry_core::error::{QuarryError, Result};
use quarry_core::event::EventBus;
use quarry_core::traits::{ConversationStore, LlmClient, WebSearch};
use quarry_core::types::*;

use crate::augmenter::ContextAugmenter;
use crate::engine::{ExecutionEngine, ExecutionOutput};
use crate::planner::PlanBuilder;
use crate::refiner::QualityRefiner;
use crate::resolver::{QueryResolver, ResolverLimits};
use crate::synthesizer::AnswerSynthesizer;
use crate::text::panic_message;

/// Result of one top-level research call.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    /// The session the turn was recorded under. May differ from the
    /// requested one when that session had expired.
    pub session_id: SessionId,
    pub query: String,
    pub answer: ResearchAnswer,
    pub urls_used: Vec<String>,
    /// `None` when the call failed before planning finished.
    pub plan: Option<ResearchPlan>,
    /// Usable results that fed the answer.
    pub refined: Vec<RefinedResult>,
    pub executed_steps: Vec<ExecutionStep>,
    pub step_results: StepResults,
    pub search_queries: Vec<String>,
    pub duration_ms: u64,
}

/// Plans, executes and answers research questions within a session.
pub struct ResearchAgent {
    planner: PlanBuilder,
    engine: ExecutionEngine,
    synthesizer: AnswerSynthesizer,
    store: Arc<dyn ConversationStore>,
    events: Arc<EventBus>,
    history_limit: usize,
    session_timeout: chrono::Duration,
}

impl ResearchAgent {
    /// Wire the pipeline from configuration. Every role talks to `llm`
    /// with its own model settings from [`AppConfig::model_for`].
    pub fn new(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        search: Arc<dyn WebSearch>,
        store: Arc<dyn ConversationStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let research = &config.research;

        let refiner = QualityRefiner::new(
            llm.clone(),
            config.model_for(ModelRole::Refiner),
            research.max_refiner_retries,
        );
        let resolver = QueryResolver::new(
            search,
            refiner,
            events.clone(),
            ResolverLimits {
                max_retries: research.max_search_retries,
                max_results: research.max_search_results,
                min_content_chars: research.min_content_chars,
            },
        );
        let augmenter = ContextAugmenter::new(
            llm.clone(),
            config.model_for(ModelRole::Augmenter),
            research.max_augment_attempts,
        );
        let engine = ExecutionEngine::new(
            resolver,
            augmenter,
            events.clone(),
            research.dependency_excerpt_chars,
            research.conversation_tail,
        );

        Self {
            planner: PlanBuilder::new(llm.clone(), config.model_for(ModelRole::Strategist)),
            engine,
            synthesizer: AnswerSynthesizer::new(llm, config.model_for(ModelRole::Synthesizer)),
            store,
            events,
            history_limit: research.max_conversation_history,
            session_timeout: chrono::Duration::minutes(config.session.timeout_minutes),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Answer `query` within `session`. Never fails: errors become a
    /// low-confidence answer and the turn is still recorded.
    pub async fn research(&self, query: &str, session: Option<&SessionId>) -> ResearchOutcome {
        let start = Instant::now();
        let session_id = self.resolve_session(session).await;
        info!(session = %session_id, query = %query, "Research started");

        let run = AssertUnwindSafe(self.run(query, &session_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(QuarryError::Internal(panic_message(payload.as_ref())))
            });

        let mut outcome = match run {
            Ok((plan, output, answer)) => ResearchOutcome {
                session_id: session_id.clone(),
                query: query.to_string(),
                answer,
                urls_used: output.urls_used,
                plan: Some(plan),
                refined: output.refined,
                executed_steps: output.executed_steps,
                step_results: output.step_results,
                search_queries: output.search_queries,
                duration_ms: 0,
            },
            Err(e) => {
                error!(session = %session_id, error = %e, "Research failed");
                ResearchOutcome {
                    session_id: session_id.clone(),
                    query: query.to_string(),
                    answer: ResearchAnswer::unsupported(format!(
                        "I encountered an error during research: {}",
                        e
                    )),
                    urls_used: Vec::new(),
                    plan: None,
                    refined: Vec::new(),
                    executed_steps: Vec::new(),
                    step_results: StepResults::new(),
                    search_queries: Vec::new(),
                    duration_ms: 0,
                }
            }
        };
        outcome.duration_ms = start.elapsed().as_millis() as u64;

        self.record(&outcome).await;
        info!(
            session = %session_id,
            citations = outcome.answer.citations.len(),
            duration_ms = outcome.duration_ms,
            "Research finished"
        );
        outcome
    }

    async fn run(
        &self,
        query: &str,
        session_id: &SessionId,
    ) -> Result<(ResearchPlan, ExecutionOutput, ResearchAnswer)> {
        let history = self
            .store
            .load_recent_messages(session_id, self.history_limit)
            .await?;
        self.store
            .append_message(session_id, Role::User, query)
            .await?;

        self.events.publish(ResearchEvent::PlanStarted {
            query: query.to_string(),
        });
        let plan = self.planner.plan(query, &history).await;
        self.events.publish(ResearchEvent::PlanReady {
            execution_type: plan.execution_type,
            steps: plan.steps.len(),
            confidence: plan.confidence,
            rationale: plan.rationale.clone(),
        });

        let output = self.engine.execute(&plan, query, &history).await;

        let answer = if output.refined.is_empty() {
            info!(query = %query, "No usable results, skipping synthesis");
            ResearchAnswer::unsupported(format!(
                "No search results found for: '{}'. Please try rephrasing your question.",
                query
            ))
        } else {
            self.events.publish(ResearchEvent::AnswerStarted);
            let answer = self.synthesizer.synthesize(query, &output.refined).await;
            self.events.publish(ResearchEvent::AnswerReady {
                citations: answer.citations.len(),
            });
            answer
        };

        Ok((plan, output, answer))
    }

    /// Keep a live session; start a new one when none was given, the given
    /// one is unknown, or it has been idle longer than the timeout.
    async fn resolve_session(&self, requested: Option<&SessionId>) -> SessionId {
        let Some(sid) = requested else {
            return SessionId::new();
        };

        match self.store.last_activity(sid).await {
            Ok(Some(last)) if Utc::now() - last <= self.session_timeout => sid.clone(),
            Ok(Some(last)) => {
                let fresh = SessionId::new();
                warn!(session = %sid, last_activity = %last, new_session = %fresh, "Session expired, starting a new one");
                fresh
            }
            Ok(None) => {
                let fresh = SessionId::new();
                info!(session = %sid, new_session = %fresh, "Unknown session, starting a new one");
                fresh
            }
            Err(e) => {
                let fresh = SessionId::new();
                warn!(session = %sid, error = %e, "Session lookup failed, starting a new one");
                fresh
            }
        }
    }

    /// Persist the assistant message and the turn record. Storage errors
    /// are logged only.
    async fn record(&self, outcome: &ResearchOutcome) {
        let sid = &outcome.session_id;

        if let Err(e) = self
            .store
            .append_message(sid, Role::Assistant, &outcome.answer.answer)
            .await
        {
            warn!(session = %sid, error = %e, "Failed to store assistant message");
        }

        let previous = match self.store.turn_count(sid).await {
            Ok(n) => n,
            Err(e) => {
                warn!(session = %sid, error = %e, "Failed to count turns");
                0
            }
        };

        let turn = TurnRecord {
            turn_id: previous + 1,
            query: outcome.query.clone(),
            strategy: outcome
                .plan
                .as_ref()
                .map(|p| p.execution_type.to_string())
                .unwrap_or_else(|| "error".to_string()),
            search_queries: outcome.search_queries.clone(),
            urls_opened: outcome.urls_used.clone(),
            refined_data: outcome.refined.clone(),
            final_answer: outcome.answer.answer.clone(),
            citations: outcome.answer.citations.clone(),
            timestamp: Utc::now(),
            duration_ms: outcome.duration_ms,
        };

        if let Err(e) = self.store.record_turn(sid, &turn).await {
            warn!(session = %sid, error = %e, "Failed to record research turn");
        }
    }
}
