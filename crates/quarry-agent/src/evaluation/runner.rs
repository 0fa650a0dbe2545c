use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use quarry_core::error::Result;
use quarry_core::types::{Citation, Confidence};

use super::dataset::{Difficulty, EvalQuestion};
use super::metrics::{score_answer, summarize, AnswerMetrics, MetricsSummary};
use crate::judge::{Evaluation, ResearchJudge};
use crate::research::ResearchAgent;

/// Everything recorded for one evaluated question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionReport {
    pub question_id: String,
    pub question: String,
    pub category: String,
    pub difficulty: Difficulty,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: Confidence,
    pub strategy: Option<String>,
    pub search_queries: Vec<String>,
    pub duration_ms: u64,
    pub metrics: AnswerMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub judge: Option<Evaluation>,
}

/// A full evaluation run, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub timestamp: String,
    pub model: String,
    pub results: Vec<QuestionReport>,
    pub summary: Option<MetricsSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_judge_score: Option<f32>,
}

impl EvalReport {
    /// Write the report as pretty JSON to
    /// `dir/evaluation_results_<timestamp>.json`, creating `dir` if needed.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("evaluation_results_{}.json", self.timestamp));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "Evaluation results saved");
        Ok(path)
    }
}

/// Runs questions through the research pipeline one at a time and scores
/// each answer, optionally asking the judge model as well.
pub struct EvalRunner<'a> {
    agent: &'a ResearchAgent,
    judge: Option<&'a ResearchJudge>,
    model: String,
}

impl<'a> EvalRunner<'a> {
    pub fn new(agent: &'a ResearchAgent, model: impl Into<String>) -> Self {
        Self {
            agent,
            judge: None,
            model: model.into(),
        }
    }

    pub fn with_judge(mut self, judge: &'a ResearchJudge) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Each question starts a fresh session so earlier answers never leak
    /// into later ones.
    pub async fn run(&self, questions: &[EvalQuestion]) -> EvalReport {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let total = questions.len();
        let mut results = Vec::with_capacity(total);

        for (i, question) in questions.iter().enumerate() {
            info!(
                id = %question.id,
                category = %question.category,
                difficulty = %question.difficulty,
                "Evaluating question {}/{}",
                i + 1,
                total
            );
            let outcome = self.agent.research(&question.question, None).await;
            let metrics = score_answer(question, &outcome.answer);
            let judge = match self.judge {
                Some(judge) => Some(judge.evaluate(&outcome).await),
                None => None,
            };
            info!(
                id = %question.id,
                overall = metrics.overall_score,
                notes = %metrics.notes,
                "Question scored"
            );

            results.push(QuestionReport {
                question_id: question.id.clone(),
                question: question.question.clone(),
                category: question.category.clone(),
                difficulty: question.difficulty,
                answer: outcome.answer.answer,
                citations: outcome.answer.citations,
                confidence: outcome.answer.confidence,
                strategy: outcome.plan.map(|p| p.execution_type.to_string()),
                search_queries: outcome.search_queries,
                duration_ms: outcome.duration_ms,
                metrics,
                judge,
            });
        }

        let metrics: Vec<AnswerMetrics> = results.iter().map(|r| r.metrics.clone()).collect();
        let judged: Vec<f32> = results
            .iter()
            .filter_map(|r| r.judge.as_ref().map(|j| j.overall_score))
            .collect();
        let avg_judge_score = if judged.is_empty() {
            None
        } else {
            Some(judged.iter().sum::<f32>() / judged.len() as f32)
        };

        EvalReport {
            timestamp,
            model: self.model.clone(),
            summary: summarize(&metrics),
            results,
            avg_judge_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use quarry_core::config::AppConfig;
    use quarry_core::event::EventBus;
    use quarry_core::types::ChatMessage;
    use quarry_memory::SqliteStore;
    use quarry_test_utils::{test_model, Reply, ScriptedLlm, ScriptedSearch};

    use crate::evaluation::dataset::Dataset;

    /// Refiner keeps every result, synthesis cites the first source, the
    /// judge gives a fixed score. Planning output is unusable and falls back.
    fn respond(messages: &[ChatMessage]) -> Reply {
        let system = messages.first().map(|m| m.content.as_str()).unwrap_or_default();
        if system.starts_with("You grade web search results") {
            r#"{"score": 0.9, "reason": "ok", "extracted_info": "Paris has a population of 2.1 million", "source_indices": [0]}"#.into()
        } else if system.starts_with("You are a research assistant") {
            "Paris has a population of about 2.1 million [Source 1].".into()
        } else if system.starts_with("You evaluate") {
            r#"{"strategy_score": 0.8, "search_score": 0.8, "refinement_score": 0.8,
                "context_score": 1.0, "answer_score": 0.8, "overall_score": 0.7, "reasoning": "fine"}"#
                .into()
        } else {
            "no plan".into()
        }
    }

    fn agent(llm: Arc<ScriptedLlm>) -> ResearchAgent {
        ResearchAgent::new(
            &AppConfig::from_model(test_model()),
            llm,
            Arc::new(ScriptedSearch::new()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(EventBus::default()),
        )
    }

    #[tokio::test]
    async fn test_run_scores_each_question() {
        let llm = Arc::new(ScriptedLlm::from_fn(respond));
        let agent = agent(llm);
        let questions = Dataset::builtin().unwrap().select(Some("factual"), None, Some(1));

        let report = EvalRunner::new(&agent, "scripted").run(&questions).await;

        assert_eq!(report.model, "scripted");
        assert_eq!(report.results.len(), 1);
        let result = &report.results[0];
        assert_eq!(result.question_id, "factual_1");
        assert_eq!(result.strategy.as_deref(), Some("single"));
        assert_eq!(result.citations.len(), 1);
        assert!(result.metrics.citation_format_correct);
        assert!(result.metrics.expected_missing.is_empty());
        assert!(result.judge.is_none());
        assert!(report.avg_judge_score.is_none());

        let summary = report.summary.unwrap();
        assert_eq!(summary.total_questions, 1);
        assert_eq!(summary.citation_rate, 1.0);
    }

    #[tokio::test]
    async fn test_judge_scores_are_averaged_and_saved() {
        let llm = Arc::new(ScriptedLlm::from_fn(respond));
        let agent = agent(llm.clone());
        let judge = ResearchJudge::new(llm, test_model());
        let questions = Dataset::builtin().unwrap().select(None, Some(Difficulty::Easy), None);

        let report = EvalRunner::new(&agent, "scripted")
            .with_judge(&judge)
            .run(&questions)
            .await;

        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.judge.is_some()));
        assert!((report.avg_judge_score.unwrap() - 0.7).abs() < 1e-6);

        let dir = std::env::temp_dir().join(format!("quarry-eval-{}", report.timestamp));
        let path = report.save(&dir).unwrap();
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["results"].as_array().unwrap().len(), 2);
        assert_eq!(saved["summary"]["total_questions"], 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
