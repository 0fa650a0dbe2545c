//! Offline evaluation: a question set, heuristic answer metrics and a
//! runner that feeds the questions through the research pipeline.

pub mod dataset;
pub mod metrics;
pub mod runner;

pub use dataset::{Dataset, Difficulty, EvalQuestion};
pub use metrics::{score_answer, summarize, AnswerMetrics, MetricsSummary};
pub use runner::{EvalReport, EvalRunner, QuestionReport};
