pub mod augmenter;
pub mod engine;
pub mod evaluation;
pub mod judge;
pub mod planner;
pub mod refiner;
pub mod research;
pub mod resolver;
pub mod synthesizer;
pub mod text;

pub use augmenter::ContextAugmenter;
pub use engine::{ExecutionEngine, ExecutionOutput};
pub use evaluation::{Dataset, EvalReport, EvalRunner};
pub use judge::{Evaluation, ResearchJudge};
pub use planner::PlanBuilder;
pub use refiner::{QualityRefiner, Refinement};
pub use research::{ResearchAgent, ResearchOutcome};
pub use resolver::{best_of, QueryResolver, ResolverLimits};
pub use synthesizer::AnswerSynthesizer;
