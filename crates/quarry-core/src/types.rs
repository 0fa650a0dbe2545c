use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuarryError, Result};

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A single chat message, either sent to a model or kept as session history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },

    /// Message ID from the API.
    MessageId(String),
}

// ---------------------------------------------------------------------------
// Research plan
// ---------------------------------------------------------------------------

/// A single search query issued by a fetch step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    #[serde(default)]
    pub purpose: String,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            purpose: purpose.into(),
        }
    }
}

/// What a plan step does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Issues search queries and refines what comes back.
    #[serde(alias = "search")]
    Fetch,
    /// Consumes everything gathered so far; no queries of its own.
    #[serde(alias = "generation")]
    Synthesize,
}

/// How a fetch step dispatches its queries.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    #[default]
    #[serde(alias = "single")]
    Sequential,
    #[serde(alias = "parallel")]
    Fanout,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionType {
    Single,
    Chain,
}

impl std::fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionType::Single => write!(f, "single"),
            ExecutionType::Chain => write!(f, "chain"),
        }
    }
}

/// One node of the research DAG.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStep {
    pub step_id: u32,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "action")]
    pub kind: StepKind,
    #[serde(default)]
    pub mode: StepMode,
    #[serde(default)]
    pub depends_on: BTreeSet<u32>,
    #[serde(default, alias = "search_queries")]
    pub queries: Vec<SearchQuery>,
}

impl ExecutionStep {
    /// A copy of this step carrying a new description and query list.
    /// Identity, kind, mode and dependencies are preserved.
    pub fn rewritten(&self, description: String, queries: Vec<SearchQuery>) -> Self {
        Self {
            step_id: self.step_id,
            description,
            kind: self.kind,
            mode: self.mode,
            depends_on: self.depends_on.clone(),
            queries,
        }
    }
}

/// A validated execution plan produced by the planner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchPlan {
    pub execution_type: ExecutionType,
    pub steps: Vec<ExecutionStep>,
    #[serde(default, alias = "reason_summary")]
    pub rationale: String,
    pub confidence: f32,
}

impl ResearchPlan {
    /// Deterministic single-step plan used whenever planning fails.
    pub fn fallback(query: &str, cause: impl std::fmt::Display) -> Self {
        Self {
            execution_type: ExecutionType::Single,
            steps: vec![ExecutionStep {
                step_id: 1,
                description: "Search for an answer to the user query".to_string(),
                kind: StepKind::Fetch,
                mode: StepMode::Sequential,
                depends_on: BTreeSet::new(),
                queries: vec![SearchQuery::new(query, "answer user query")],
            }],
            rationale: format!("Planning failed, defaulting to a single search: {}", cause),
            confidence: 0.5,
        }
    }

    /// Check structural invariants: at least one step, unique ids, every
    /// dependency pointing at an earlier step, confidence within [0, 1].
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(QuarryError::InvalidPlan("plan has no steps".into()));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(QuarryError::InvalidPlan(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }

        let mut seen = BTreeSet::new();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep) {
                    return Err(QuarryError::InvalidPlan(format!(
                        "step {} depends on {} which is not an earlier step",
                        step.step_id, dep
                    )));
                }
            }
            if !seen.insert(step.step_id) {
                return Err(QuarryError::InvalidPlan(format!(
                    "duplicate step id {}",
                    step.step_id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

/// A document returned by a web search provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Document {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub score: Option<f32>,
    #[serde(default)]
    pub published_date: Option<String>,
}

impl Document {
    /// Full content when present, otherwise the snippet.
    pub fn body(&self) -> &str {
        match self.content.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => &self.snippet,
        }
    }

    /// Whether the trimmed content is longer than `min_chars` characters.
    pub fn has_substantial_content(&self, min_chars: usize) -> bool {
        self.content
            .as_deref()
            .map(|c| c.trim().chars().count() > min_chars)
            .unwrap_or(false)
    }
}

/// A source that contributed to a refined result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub url: String,
    pub title: String,
    pub domain: String,
}

/// The unit of retrieved knowledge. `quality == 0.0` marks total failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinedResult {
    pub text: String,
    #[serde(default)]
    pub used_sources: Vec<SourceRef>,
    pub source_query: String,
    pub quality: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl RefinedResult {
    /// Zero-quality sentinel for a query that produced nothing usable.
    pub fn failure(query: &str, reason: impl Into<String>) -> Self {
        Self {
            text: format!("Unable to find relevant information for query: {}", query),
            used_sources: Vec::new(),
            source_query: query.to_string(),
            quality: 0.0,
            failure_reason: Some(reason.into()),
        }
    }

    /// Results with positive quality flow downstream; the rest are only recorded.
    pub fn is_usable(&self) -> bool {
        self.quality > 0.0
    }
}

/// Per-step record of every dispatched query's result, including failures.
pub type StepResults = BTreeMap<u32, Vec<RefinedResult>>;

// ---------------------------------------------------------------------------
// Answers and history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub title: String,
    pub domain: String,
    pub url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Confidence::High => write!(f, "high"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::Low => write!(f, "low"),
        }
    }
}

/// Final answer for one research call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub confidence: Confidence,
    pub conflicts_detected: bool,
}

impl ResearchAnswer {
    /// An answer with no sources behind it.
    pub fn unsupported(text: impl Into<String>) -> Self {
        Self {
            answer: text.into(),
            citations: Vec::new(),
            confidence: Confidence::Low,
            conflicts_detected: false,
        }
    }
}

/// Everything recorded about one research turn of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnRecord {
    pub turn_id: u32,
    pub query: String,
    pub strategy: String,
    pub search_queries: Vec<String>,
    pub urls_opened: Vec<String>,
    pub refined_data: Vec<RefinedResult>,
    pub final_answer: String,
    pub citations: Vec<Citation>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Coarse progress milestones of a research call. Purely observational.
#[derive(Debug, Clone)]
pub enum ResearchEvent {
    PlanStarted {
        query: String,
    },
    PlanReady {
        execution_type: ExecutionType,
        steps: usize,
        confidence: f32,
        rationale: String,
    },
    StepStarted {
        step_id: u32,
        description: String,
    },
    StepSkipped {
        step_id: u32,
        missing: Vec<u32>,
    },
    AugmentStarted {
        step_id: u32,
    },
    QueryAttempt {
        query: String,
        attempt: u32,
    },
    SearchRejected {
        query: String,
        attempt: u32,
        reason: String,
    },
    RefinerScored {
        query: String,
        attempt: u32,
        score: f32,
        reason: String,
    },
    BestResultUsed {
        query: String,
        score: f32,
    },
    StepFinished {
        step_id: u32,
        usable: usize,
        total: usize,
    },
    AnswerStarted,
    AnswerReady {
        citations: usize,
    },
}

impl ResearchEvent {
    /// Stage name of this milestone.
    pub fn stage(&self) -> &'static str {
        match self {
            ResearchEvent::PlanStarted { .. } | ResearchEvent::PlanReady { .. } => "plan",
            ResearchEvent::StepStarted { .. }
            | ResearchEvent::StepSkipped { .. }
            | ResearchEvent::StepFinished { .. } => "step",
            ResearchEvent::AugmentStarted { .. } => "context",
            ResearchEvent::QueryAttempt { .. } | ResearchEvent::SearchRejected { .. } => "search",
            ResearchEvent::RefinerScored { .. } | ResearchEvent::BestResultUsed { .. } => "refine",
            ResearchEvent::AnswerStarted | ResearchEvent::AnswerReady { .. } => "answer",
        }
    }

    /// Human-readable description of this milestone.
    pub fn message(&self) -> String {
        match self {
            ResearchEvent::PlanStarted { query } => format!("Planning research for: {}", query),
            ResearchEvent::PlanReady {
                execution_type,
                steps,
                confidence,
                rationale,
            } => format!(
                "Strategy: {} with {} steps ({:.2}) - {}",
                execution_type, steps, confidence, rationale
            ),
            ResearchEvent::StepStarted {
                step_id,
                description,
            } => format!("Step {}: {}", step_id, description),
            ResearchEvent::StepSkipped { step_id, missing } => {
                format!("Step {} skipped, missing dependencies {:?}", step_id, missing)
            }
            ResearchEvent::AugmentStarted { step_id } => {
                format!("Refining queries for step {} from previous results", step_id)
            }
            ResearchEvent::QueryAttempt { query, attempt } => {
                format!("Searching: '{}' (attempt {})", query, attempt)
            }
            ResearchEvent::SearchRejected {
                query,
                attempt,
                reason,
            } => format!("'{}' attempt {}: {}", query, attempt, reason),
            ResearchEvent::RefinerScored { score, reason, .. } => {
                format!("Quality score: {:.2} - {}", score, reason)
            }
            ResearchEvent::BestResultUsed { query, score } => {
                format!("Max retries reached for '{}', using best result ({:.2})", query, score)
            }
            ResearchEvent::StepFinished {
                step_id,
                usable,
                total,
            } => format!("Step {} completed: {}/{} successful", step_id, usable, total),
            ResearchEvent::AnswerStarted => "Generating answer from refined data".to_string(),
            ResearchEvent::AnswerReady { citations } => {
                format!("Complete ({} citations)", citations)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: u32, deps: &[u32]) -> ExecutionStep {
        ExecutionStep {
            step_id: id,
            description: format!("step {}", id),
            kind: StepKind::Fetch,
            mode: StepMode::Sequential,
            depends_on: deps.iter().copied().collect(),
            queries: vec![SearchQuery::new("q", "p")],
        }
    }

    #[test]
    fn test_fallback_plan_shape() {
        let plan = ResearchPlan::fallback("who wrote dune", "boom");
        assert_eq!(plan.execution_type, ExecutionType::Single);
        assert_eq!(plan.confidence, 0.5);
        assert_eq!(plan.steps.len(), 1);
        let s = &plan.steps[0];
        assert_eq!(s.step_id, 1);
        assert_eq!(s.kind, StepKind::Fetch);
        assert_eq!(s.mode, StepMode::Sequential);
        assert!(s.depends_on.is_empty());
        assert_eq!(s.queries[0].query, "who wrote dune");
        assert_eq!(s.queries[0].purpose, "answer user query");
        assert!(plan.rationale.contains("boom"));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_forward_dependency() {
        let plan = ResearchPlan {
            execution_type: ExecutionType::Chain,
            steps: vec![step(1, &[2]), step(2, &[])],
            rationale: String::new(),
            confidence: 0.9,
        };
        assert!(matches!(plan.validate(), Err(QuarryError::InvalidPlan(_))));
    }

    #[test]
    fn test_validate_rejects_self_dependency_and_duplicates() {
        let self_dep = ResearchPlan {
            execution_type: ExecutionType::Single,
            steps: vec![step(1, &[1])],
            rationale: String::new(),
            confidence: 0.9,
        };
        assert!(self_dep.validate().is_err());

        let dup = ResearchPlan {
            execution_type: ExecutionType::Chain,
            steps: vec![step(1, &[]), step(1, &[])],
            rationale: String::new(),
            confidence: 0.9,
        };
        assert!(dup.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_confidence_and_empty() {
        let mut plan = ResearchPlan::fallback("q", "x");
        plan.confidence = 1.5;
        assert!(plan.validate().is_err());
        plan.confidence = f32::NAN;
        assert!(plan.validate().is_err());

        plan.confidence = 0.5;
        plan.steps.clear();
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_step_deserializes_legacy_field_names() {
        let json = r#"{
            "step_id": 2,
            "description": "find ceos",
            "action": "search",
            "mode": "parallel",
            "depends_on": [1, 1],
            "search_queries": [{"query": "ceo of x", "purpose": "identify"}]
        }"#;
        let s: ExecutionStep = serde_json::from_str(json).unwrap();
        assert_eq!(s.kind, StepKind::Fetch);
        assert_eq!(s.mode, StepMode::Fanout);
        assert_eq!(s.depends_on.len(), 1);
        assert_eq!(s.queries.len(), 1);
    }

    #[test]
    fn test_step_rejects_unknown_kind() {
        let json = r#"{"step_id": 1, "kind": "browse", "mode": "sequential"}"#;
        assert!(serde_json::from_str::<ExecutionStep>(json).is_err());
    }

    #[test]
    fn test_rewritten_keeps_identity() {
        let original = step(3, &[1, 2]);
        let new = original.rewritten(
            "new description".into(),
            vec![SearchQuery::new("a", ""), SearchQuery::new("b", "")],
        );
        assert_eq!(new.step_id, 3);
        assert_eq!(new.depends_on, original.depends_on);
        assert_eq!(new.queries.len(), 2);
        assert_eq!(original.queries.len(), 1);
    }

    #[test]
    fn test_document_content_checks() {
        let doc = Document {
            title: "t".into(),
            url: "https://example.com".into(),
            snippet: "short snippet".into(),
            content: Some(format!("  {}  ", "x".repeat(50))),
            ..Default::default()
        };
        // 50 chars after trimming is not strictly greater than 50
        assert!(!doc.has_substantial_content(50));
        assert!(doc.has_substantial_content(49));

        let no_content = Document {
            snippet: "only snippet".into(),
            ..Default::default()
        };
        assert_eq!(no_content.body(), "only snippet");
        assert!(!no_content.has_substantial_content(0));
    }

    #[test]
    fn test_failure_sentinel_is_not_usable() {
        let r = RefinedResult::failure("rust async", "nothing found");
        assert_eq!(r.quality, 0.0);
        assert!(!r.is_usable());
        assert_eq!(r.source_query, "rust async");
        assert_eq!(r.failure_reason.as_deref(), Some("nothing found"));
    }
}
