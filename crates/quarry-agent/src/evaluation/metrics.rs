//! Heuristic answer scoring. No model calls; every score is derived from
//! the answer text, its citations and the question's expectations.

use regex::Regex;
use serde::{Deserialize, Serialize};

use quarry_core::types::{Confidence, ResearchAnswer};

use super::dataset::EvalQuestion;

/// Inline `[Source N]` markers or markdown links.
const CITATION_PATTERN: &str = r"\[Source \d+\]|\[[^\]]+\]\([^)\s]+\)";

const UNCERTAINTY_PHRASES: &[&str] = &[
    "unclear",
    "uncertain",
    "limited information",
    "not enough",
    "insufficient",
    "may",
    "might",
    "possibly",
    "appears to",
    "seems to",
    "likely",
    "no definitive",
    "conflicting",
    "varies",
];

const CONFLICT_PHRASES: &[&str] = &[
    "conflict",
    "disagree",
    "however",
    "while source",
    "contradicts",
    "differing",
    "different sources",
    "on the other hand",
    "alternatively",
    "disputed",
];

/// Scores for a single answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnswerMetrics {
    pub question_id: String,
    pub num_citations: usize,
    pub citation_format_correct: bool,
    pub expected_found: Vec<String>,
    pub expected_missing: Vec<String>,
    pub should_note_conflict: bool,
    pub conflict_noted: bool,
    pub should_express_uncertainty: bool,
    pub uncertainty_expressed: bool,
    pub confidence: Confidence,
    pub confidence_appropriate: bool,
    pub citation_quality_score: f32,
    pub grounding_score: f32,
    pub completeness_score: f32,
    pub overall_score: f32,
    pub notes: String,
}

impl AnswerMetrics {
    pub fn has_citations(&self) -> bool {
        self.num_citations > 0
    }
}

pub fn notes_conflict(answer: &str) -> bool {
    contains_any(answer, CONFLICT_PHRASES)
}

pub fn expresses_uncertainty(answer: &str) -> bool {
    contains_any(answer, UNCERTAINTY_PHRASES)
}

fn contains_any(answer: &str, phrases: &[&str]) -> bool {
    let lower = answer.to_lowercase();
    phrases.iter().any(|p| lower.contains(p))
}

/// Split `expected` into the elements present in `answer` and those missing.
pub fn expected_elements(answer: &str, expected: &[String]) -> (Vec<String>, Vec<String>) {
    let lower = answer.to_lowercase();
    expected
        .iter()
        .cloned()
        .partition(|e| lower.contains(&e.to_lowercase()))
}

/// True when there are citations and the text references at least one inline.
pub fn citation_format_correct(answer: &str, num_citations: usize) -> bool {
    if num_citations == 0 {
        return false;
    }
    Regex::new(CITATION_PATTERN)
        .map(|re| re.is_match(answer))
        .unwrap_or(false)
}

pub fn confidence_appropriate(
    confidence: Confidence,
    num_citations: usize,
    uncertainty_expressed: bool,
    should_express_uncertainty: bool,
) -> bool {
    if should_express_uncertainty {
        return confidence == Confidence::Low && uncertainty_expressed;
    }
    if num_citations >= 2 && !uncertainty_expressed {
        return confidence == Confidence::High;
    }
    if num_citations == 0 {
        return confidence == Confidence::Low;
    }
    matches!(confidence, Confidence::Medium | Confidence::Low)
}

fn citation_quality(num_citations: usize, format_correct: bool) -> f32 {
    let count = match num_citations {
        0 => return 0.0,
        1 => 0.2,
        2 => 0.4,
        _ => 0.6,
    };
    if format_correct {
        count + 0.4
    } else {
        count
    }
}

fn grounding(num_citations: usize, format_correct: bool) -> f32 {
    match (num_citations, format_correct) {
        (0, _) => 0.0,
        (_, true) => 1.0,
        (_, false) => 0.5,
    }
}

fn completeness(found: usize, expected: usize) -> f32 {
    if expected == 0 {
        1.0
    } else {
        found as f32 / expected as f32
    }
}

/// Score `answer` against the expectations of `question`.
pub fn score_answer(question: &EvalQuestion, answer: &ResearchAnswer) -> AnswerMetrics {
    let text = answer.answer.as_str();
    let num_citations = answer.citations.len();
    let format_correct = citation_format_correct(text, num_citations);
    let (found, missing) = expected_elements(text, &question.expected_elements);
    let conflict_noted = notes_conflict(text);
    let uncertainty_expressed = expresses_uncertainty(text);
    let appropriate = confidence_appropriate(
        answer.confidence,
        num_citations,
        uncertainty_expressed,
        question.should_express_uncertainty,
    );

    let citation_quality_score = citation_quality(num_citations, format_correct);
    let grounding_score = grounding(num_citations, format_correct);
    let completeness_score = completeness(found.len(), question.expected_elements.len());
    let bonus = if (question.should_note_conflict && conflict_noted)
        || (question.should_express_uncertainty && uncertainty_expressed)
    {
        0.1
    } else {
        0.0
    };
    let overall_score = (citation_quality_score * 0.4
        + grounding_score * 0.3
        + completeness_score * 0.3
        + bonus)
        .min(1.0);

    let mut notes = Vec::new();
    if num_citations == 0 {
        notes.push("no citations provided".to_string());
    } else if !format_correct {
        notes.push("citations are not referenced inline".to_string());
    } else {
        notes.push(format!("{} citations referenced inline", num_citations));
    }
    if !missing.is_empty() {
        notes.push(format!("missing expected elements: {}", missing.join(", ")));
    }
    if question.should_note_conflict && !conflict_noted {
        notes.push("should have noted conflicting sources".to_string());
    } else if conflict_noted {
        notes.push("noted conflicting information".to_string());
    }
    if question.should_express_uncertainty {
        notes.push(if uncertainty_expressed {
            "expressed uncertainty".to_string()
        } else {
            "should have expressed uncertainty".to_string()
        });
    }
    if !appropriate {
        notes.push(format!("confidence '{}' may not be appropriate", answer.confidence));
    }

    AnswerMetrics {
        question_id: question.id.clone(),
        num_citations,
        citation_format_correct: format_correct,
        expected_found: found,
        expected_missing: missing,
        should_note_conflict: question.should_note_conflict,
        conflict_noted,
        should_express_uncertainty: question.should_express_uncertainty,
        uncertainty_expressed,
        confidence: answer.confidence,
        confidence_appropriate: appropriate,
        citation_quality_score,
        grounding_score,
        completeness_score,
        overall_score,
        notes: notes.join(" | "),
    }
}

/// Rates and averages over a set of scored answers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    pub total_questions: usize,
    pub avg_citations: f32,
    pub citation_rate: f32,
    pub citation_format_rate: f32,
    /// Share of answers containing at least one expected element.
    pub completeness_rate: f32,
    pub conflict_handling_rate: f32,
    pub uncertainty_handling_rate: f32,
    pub confidence_appropriate_rate: f32,
    pub avg_citation_quality: f32,
    pub avg_grounding_score: f32,
    pub avg_completeness_score: f32,
    pub avg_overall_score: f32,
}

/// `None` when there is nothing to summarize.
pub fn summarize(results: &[AnswerMetrics]) -> Option<MetricsSummary> {
    if results.is_empty() {
        return None;
    }
    let total = results.len() as f32;
    let rate = |pred: &dyn Fn(&AnswerMetrics) -> bool| {
        results.iter().filter(|r| pred(r)).count() as f32 / total
    };
    let avg = |value: &dyn Fn(&AnswerMetrics) -> f32| results.iter().map(value).sum::<f32>() / total;

    Some(MetricsSummary {
        total_questions: results.len(),
        avg_citations: avg(&|r| r.num_citations as f32),
        citation_rate: rate(&|r| r.has_citations()),
        citation_format_rate: rate(&|r| r.citation_format_correct),
        completeness_rate: rate(&|r| !r.expected_found.is_empty()),
        conflict_handling_rate: rate(&|r| !r.should_note_conflict || r.conflict_noted),
        uncertainty_handling_rate: rate(&|r| !r.should_express_uncertainty || r.uncertainty_expressed),
        confidence_appropriate_rate: rate(&|r| r.confidence_appropriate),
        avg_citation_quality: avg(&|r| r.citation_quality_score),
        avg_grounding_score: avg(&|r| r.grounding_score),
        avg_completeness_score: avg(&|r| r.completeness_score),
        avg_overall_score: avg(&|r| r.overall_score),
    })
}
