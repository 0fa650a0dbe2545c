use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use quarry_core::error::{QuarryError, Result};

const BUILTIN: &str = include_str!("dataset.toml");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difficulty::Easy => write!(f, "easy"),
            Difficulty::Medium => write!(f, "medium"),
            Difficulty::Hard => write!(f, "hard"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(QuarryError::Config(format!(
                "unknown difficulty '{}', expected easy, medium or hard",
                other
            ))),
        }
    }
}

/// One question with the markers a good answer is expected to contain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalQuestion {
    pub id: String,
    pub question: String,
    pub category: String,
    pub difficulty: Difficulty,
    /// Matched case-insensitively as substrings of the answer.
    #[serde(default)]
    pub expected_elements: Vec<String>,
    #[serde(default = "default_true")]
    pub requires_citation: bool,
    #[serde(default)]
    pub should_note_conflict: bool,
    #[serde(default)]
    pub should_express_uncertainty: bool,
}

fn default_true() -> bool {
    true
}

/// An ordered question set, loaded from TOML as `[[question]]` tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    #[serde(default, rename = "question")]
    pub questions: Vec<EvalQuestion>,
}

impl Dataset {
    /// The question set compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let dataset: Dataset =
            toml::from_str(content).map_err(|e| QuarryError::Config(e.to_string()))?;
        dataset.validate()?;
        Ok(dataset)
    }

    fn validate(&self) -> Result<()> {
        if self.questions.is_empty() {
            return Err(QuarryError::Config("dataset has no questions".into()));
        }
        let mut seen = HashSet::new();
        for q in &self.questions {
            if q.question.trim().is_empty() {
                return Err(QuarryError::Config(format!("question '{}' is empty", q.id)));
            }
            if !seen.insert(q.id.as_str()) {
                return Err(QuarryError::Config(format!("duplicate question id '{}'", q.id)));
            }
        }
        Ok(())
    }

    pub fn by_category(&self, category: &str) -> Vec<&EvalQuestion> {
        self.questions.iter().filter(|q| q.category == category).collect()
    }

    pub fn by_difficulty(&self, difficulty: Difficulty) -> Vec<&EvalQuestion> {
        self.questions
            .iter()
            .filter(|q| q.difficulty == difficulty)
            .collect()
    }

    /// Distinct categories, sorted.
    pub fn categories(&self) -> Vec<String> {
        self.questions
            .iter()
            .map(|q| q.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Questions matching every given filter, in dataset order, capped at `limit`.
    pub fn select(
        &self,
        category: Option<&str>,
        difficulty: Option<Difficulty>,
        limit: Option<usize>,
    ) -> Vec<EvalQuestion> {
        self.questions
            .iter()
            .filter(|q| category.map_or(true, |c| q.category == c))
            .filter(|q| difficulty.map_or(true, |d| q.difficulty == d))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_dataset_parses() {
        let dataset = Dataset::builtin().unwrap();
        assert_eq!(dataset.questions.len(), 12);
        assert_eq!(dataset.questions[0].id, "factual_1");
        assert!(dataset.questions.iter().all(|q| q.requires_citation));

        let conflicting = dataset.by_category("conflicting");
        assert_eq!(conflicting.len(), 1);
        assert!(conflicting[0].should_note_conflict);
        assert!(!conflicting[0].should_express_uncertainty);
    }

    #[test]
    fn test_categories_and_difficulty_filters() {
        let dataset = Dataset::builtin().unwrap();
        assert_eq!(
            dataset.categories(),
            vec![
                "comparison",
                "conflicting",
                "factual",
                "insufficient",
                "multi-hop",
                "recent",
                "technical"
            ]
        );
        assert_eq!(dataset.by_difficulty(Difficulty::Easy).len(), 2);
        assert_eq!(dataset.by_category("multi-hop").len(), 3);
    }

    #[test]
    fn test_select_combines_filters_and_limit() {
        let dataset = Dataset::builtin().unwrap();
        let picked = dataset.select(Some("factual"), None, Some(2));
        let ids: Vec<_> = picked.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["factual_1", "factual_2"]);

        let hard_multihop = dataset.select(Some("multi-hop"), Some(Difficulty::Hard), None);
        assert_eq!(hard_multihop.len(), 1);
        assert_eq!(hard_multihop[0].id, "multihop_2");
    }

    #[test]
    fn test_parse_defaults_and_rejects_duplicates() {
        let dataset = Dataset::parse(
            r#"
[[question]]
id = "one"
question = "What is one?"
category = "factual"
difficulty = "easy"
"#,
        )
        .unwrap();
        assert!(dataset.questions[0].expected_elements.is_empty());
        assert!(dataset.questions[0].requires_citation);

        let duplicate = r#"
[[question]]
id = "one"
question = "a"
category = "x"
difficulty = "easy"

[[question]]
id = "one"
question = "b"
category = "x"
difficulty = "hard"
"#;
        assert!(matches!(Dataset::parse(duplicate), Err(QuarryError::Config(_))));
        assert!(matches!(Dataset::parse(""), Err(QuarryError::Config(_))));
    }

    #[test]
    fn test_difficulty_from_str() {
        assert_eq!("Hard".parse::<Difficulty>().unwrap(), Difficulty::Hard);
        assert!("extreme".parse::<Difficulty>().is_err());
    }
}
