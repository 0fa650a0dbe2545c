use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::WebSearch;
use quarry_core::types::Document;

/// One document about `query` with enough content to pass the
/// substantial-content filter.
pub fn document(query: &str) -> Document {
    Document {
        title: format!("About {}", query),
        url: format!("https://example.com/{}", query.replace(' ', "-")),
        snippet: format!("{} snippet", query),
        content: Some(format!(
            "A long article covering {} in enough detail to pass the content filter.",
            query
        )),
        domain: Some("example.com".into()),
        ..Default::default()
    }
}

/// A `WebSearch` that answers from a per-call script, or by default with
/// one [`document`] per query. Individual queries can be made to come back
/// empty, fail, panic or take a while.
#[derive(Default)]
pub struct ScriptedSearch {
    script: Vec<std::result::Result<Vec<Document>, String>>,
    empty: HashSet<String>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    delays_ms: HashMap<String, u64>,
    calls: Mutex<Vec<String>>,
    finished: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// One response per call regardless of the query; the last one repeats.
    /// `Err` entries become `QuarryError::Search`.
    pub fn script(responses: Vec<std::result::Result<Vec<Document>, String>>) -> Self {
        Self {
            script: responses,
            ..Self::default()
        }
    }

    pub fn empty_for(mut self, query: &str) -> Self {
        self.empty.insert(query.to_string());
        self
    }

    pub fn failing_for(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn panicking_for(mut self, query: &str) -> Self {
        self.panicking.insert(query.to_string());
        self
    }

    /// Sleep on the tokio clock before answering `query`.
    pub fn delayed(mut self, query: &str, millis: u64) -> Self {
        self.delays_ms.insert(query.to_string(), millis);
        self
    }

    /// Queries in the order they were issued.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Queries in the order their responses became ready.
    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().map(|f| f.clone()).unwrap_or_default()
    }

    fn respond(&self, query: &str, call: usize) -> Result<Vec<Document>> {
        let scripted = if self.script.is_empty() {
            None
        } else {
            Some(&self.script[call.min(self.script.len() - 1)])
        };
        match scripted {
            Some(Ok(docs)) => Ok(docs.clone()),
            Some(Err(message)) => Err(search_error(message)),
            None if self.failing.contains(query) => Err(search_error("HTTP 500")),
            None if self.empty.contains(query) => Ok(Vec::new()),
            None => Ok(vec![document(query)]),
        }
    }
}

fn search_error(message: &str) -> QuarryError {
    QuarryError::Search {
        provider: "scripted".into(),
        message: message.to_string(),
    }
}

impl WebSearch for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted"
    }

    fn search(&self, query: &str, _max_results: usize) -> BoxFuture<'_, Result<Vec<Document>>> {
        let call = match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(query.to_string());
                calls.len() - 1
            }
            Err(_) => 0,
        };
        let query = query.to_string();
        let delay = self.delays_ms.get(&query).copied();

        Box::pin(async move {
            if let Some(ms) = delay {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if let Ok(mut finished) = self.finished.lock() {
                finished.push(query.clone());
            }
            if self.panicking.contains(&query) {
                panic!("search backend crashed on {}", query);
            }
            self.respond(&query, call)
        })
    }
}
