use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use quarry_core::error::Result;
use quarry_core::traits::WebSearch;
use quarry_core::types::Document;

use crate::domain_of;

const SERPER_API_URL: &str = "https://google.serper.dev/search";

/// Serper (Google results). Only snippets are available, so the snippet
/// doubles as the document content.
pub struct SerperSearch {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl SerperSearch {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: SERPER_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[derive(Deserialize, Debug)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<OrganicResult>,
}

#[derive(Deserialize, Debug)]
struct OrganicResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    snippet: String,
    #[serde(default)]
    date: Option<String>,
}

impl From<OrganicResult> for Document {
    fn from(r: OrganicResult) -> Self {
        let domain = Some(domain_of(&r.link));
        Document {
            title: r.title,
            content: Some(r.snippet.clone()),
            snippet: r.snippet,
            url: r.link,
            domain,
            score: None,
            published_date: r.date,
        }
    }
}

impl WebSearch for SerperSearch {
    fn name(&self) -> &str {
        "serper"
    }

    fn search(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<Document>>> {
        let query = query.to_string();
        Box::pin(async move {
            let resp = self
                .http
                .post(&self.endpoint)
                .header("X-API-KEY", &self.api_key)
                .json(&json!({ "q": query, "num": max_results }))
                .send()
                .await;

            let body = match resp {
                Ok(r) if r.status().is_success() => r.json::<SerperResponse>().await,
                Ok(r) => {
                    warn!(query = %query, status = %r.status(), "Serper search rejected");
                    return Ok(Vec::new());
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Serper search failed");
                    return Ok(Vec::new());
                }
            };

            match body {
                Ok(body) => {
                    let docs: Vec<Document> = body
                        .organic
                        .into_iter()
                        .take(max_results)
                        .map(Document::from)
                        .collect();
                    debug!(query = %query, results = docs.len(), "Serper search complete");
                    Ok(docs)
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Failed to decode Serper response");
                    Ok(Vec::new())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serper_result_mapping() {
        let body: SerperResponse = serde_json::from_str(
            r#"{"searchParameters":{"q":"x"},"organic":[{
                "title":"Tokio",
                "link":"https://www.tokio.rs/",
                "snippet":"An asynchronous runtime",
                "date":"Jan 2, 2024",
                "position":1
            }]}"#,
        )
        .unwrap();
        let docs: Vec<Document> = body.organic.into_iter().map(Document::from).collect();
        assert_eq!(docs[0].url, "https://www.tokio.rs/");
        assert_eq!(docs[0].domain.as_deref(), Some("tokio.rs"));
        assert_eq!(docs[0].content.as_deref(), Some("An asynchronous runtime"));
        assert_eq!(docs[0].published_date.as_deref(), Some("Jan 2, 2024"));
    }

    #[test]
    fn test_missing_organic_is_empty() {
        let body: SerperResponse = serde_json::from_str(r#"{"answerBox":{}}"#).unwrap();
        assert!(body.organic.is_empty());
    }
}
