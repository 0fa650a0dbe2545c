use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use quarry_core::error::Result;
use quarry_core::traits::WebSearch;
use quarry_core::types::Document;

use crate::domain_of;

const TAVILY_API_URL: &str = "https://api.tavily.com/search";

/// Tavily search with full page content (`include_raw_content`).
pub struct TavilySearch {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

impl TavilySearch {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: TAVILY_API_URL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Point the client at a different endpoint (proxies, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn fetch(&self, query: &str, max_results: usize) -> std::result::Result<TavilyResponse, String> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "api_key": self.api_key,
                "query": query,
                "max_results": max_results,
                "search_depth": "advanced",
                "include_raw_content": true,
            }))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        resp.json::<TavilyResponse>().await.map_err(|e| e.to_string())
    }
}

#[derive(Deserialize, Debug)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Deserialize, Debug)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    published_date: Option<String>,
}

impl From<TavilyResult> for Document {
    fn from(r: TavilyResult) -> Self {
        let domain = Some(domain_of(&r.url));
        Document {
            title: r.title,
            url: r.url,
            snippet: r.content.unwrap_or_default(),
            content: r.raw_content,
            domain,
            score: r.score,
            published_date: r.published_date,
        }
    }
}

impl WebSearch for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    fn search(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<Document>>> {
        let query = query.to_string();
        Box::pin(async move {
            match self.fetch(&query, max_results).await {
                Ok(body) => {
                    let docs: Vec<Document> = body.results.into_iter().map(Document::from).collect();
                    debug!(query = %query, results = docs.len(), "Tavily search complete");
                    Ok(docs)
                }
                Err(e) => {
                    warn!(query = %query, error = %e, "Tavily search failed");
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
    fn test_tavily_result_mapping() {
        let body: TavilyResponse = serde_json::from_str(
            r#"{"results":[{
                "title":"Rust",
                "url":"https://www.rust-lang.org/learn",
                "content":"A language empowering everyone",
                "raw_content":"Full page text",
                "score":0.93,
                "published_date":"2024-05-01"
            },{
                "title":"No raw",
                "url":"https://example.org",
                "content":"snippet only",
                "raw_content":null
            }]}"#,
        )
        .unwrap();
        let docs: Vec<Document> = body.results.into_iter().map(Document::from).collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].snippet, "A language empowering everyone");
        assert_eq!(docs[0].content.as_deref(), Some("Full page text"));
        assert_eq!(docs[0].domain.as_deref(), Some("rust-lang.org"));
        assert_eq!(docs[0].score, Some(0.93));
        assert!(docs[1].content.is_none());
        assert_eq!(docs[1].body(), "snippet only");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_empty() {
        let search = TavilySearch::new("key").with_endpoint("http://127.0.0.1:9/search");
        let docs = search.search("anything", 5).await.unwrap();
        assert!(docs.is_empty());
    }
}
