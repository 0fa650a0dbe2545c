pub mod serper;
pub mod tavily;

use quarry_core::config::WebSearchConfig;
use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::WebSearch;

pub use serper::SerperSearch;
pub use tavily::TavilySearch;

/// Create a search provider from configuration.
pub fn create_search(config: &WebSearchConfig) -> Result<Box<dyn WebSearch>> {
    match config.provider.as_str() {
        "tavily" => Ok(Box::new(TavilySearch::new(&config.api_key))),
        "serper" => Ok(Box::new(SerperSearch::new(&config.api_key))),
        other => Err(QuarryError::UnsupportedSearchProvider(other.to_string())),
    }
}

/// Host of a URL with a leading `www.` removed; the raw URL when it does not parse.
pub fn domain_of(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => host.strip_prefix("www.").unwrap_or(host).to_string(),
            None => raw.to_string(),
        },
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://www.example.com/a/b?c=d"), "example.com");
        assert_eq!(domain_of("http://docs.rs/tokio"), "docs.rs");
        assert_eq!(domain_of("not a url"), "not a url");
    }

    #[test]
    fn test_create_search_known_and_unknown() {
        let tavily = create_search(&WebSearchConfig {
            provider: "tavily".into(),
            api_key: "k".into(),
        })
        .unwrap();
        assert_eq!(tavily.name(), "tavily");

        let serper = create_search(&WebSearchConfig {
            provider: "serper".into(),
            api_key: "k".into(),
        })
        .unwrap();
        assert_eq!(serper.name(), "serper");

        let err = create_search(&WebSearchConfig {
            provider: "bing".into(),
            api_key: "k".into(),
        });
        assert!(matches!(err, Err(QuarryError::UnsupportedSearchProvider(p)) if p == "bing"));
    }
}
