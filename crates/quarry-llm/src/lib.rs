pub mod providers;
pub mod retry;
pub mod streaming;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;

use quarry_core::config::ModelConfig;
use quarry_core::error::Result;
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, StreamDelta};

pub use providers::anthropic::AnthropicClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    if is_anthropic(&config.provider) {
        Box::new(AnthropicClient::new())
    } else {
        // Everything else uses the OpenAI-compatible client
        Box::new(OpenAiClient::new())
    }
}

/// Routes each request to a provider client by the request's own
/// `config.provider`, so pipeline roles may use different providers.
pub struct ProviderRouter {
    anthropic: AnthropicClient,
    openai: OpenAiClient,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self {
            anthropic: AnthropicClient::new(),
            openai: OpenAiClient::new(),
        }
    }
}

impl Default for ProviderRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn is_anthropic(provider: &str) -> bool {
    matches!(provider, "anthropic" | "claude")
}

impl LlmClient for ProviderRouter {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        if is_anthropic(&config.provider) {
            self.anthropic.chat_stream(config, messages)
        } else {
            self.openai.chat_stream(config, messages)
        }
    }
}

/// Run a chat request to completion and return the concatenated text.
/// The first stream error aborts the request.
pub async fn generate_text(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let mut stream = llm.chat_stream(config, messages).await?;

    let mut text = String::new();
    while let Some(delta) = stream.next().await {
        if let StreamDelta::TextDelta(chunk) = delta? {
            text.push_str(&chunk);
        }
    }
    Ok(text)
}
