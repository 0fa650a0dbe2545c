use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Multi-provider streaming text generation.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Web search provider.
pub trait WebSearch: Send + Sync + 'static {
    /// Provider name (e.g., "tavily", "serper").
    fn name(&self) -> &str;

    /// Run a query and return ranked documents. Providers report transport
    /// failures as an empty list rather than an error.
    fn search(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<Document>>>;
}

/// Session history and research turn records.
pub trait ConversationStore: Send + Sync + 'static {
    /// Append a message to a session.
    fn append_message(&self, sid: &SessionId, role: Role, text: &str) -> BoxFuture<'_, Result<()>>;

    /// Load the most recent `limit` messages of a session, oldest first.
    fn load_recent_messages(
        &self,
        sid: &SessionId,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<ChatMessage>>>;

    /// Record the artifacts of a completed research turn.
    fn record_turn(&self, sid: &SessionId, turn: &TurnRecord) -> BoxFuture<'_, Result<()>>;

    /// Number of turns recorded for a session.
    fn turn_count(&self, sid: &SessionId) -> BoxFuture<'_, Result<u32>>;

    /// All recorded turns of a session, oldest first.
    fn load_turns(&self, sid: &SessionId) -> BoxFuture<'_, Result<Vec<TurnRecord>>>;

    /// Timestamp of the latest message or turn, `None` for an unknown session.
    fn last_activity(&self, sid: &SessionId) -> BoxFuture<'_, Result<Option<DateTime<Utc>>>>;
}
