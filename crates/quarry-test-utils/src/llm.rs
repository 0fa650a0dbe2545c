use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use quarry_core::config::ModelConfig;
use quarry_core::error::{QuarryError, Result};
use quarry_core::traits::LlmClient;
use quarry_core::types::{ChatMessage, StopReason, StreamDelta};

/// What the double answers to one chat request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The whole text as a single delta.
    Text(String),
    /// Deltas in order; an `Err` becomes a mid-stream `LlmStream` error.
    Chunks(Vec<std::result::Result<String, String>>),
    /// The request itself fails with `LlmRequest`.
    Fail(String),
}

impl Reply {
    pub fn fail(message: impl Into<String>) -> Self {
        Reply::Fail(message.into())
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::Text(text.to_string())
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

type Responder = dyn Fn(&[ChatMessage]) -> Reply + Send + Sync;

/// An `LlmClient` that answers from a script or a closure and records
/// every request it sees.
pub struct ScriptedLlm {
    responder: Box<Responder>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    /// Answer every request with `respond(messages)`.
    pub fn from_fn(respond: impl Fn(&[ChatMessage]) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(respond),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// The same reply to every request.
    pub fn replying(reply: impl Into<Reply>) -> Self {
        let reply = reply.into();
        Self::from_fn(move |_| reply.clone())
    }

    /// Every request fails with `LlmRequest(message)`.
    pub fn failing(message: &str) -> Self {
        Self::replying(Reply::fail(message))
    }

    /// One reply per request in order; the last one repeats.
    pub fn script<R: Into<Reply>>(replies: Vec<R>) -> Self {
        let replies: Vec<Reply> = replies.into_iter().map(Into::into).collect();
        assert!(!replies.is_empty(), "script needs at least one reply");
        let next = AtomicUsize::new(0);
        Self::from_fn(move |_| {
            let n = next.fetch_add(1, Ordering::SeqCst);
            replies[n.min(replies.len() - 1)].clone()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Content of the last message of every request, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Some(last), Ok(mut prompts)) = (messages.last(), self.prompts.lock()) {
            prompts.push(last.content.clone());
        }
        let reply = (self.responder)(&messages);

        Box::pin(async move {
            let items: Vec<Result<StreamDelta>> = match reply {
                Reply::Fail(message) => return Err(QuarryError::LlmRequest(message)),
                Reply::Text(text) => vec![Ok(StreamDelta::TextDelta(text))],
                Reply::Chunks(chunks) => chunks
                    .into_iter()
                    .map(|chunk| match chunk {
                        Ok(text) => Ok(StreamDelta::TextDelta(text)),
                        Err(message) => Err(QuarryError::LlmStream(message)),
                    })
                    .collect(),
            };
            let items = items
                .into_iter()
                .chain(std::iter::once(Ok(StreamDelta::Stop(StopReason::EndTurn))));
            Ok(Box::pin(futures::stream::iter(items)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}
