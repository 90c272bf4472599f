//! The inference seam.
//!
//! The engine only needs two things from an inference service: a complete
//! reply for a message list, and a stream of incremental text fragments.
//! [`Narrator`] captures that contract so the engine runs against the
//! real Ollama client or the scripted mock in [`crate::testing`].

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use ollama::{ChatRequest, Message};
use std::pin::Pin;
use thiserror::Error;

/// A stream of raw reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, NarratorError>> + Send>>;

/// Errors from the inference backend.
#[derive(Debug, Error)]
pub enum NarratorError {
    #[error("inference backend error: {0}")]
    Backend(String),
}

impl From<ollama::Error> for NarratorError {
    fn from(e: ollama::Error) -> Self {
        NarratorError::Backend(e.to_string())
    }
}

/// Per-call inference configuration.
#[derive(Debug, Clone, Default)]
pub struct NarrateOptions {
    /// Model override; the backend's default applies when unset.
    pub model: Option<String>,
    /// Context window size forwarded to the backend.
    pub num_ctx: Option<u64>,
}

/// An inference service that turns an ordered message list into text.
#[async_trait]
pub trait Narrator: Send + Sync {
    /// Request a complete reply.
    async fn complete(
        &self,
        messages: Vec<Message>,
        options: NarrateOptions,
    ) -> Result<String, NarratorError>;

    /// Request a streamed reply as incremental text fragments.
    async fn stream(
        &self,
        messages: Vec<Message>,
        options: NarrateOptions,
    ) -> Result<FragmentStream, NarratorError>;
}

#[async_trait]
impl Narrator for ollama::Ollama {
    async fn complete(
        &self,
        messages: Vec<Message>,
        options: NarrateOptions,
    ) -> Result<String, NarratorError> {
        let response = self.chat(build_request(messages, options)).await?;
        Ok(response.message.content)
    }

    async fn stream(
        &self,
        messages: Vec<Message>,
        options: NarrateOptions,
    ) -> Result<FragmentStream, NarratorError> {
        let chunks = self.chat_stream(build_request(messages, options)).await?;
        let fragments = chunks.filter_map(|item| {
            futures::future::ready(match item {
                Ok(chunk) if chunk.content.is_empty() => None,
                Ok(chunk) => Some(Ok(chunk.content)),
                Err(e) => Some(Err(NarratorError::from(e))),
            })
        });
        Ok(Box::pin(fragments))
    }
}

fn build_request(messages: Vec<Message>, options: NarrateOptions) -> ChatRequest {
    let mut request = ChatRequest::new(messages);
    if let Some(model) = options.model {
        request = request.with_model(model);
    }
    if let Some(num_ctx) = options.num_ctx {
        request = request.with_num_ctx(num_ctx);
    }
    request
}
