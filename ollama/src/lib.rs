//! Minimal Ollama chat API client.
//!
//! This crate provides a focused client for Ollama's `/api/chat` endpoint with:
//! - Non-streaming and streaming completions
//! - Request options (context window size, temperature)
//! - Buffered NDJSON parsing for streaming responses

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

const DEFAULT_HOST: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2-vision:latest";

/// Errors that can occur when using the Ollama client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Ollama API client.
#[derive(Clone)]
pub struct Ollama {
    client: reqwest::Client,
    host: String,
    model: String,
}

impl Ollama {
    /// Create a new client talking to the default local daemon.
    pub fn new() -> Self {
        Self::with_host(DEFAULT_HOST)
    }

    /// Create a client for a specific host, e.g. `http://localhost:11434`.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            host: host.into().trim_end_matches('/').to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a client from the OLLAMA_HOST environment variable,
    /// falling back to the default local daemon address.
    pub fn from_env() -> Self {
        match std::env::var("OLLAMA_HOST") {
            Ok(host) if !host.is_empty() => Self::with_host(host),
            _ => Self::new(),
        }
    }

    /// Set the default model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The model used when a request does not name one.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a chat request and return the complete response.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Error> {
        let api_request = self.build_api_request(&request, false);
        let headers = build_headers();

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let api_response: ApiChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        if let Some(error) = api_response.error {
            return Err(Error::Backend(error));
        }

        Ok(ChatResponse {
            message: api_response.message.map(Into::into).unwrap_or_else(|| {
                Message::assistant("")
            }),
            prompt_eval_count: api_response.prompt_eval_count,
            eval_count: api_response.eval_count,
        })
    }

    /// Send a chat request and stream the response fragment by fragment.
    ///
    /// Ollama frames a streaming response as newline-delimited JSON; a
    /// fragment boundary does not necessarily coincide with a network
    /// chunk boundary, so incomplete lines are buffered across chunks.
    pub async fn chat_stream(
        &self,
        request: ChatRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamChunk, Error>> + Send>>, Error> {
        let api_request = self.build_api_request(&request, true);
        let headers = build_headers();

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        // Use scan to maintain a buffer for incomplete NDJSON lines across chunks
        let stream = response
            .bytes_stream()
            .scan(String::new(), |buffer, result| {
                let chunks = match result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        parse_ndjson_buffered(buffer)
                    }
                    Err(e) => vec![Err(Error::Network(e.to_string()))],
                };
                futures::future::ready(Some(chunks))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    fn build_api_request(&self, request: &ChatRequest, stream: bool) -> ApiChatRequest {
        ApiChatRequest {
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            messages: request.messages.clone(),
            stream,
            options: request.options.clone(),
        }
    }
}

impl Default for Ollama {
    fn default() -> Self {
        Self::new()
    }
}

fn build_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

// ============================================================================
// Public types
// ============================================================================

/// A chat request to send to the model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub options: Options,
}

impl ChatRequest {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            messages,
            options: Options::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the context window size (`num_ctx`).
    pub fn with_num_ctx(mut self, num_ctx: u64) -> Self {
        self.options.num_ctx = Some(num_ctx);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }
}

/// Model options forwarded verbatim to the backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Options {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_ctx: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// The wire name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A complete (non-streaming) chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: Message,
    pub prompt_eval_count: Option<u64>,
    pub eval_count: Option<u64>,
}

/// One fragment of a streaming chat response.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    /// Incremental content; may be empty on the terminal chunk.
    pub content: String,
    /// True on the final chunk of the response.
    pub done: bool,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    options: Options,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

impl From<ApiMessage> for Message {
    fn from(m: ApiMessage) -> Self {
        let role = match m.role.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            _ => Role::Assistant,
        };
        Message {
            role,
            content: m.content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    #[serde(default)]
    message: Option<ApiMessage>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    #[serde(default)]
    message: Option<ApiMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Parse NDJSON lines from a buffer, consuming complete lines and leaving
/// incomplete data for the next chunk.
fn parse_ndjson_buffered(buffer: &mut String) -> Vec<Result<StreamChunk, Error>> {
    let mut chunks = Vec::new();

    loop {
        let Some(newline_pos) = buffer.find('\n') else {
            // No complete line yet, wait for more data
            break;
        };

        let line = buffer[..newline_pos].trim();

        if !line.is_empty() {
            match serde_json::from_str::<ApiStreamChunk>(line) {
                Ok(chunk) => {
                    if let Some(error) = chunk.error {
                        chunks.push(Err(Error::Backend(error)));
                    } else {
                        chunks.push(Ok(StreamChunk {
                            content: chunk.message.map(|m| m.content).unwrap_or_default(),
                            done: chunk.done,
                        }));
                    }
                }
                Err(e) => {
                    chunks.push(Err(Error::Parse(format!("NDJSON parse error: {e}"))));
                }
            }
        }

        // Consume the processed line (including the newline)
        buffer.drain(..=newline_pos);
    }

    chunks
}
