use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Message<'a> {
    pub role: Role,
    pub content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Everything needed for one completion call. Built by form validation,
/// so the ranges below are already enforced when the gateway sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestParameters {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub prompt: String,
    /// Sampling temperature in `[0.0, 2.0]`.
    pub temperature: f32,
    /// Output token ceiling in `[1, 8192]`.
    pub max_output_tokens: u32,
}

/// The closed set of failure categories a completion call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionFailure,
    AuthenticationFailure,
    RateLimited,
    InvalidRequest,
    UpstreamError,
    InternalError,
}

impl ErrorKind {
    pub fn phrase(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailure => "Failed to connect to the completion endpoint",
            ErrorKind::AuthenticationFailure => "Authentication with the completion endpoint failed",
            ErrorKind::RateLimited => "Completion request exceeded rate limit",
            ErrorKind::InvalidRequest => "Completion request was invalid",
            ErrorKind::UpstreamError => "An unexpected error occurred with the completion endpoint",
            ErrorKind::InternalError => "An unexpected error occurred",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.phrase())
    }
}

/// Outcome of a single completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResult {
    Success(String),
    Failure { kind: ErrorKind, detail: String },
}

impl CompletionResult {
    pub fn failure(kind: ErrorKind, detail: impl Into<String>) -> Self {
        CompletionResult::Failure {
            kind,
            detail: detail.into(),
        }
    }
}

/// Renders the reply text, or `Error: <phrase>: <detail>` for failures.
impl fmt::Display for CompletionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionResult::Success(text) => f.write_str(text),
            CompletionResult::Failure { kind, detail } => write!(f, "Error: {}: {}", kind, detail),
        }
    }
}

/// What went wrong, as observed on the wire, before classification.
#[derive(Debug, Error)]
pub enum Fault {
    /// No HTTP response was received.
    #[error("{0}")]
    Transport(String),
    /// The endpoint answered with a non-2xx status.
    #[error("Error code: {status} - {message}")]
    Status { status: u16, message: String },
    /// The endpoint answered 2xx but the body is not a completion.
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Local(String),
}

/// Maps a fault onto its category. Specific statuses are matched before
/// the generic upstream case.
pub fn classify(fault: &Fault) -> ErrorKind {
    match fault {
        Fault::Transport(_) => ErrorKind::ConnectionFailure,
        Fault::Status { status: 401, .. } => ErrorKind::AuthenticationFailure,
        Fault::Status { status: 429, .. } => ErrorKind::RateLimited,
        // Unknown models (404) and rejected parameters (422) count as bad
        // requests here, unlike the OpenAI SDK's exception ladder.
        Fault::Status {
            status: 400 | 404 | 422,
            ..
        } => ErrorKind::InvalidRequest,
        Fault::Status { .. } | Fault::Upstream(_) => ErrorKind::UpstreamError,
        Fault::Local(_) => ErrorKind::InternalError,
    }
}

impl From<reqwest::Error> for Fault {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Fault::Local(err.to_string())
        } else {
            Fault::Transport(err.to_string())
        }
    }
}

/// Anything that can turn request parameters into a completion result.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Never fails: every error is folded into a `CompletionResult::Failure`.
    async fn complete(&self, params: &RequestParameters) -> CompletionResult;
}

/// Talks to an OpenAI-compatible `/chat/completions` endpoint. A new
/// HTTP client is built per call; nothing is pooled between requests.
#[derive(Debug, Default, Clone)]
pub struct HttpGateway;

impl HttpGateway {
    pub fn new() -> Self {
        Self
    }

    async fn request(&self, params: &RequestParameters) -> Result<String, Fault> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Fault::Local(format!("Failed to build HTTP client: {}", e)))?;

        let url = format!("{}/chat/completions", params.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &params.model_name,
            messages: vec![Message {
                role: Role::User,
                content: &params.prompt,
            }],
            temperature: params.temperature,
            max_tokens: params.max_output_tokens,
            stream: false,
        };

        debug!("POST {} (model {})", url, params.model_name);

        let response = client
            .post(&url)
            .bearer_auth(&params.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|envelope| envelope.error.message)
                .unwrap_or(text);
            return Err(Fault::Status { status, message });
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| Fault::Upstream(format!("Failed to parse completion response: {}", e)))?;

        let choice = chat_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Fault::Local("Completion response contained no choices".to_string()))?;

        choice
            .message
            .content
            .map(|content| content.trim().to_string())
            .ok_or_else(|| Fault::Local("Completion choice has no message content".to_string()))
    }
}

#[async_trait]
impl Completer for HttpGateway {
    async fn complete(&self, params: &RequestParameters) -> CompletionResult {
        match self.request(params).await {
            Ok(text) => CompletionResult::Success(text),
            Err(fault) => {
                let kind = classify(&fault);
                let detail = fault.to_string();
                warn!("{}: {}", kind, detail);
                CompletionResult::Failure { kind, detail }
            }
        }
    }
}
