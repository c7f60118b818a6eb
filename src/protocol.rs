//! Message types for coordinator ↔ worker communication.
//!
//! Commands and responses are plain values moved across channels. Both derive
//! serde with an internal `type` tag so they can be logged or framed as JSON
//! lines unchanged.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backend::{ContextInfo, ModelInfo, Token};
use crate::config::{ContextConfig, ModelConfig, SamplerConfig};
use crate::error::LlamaError;
use crate::session::ChatMessage;

/// Correlates a command with the responses it causes. Never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log prefixes.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker lifecycle state, owned by the worker and mirrored by the
/// coordinator through `Status` responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Uninitialized,
    Ready,
    Generating,
    Error,
}

/// Parameters of one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub config: SamplerConfig,
    /// Earlier turns of the conversation, rendered ahead of `prompt`.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
}

/// A command sent to the worker. Consumed exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    InitBackend {
        id: RequestId,
    },
    LoadModel {
        id: RequestId,
        path: String,
        config: ModelConfig,
    },
    CreateContext {
        id: RequestId,
        config: ContextConfig,
    },
    Generate {
        id: RequestId,
        request: GenerationRequest,
    },
    GenerateStream {
        id: RequestId,
        request: GenerationRequest,
    },
    /// Advisory; observed at the next token checkpoint. `None` stops
    /// whatever is running.
    Stop {
        target: Option<RequestId>,
    },
    Clear {
        id: RequestId,
    },
    Tokenize {
        id: RequestId,
        text: String,
        add_bos: bool,
    },
    Detokenize {
        id: RequestId,
        tokens: Vec<Token>,
    },
    Embed {
        id: RequestId,
        text: String,
    },
    SaveState {
        id: RequestId,
        path: PathBuf,
    },
    LoadState {
        id: RequestId,
        path: PathBuf,
    },
    Dispose {
        id: RequestId,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::InitBackend { .. } => "InitBackend",
            Command::LoadModel { .. } => "LoadModel",
            Command::CreateContext { .. } => "CreateContext",
            Command::Generate { .. } => "Generate",
            Command::GenerateStream { .. } => "GenerateStream",
            Command::Stop { .. } => "Stop",
            Command::Clear { .. } => "Clear",
            Command::Tokenize { .. } => "Tokenize",
            Command::Detokenize { .. } => "Detokenize",
            Command::Embed { .. } => "Embed",
            Command::SaveState { .. } => "SaveState",
            Command::LoadState { .. } => "LoadState",
            Command::Dispose { .. } => "Dispose",
        }
    }

    /// Request id of the command; `Stop` has none of its own.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Command::InitBackend { id }
            | Command::LoadModel { id, .. }
            | Command::CreateContext { id, .. }
            | Command::Generate { id, .. }
            | Command::GenerateStream { id, .. }
            | Command::Clear { id }
            | Command::Tokenize { id, .. }
            | Command::Detokenize { id, .. }
            | Command::Embed { id, .. }
            | Command::SaveState { id, .. }
            | Command::LoadState { id, .. }
            | Command::Dispose { id } => Some(id),
            Command::Stop { .. } => None,
        }
    }
}

/// Why a generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model sampled an end-of-generation token.
    Eog,
    /// A configured stop string appeared.
    StopString,
    /// The next position would exceed the context window.
    ContextLimit,
    /// `max_tokens` were generated.
    MaxTokens,
    /// `Stop` or `Dispose` was observed at a checkpoint.
    Stopped,
}

/// Timing for one generation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub prompt_tokens: usize,
    /// Prompt tokens already in the KV cache and not decoded again.
    #[serde(default)]
    pub reused_tokens: usize,
    pub tokens_generated: usize,
    pub prompt_eval_ms: f64,
    pub gen_eval_ms: f64,
    pub prompt_tok_per_sec: Option<f64>,
    pub gen_tok_per_sec: Option<f64>,
}

/// Final result of a generation, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub request_id: RequestId,
    pub text: String,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
    pub metrics: Option<GenerationMetrics>,
}

/// Payload of a `Success` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SuccessPayload {
    BackendReady,
    ModelLoaded { info: ModelInfo },
    ContextCreated { info: ContextInfo },
    Cleared,
    Tokens { tokens: Vec<Token> },
    Text { text: String },
    Embedding { values: Vec<f32> },
    StateSaved { tokens: Vec<Token> },
    StateLoaded { tokens: Vec<Token> },
    Disposed,
}

/// An event emitted by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Success {
        id: RequestId,
        payload: SuccessPayload,
    },
    Error {
        id: RequestId,
        error: LlamaError,
    },
    Token {
        id: RequestId,
        text: String,
        /// 0-based index of the generated token this fragment came from.
        index: usize,
    },
    Metrics {
        id: RequestId,
        metrics: GenerationMetrics,
    },
    Complete {
        id: RequestId,
        text: String,
        tokens_generated: usize,
        stop_reason: StopReason,
    },
    Status {
        id: Option<RequestId>,
        status: WorkerStatus,
    },
}

impl Response {
    pub fn ok(id: RequestId, payload: SuccessPayload) -> Self {
        Response::Success { id, payload }
    }

    pub fn error(id: RequestId, error: LlamaError) -> Self {
        Response::Error { id, error }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Response::Success { id, .. }
            | Response::Error { id, .. }
            | Response::Token { id, .. }
            | Response::Metrics { id, .. }
            | Response::Complete { id, .. } => Some(id),
            Response::Status { id, .. } => id.as_ref(),
        }
    }

    /// Whether this is the last response a request will receive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Response::Success { .. } | Response::Error { .. } | Response::Complete { .. }
        )
    }
}
