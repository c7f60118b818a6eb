//! Background-worker generation protocol over llama.cpp.
//!
//! A dedicated worker thread exclusively owns the native inference handle
//! (through an [`InferenceBackend`]); an async [`Coordinator`] turns method
//! calls into [`Command`]s and routes the worker's [`Response`]s back to the
//! callers by [`RequestId`].

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod generation;
pub mod logger;
pub mod prompt;
pub mod protocol;
pub mod sampler;
pub mod session;
pub mod stop;
pub mod worker;

pub use backend::{ContextInfo, InferenceBackend, ModelInfo, Token};
#[cfg(feature = "native")]
pub use backend::llama::LlamaCppBackend;
#[cfg(any(test, feature = "mock"))]
pub use backend::mock::MockBackend;
pub use config::{ContextConfig, ModelConfig, SamplerConfig, WorkerConfig, JSON_GRAMMAR};
pub use coordinator::{Coordinator, TokenStream};
pub use error::{LlamaError, Result};
pub use logger::{setup_logging, Logger};
pub use protocol::{
    Command, Completion, GenerationMetrics, GenerationRequest, RequestId, Response, StopReason,
    SuccessPayload, WorkerStatus,
};
pub use session::{ChatMessage, ChatSession, Role, SessionStore};
