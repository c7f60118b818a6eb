//! Seam between the worker and the native inference library.
//!
//! The worker only ever talks to an [`InferenceBackend`]. The real
//! implementation wraps llama.cpp through `llama-cpp-2` (feature `native`);
//! [`mock::MockBackend`] scripts deterministic output for tests.

#[cfg(feature = "native")]
pub mod llama;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{ContextConfig, ModelConfig};
use crate::error::Result;
use crate::sampler::SamplerStage;

/// Vocabulary token id as used by llama.cpp.
pub type Token = i32;

/// Metadata reported after a model load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub path: String,
    /// Context length the model was trained with.
    pub n_ctx_train: u32,
    pub n_vocab: i32,
    pub gpu_layers: u32,
}

/// Metadata reported after context creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub embeddings: bool,
}

/// Everything the worker needs from the native library.
///
/// Implementations own their native handles and release them on drop. All
/// methods are called from the worker thread only.
pub trait InferenceBackend: Send + 'static {
    /// Initialize the native backend. Idempotent.
    fn init(&mut self) -> Result<()>;

    /// Load a model, replacing (and releasing) any previous model and context.
    fn load_model(&mut self, path: &str, config: &ModelConfig) -> Result<ModelInfo>;

    /// Create an inference context for the loaded model, replacing any
    /// previous context.
    fn create_context(&mut self, config: &ContextConfig) -> Result<ContextInfo>;

    /// Forget all evaluated tokens (KV cache) and reset detokenizer state.
    fn clear(&mut self) -> Result<()>;

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>>;

    /// Text of a whole token sequence.
    fn detokenize(&self, tokens: &[Token]) -> Result<String>;

    /// Text of the next generated token. Stateful: multi-byte characters
    /// split across tokens come out once complete.
    fn token_to_piece(&mut self, token: Token) -> Result<String>;

    /// Whether `token` ends generation (EOS, EOT, ...).
    fn is_eog(&self, token: Token) -> bool;

    /// Context window of the current context, if one exists.
    fn context_size(&self) -> Option<u32>;

    /// Evaluate `tokens` at positions `start_pos..`; logits are kept for the
    /// last one.
    fn decode(&mut self, tokens: &[Token], start_pos: u32) -> Result<()>;

    /// Drop KV entries at positions `keep..`, keeping the prefix for reuse.
    /// Resets detokenizer state.
    fn truncate(&mut self, keep: usize) -> Result<()>;

    /// Replace the sampler chain.
    fn configure_sampler(&mut self, stages: &[SamplerStage]) -> Result<()>;

    /// Sample the next token from the last decoded logits.
    fn sample(&mut self) -> Result<Token>;

    /// Sequence embedding of `text`. Requires an embeddings context.
    fn embed(&mut self, text: &str) -> Result<Vec<f32>>;

    /// Persist native context state together with `tokens`.
    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<()>;

    /// Restore native context state; returns the tokens saved with it.
    fn load_state(&mut self, path: &Path, max_tokens: usize) -> Result<Vec<Token>>;
}
