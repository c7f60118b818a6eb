//! llama.cpp backend over the `llama-cpp-2` bindings.
//!
//! Owns every native handle: the process backend, the loaded model, one
//! inference context and the sampler chain. Handles are released exactly
//! once, when replaced or when the value drops.

use std::num::NonZeroU32;
use std::path::Path;

use encoding_rs::{CoderResult, Decoder, UTF_8};
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::LlamaModel;
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;

use super::{ContextInfo, InferenceBackend, ModelInfo, Token};
use crate::config::{ContextConfig, ModelConfig};
use crate::error::{wrap, LlamaError, Result};
use crate::logger::Logger;
use crate::sampler::SamplerStage;
use crate::{log_debug, log_info, log_warn};

/// Native backend.
///
/// Field order is drop order: sampler and context go before the model they
/// borrow from, and the model before the process backend.
pub struct LlamaCppBackend {
    sampler: Option<LlamaSampler>,
    /// Lifetime erased to `'static`; really borrows `*model`.
    context: Option<LlamaContext<'static>>,
    context_config: Option<ContextConfig>,
    decoder: Decoder,
    /// Boxed so the address the context points at survives moves of `self`.
    model: Option<Box<LlamaModel>>,
    model_path: Option<String>,
    backend: Option<LlamaBackend>,
    logger: Logger,
}

// SAFETY: LlamaContext, LlamaModel and LlamaSampler wrap raw C pointers
// (NonNull), which are !Send by default. llama.cpp handles are not tied to
// the creating thread; they are safe to move as long as they are never used
// concurrently. The worker thread is the only user of this value.
unsafe impl Send for LlamaCppBackend {}

impl std::fmt::Debug for LlamaCppBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaCppBackend")
            .field("initialized", &self.backend.is_some())
            .field("model_path", &self.model_path)
            .field("context", &self.context_config)
            .finish_non_exhaustive()
    }
}

impl LlamaCppBackend {
    pub fn new(logger: Logger) -> Self {
        Self {
            sampler: None,
            context: None,
            context_config: None,
            decoder: UTF_8.new_decoder(),
            model: None,
            model_path: None,
            backend: None,
            logger,
        }
    }

    fn model(&self) -> Result<&LlamaModel> {
        self.model.as_deref().ok_or(LlamaError::ModelNotLoaded)
    }

    /// Tokenize with special-token parsing, so ChatML markers map to their
    /// control tokens.
    fn str_to_tokens(model: &LlamaModel, text: &str, add_bos: bool) -> Vec<LlamaToken> {
        model.vocab().tokenize(text.as_bytes(), add_bos, true)
    }

    /// Drop the context (and the sampler, which may reference model
    /// grammar state) ahead of any model change.
    fn drop_context(&mut self) {
        self.sampler = None;
        self.context = None;
        self.context_config = None;
    }
}

impl InferenceBackend for LlamaCppBackend {
    fn init(&mut self) -> Result<()> {
        if self.backend.is_some() {
            return Ok(());
        }
        let backend = LlamaBackend::init().map_err(wrap(LlamaError::DecodeFailure, "backend init"))?;
        log_info!(self.logger, "llama.cpp backend initialized");
        self.backend = Some(backend);
        Ok(())
    }

    fn load_model(&mut self, path: &str, config: &ModelConfig) -> Result<ModelInfo> {
        let load_failure = |detail: String| LlamaError::ModelLoadFailure {
            path: path.to_string(),
            detail,
        };

        self.drop_context();
        self.model = None;
        self.model_path = None;

        let backend = self.backend.as_ref().ok_or(LlamaError::NotInitialized)?;
        if !Path::new(path).is_file() {
            return Err(load_failure("file not found".to_string()));
        }

        let params = LlamaModelParams::default()
            .with_n_gpu_layers(config.gpu_layers)
            .with_use_mlock(config.use_mlock)
            .with_use_mmap(config.use_mmap);
        if config.use_mlock {
            log_info!(self.logger, "mlock enabled (force model in RAM)");
        }
        if !config.use_mmap {
            log_info!(self.logger, "mmap disabled (no memory-mapped loading)");
        }

        let model = LlamaModel::load_from_file(backend, path, &params)
            .map_err(|e| load_failure(e.to_string()))?;
        let info = ModelInfo {
            path: path.to_string(),
            n_ctx_train: model.n_ctx_train(),
            n_vocab: model.n_vocab(),
            gpu_layers: config.gpu_layers,
        };

        self.model = Some(Box::new(model));
        self.model_path = Some(path.to_string());
        Ok(info)
    }

    fn create_context(&mut self, config: &ContextConfig) -> Result<ContextInfo> {
        self.drop_context();

        let backend = self.backend.as_ref().ok_or(LlamaError::NotInitialized)?;
        let model = self.model.as_deref().ok_or(LlamaError::ModelNotLoaded)?;

        let mut params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(config.n_ctx))
            .with_n_batch(config.n_batch)
            .with_embeddings(config.embeddings);
        if config.n_threads > 0 {
            params = params
                .with_n_threads(config.n_threads)
                .with_n_threads_batch(config.n_threads);
        }

        let ctx = model
            .new_context(backend, params)
            .map_err(wrap(LlamaError::DecodeFailure, "create context"))?;
        let n_ctx = ctx.n_ctx();

        // SAFETY: the context borrows the boxed model, whose heap address is
        // stable. `drop_context` runs before the model is replaced, and field
        // order drops the context before the model.
        let ctx = unsafe { std::mem::transmute::<LlamaContext<'_>, LlamaContext<'static>>(ctx) };

        log_debug!(
            self.logger,
            "Context created: n_ctx={}, n_batch={}, embeddings={}",
            n_ctx,
            config.n_batch,
            config.embeddings
        );
        self.context = Some(ctx);
        self.context_config = Some(config.clone());
        Ok(ContextInfo {
            n_ctx,
            n_batch: config.n_batch,
            embeddings: config.embeddings,
        })
    }

    fn clear(&mut self) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;
        ctx.clear_kv_cache();
        self.decoder = UTF_8.new_decoder();
        Ok(())
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let tokens = Self::str_to_tokens(self.model()?, text, add_bos);
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    fn detokenize(&self, tokens: &[Token]) -> Result<String> {
        let tokens: Vec<LlamaToken> = tokens.iter().map(|&t| LlamaToken::new(t)).collect();
        let bytes = self.model()?.vocab().detokenize(&tokens, false, false);
        let (text, had_errors) = UTF_8.decode_without_bom_handling(&bytes);
        if had_errors {
            log_warn!(self.logger, "Detokenized text contains invalid UTF-8; replaced");
        }
        Ok(text.into_owned())
    }

    fn token_to_piece(&mut self, token: Token) -> Result<String> {
        let model = self.model.as_deref().ok_or(LlamaError::ModelNotLoaded)?;
        let bytes = model.vocab().token_to_piece(LlamaToken::new(token), true, None);

        // Incomplete multi-byte sequences stay buffered in the decoder until
        // the next token completes them.
        let mut piece = String::with_capacity(
            self.decoder
                .max_utf8_buffer_length(bytes.len())
                .unwrap_or(bytes.len() + 4),
        );
        let (result, read, had_errors) = self.decoder.decode_to_string(&bytes, &mut piece, false);
        if had_errors {
            log_warn!(
                self.logger,
                "Token {} is not valid UTF-8; replaced. Continuing generation.",
                token
            );
        }
        if result == CoderResult::OutputFull || read < bytes.len() {
            log_warn!(self.logger, "Token {} piece truncated while decoding", token);
        }
        Ok(piece)
    }

    fn is_eog(&self, token: Token) -> bool {
        self.model
            .as_deref()
            .is_some_and(|m| m.vocab().is_eog(LlamaToken::new(token)))
    }

    fn context_size(&self) -> Option<u32> {
        self.context.as_ref().map(LlamaContext::n_ctx)
    }

    fn decode(&mut self, tokens: &[Token], start_pos: u32) -> Result<()> {
        let n_batch = self
            .context_config
            .as_ref()
            .map_or(512, |c| c.n_batch as usize)
            .max(1);
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;

        let last = tokens.len().saturating_sub(1);
        let mut batch = LlamaBatch::new(n_batch, 1);
        for (chunk_idx, chunk) in tokens.chunks(n_batch).enumerate() {
            batch.clear();
            for (offset, &token) in chunk.iter().enumerate() {
                let i = chunk_idx * n_batch + offset;
                let pos = i32::try_from(start_pos as usize + i).map_err(|_| {
                    LlamaError::DecodeFailure(format!("position {} out of range", start_pos as usize + i))
                })?;
                batch
                    .add(LlamaToken::new(token), pos, &[0], i == last)
                    .map_err(wrap(LlamaError::DecodeFailure, "batch add"))?;
            }
            ctx.decode(&mut batch).map_err(|e| {
                LlamaError::DecodeFailure(format!(
                    "decode failed (chunk {}/{}): {e}",
                    chunk_idx + 1,
                    tokens.len().div_ceil(n_batch)
                ))
            })?;
        }
        Ok(())
    }

    fn truncate(&mut self, keep: usize) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;
        let keep = u32::try_from(keep)
            .map_err(|_| LlamaError::DecodeFailure(format!("position {keep} out of range")))?;
        ctx.kv_cache_seq_rm(0, Some(keep), None)
            .map_err(wrap(LlamaError::DecodeFailure, "trim KV cache"))?;
        self.decoder = UTF_8.new_decoder();
        Ok(())
    }

    fn configure_sampler(&mut self, stages: &[SamplerStage]) -> Result<()> {
        let model = self.model.as_deref().ok_or(LlamaError::ModelNotLoaded)?;
        let n_vocab = model.n_vocab();

        let mut samplers = Vec::with_capacity(stages.len());
        for stage in stages {
            let sampler = match stage {
                SamplerStage::Penalties {
                    last_n,
                    repeat,
                    frequency,
                    presence,
                } => LlamaSampler::penalties(n_vocab, *last_n, *repeat, *frequency, *presence),
                SamplerStage::TopK(k) => LlamaSampler::top_k(*k),
                SamplerStage::MinP(p) => LlamaSampler::min_p(*p, 1),
                SamplerStage::TopP(p) => LlamaSampler::top_p(*p, 1),
                SamplerStage::Temperature(t) => LlamaSampler::temp(*t),
                SamplerStage::Grammar { grammar, root } => LlamaSampler::grammar(model, grammar, root)
                    .map_err(|e| {
                        LlamaError::SamplingParameterInvalid(format!("grammar compile failed: {e:?}"))
                    })?,
                SamplerStage::Dist { seed } => LlamaSampler::dist(*seed),
                SamplerStage::Greedy => LlamaSampler::greedy(),
            };
            samplers.push(sampler);
        }

        self.sampler = Some(LlamaSampler::chain_simple(samplers));
        self.decoder = UTF_8.new_decoder();
        Ok(())
    }

    fn sample(&mut self) -> Result<Token> {
        let ctx = self.context.as_ref().ok_or(LlamaError::ContextNotCreated)?;
        let sampler = self.sampler.as_mut().ok_or_else(|| {
            LlamaError::SamplingParameterInvalid("sampler chain not configured".to_string())
        })?;
        Ok(sampler.sample(ctx, -1).0)
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let config = self
            .context_config
            .as_ref()
            .ok_or(LlamaError::ContextNotCreated)?;
        if !config.embeddings {
            return Err(LlamaError::EmbeddingsFailure(
                "context was created without embeddings".to_string(),
            ));
        }
        let n_batch = config.n_batch as usize;

        let model = self.model.as_deref().ok_or(LlamaError::ModelNotLoaded)?;
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;

        let tokens = Self::str_to_tokens(model, text, true);
        if tokens.is_empty() {
            return Err(LlamaError::TokenizationFailure(text.to_string()));
        }
        if tokens.len() > n_batch {
            return Err(LlamaError::EmbeddingsFailure(format!(
                "input of {} tokens exceeds batch size {n_batch}",
                tokens.len()
            )));
        }

        ctx.clear_kv_cache();
        let mut batch = LlamaBatch::new(tokens.len(), 1);
        for (i, token) in tokens.into_iter().enumerate() {
            let pos = i32::try_from(i)
                .map_err(|_| LlamaError::EmbeddingsFailure("input too long".to_string()))?;
            batch
                .add(token, pos, &[0], true)
                .map_err(wrap(LlamaError::EmbeddingsFailure, "batch add"))?;
        }
        ctx.decode(&mut batch)
            .map_err(wrap(LlamaError::EmbeddingsFailure, "decode"))?;

        let mut values = ctx
            .embeddings_seq_ith(0)
            .map_err(wrap(LlamaError::EmbeddingsFailure, "read embeddings"))?
            .to_vec();
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        }
        ctx.clear_kv_cache();
        Ok(values)
    }

    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<()> {
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;
        let tokens: Vec<LlamaToken> = tokens.iter().map(|&t| LlamaToken::new(t)).collect();
        ctx.state_save_file(path, &tokens)
            .map_err(wrap(LlamaError::SessionFailure, "save state"))
    }

    fn load_state(&mut self, path: &Path, max_tokens: usize) -> Result<Vec<Token>> {
        let ctx = self.context.as_mut().ok_or(LlamaError::ContextNotCreated)?;
        let tokens = ctx
            .state_load_file(path, max_tokens)
            .map_err(wrap(LlamaError::SessionFailure, "load state"))?;
        self.decoder = UTF_8.new_decoder();
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }
}
