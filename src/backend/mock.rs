// Mock backend for testing the worker protocol without a GGUF model.
//
// One token per character; "sampling" walks a fixed script and then emits
// EOS, so the output is the same on every run.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ContextInfo, InferenceBackend, ModelInfo, Token};
use crate::config::{ContextConfig, ModelConfig};
use crate::error::{wrap, LlamaError, Result};
use crate::sampler::SamplerStage;

pub const BOS: Token = 1;
pub const EOS: Token = 2;
const CHAR_OFFSET: Token = 256;

/// Observations a test can read after the backend moved into the worker.
#[derive(Debug, Default)]
pub struct MockTrace {
    pub sampler_chains: Vec<Vec<SamplerStage>>,
    /// `start_pos` of every decode call, in order.
    pub decode_starts: Vec<u32>,
    pub clears: usize,
}

/// Scripted stand-in for the native library.
#[derive(Debug)]
pub struct MockBackend {
    script: Vec<char>,
    cursor: usize,
    initialized: bool,
    model: Option<String>,
    context: Option<ContextConfig>,
    n_past: u32,
    evaluated: Vec<Token>,
    fail_decode_at: Option<usize>,
    step_delay: Duration,
    init_delay: Duration,
    trace: Arc<Mutex<MockTrace>>,
}

impl MockBackend {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.chars().collect(),
            cursor: 0,
            initialized: false,
            model: None,
            context: None,
            n_past: 0,
            evaluated: Vec::new(),
            fail_decode_at: None,
            step_delay: Duration::ZERO,
            init_delay: Duration::ZERO,
            trace: Arc::new(Mutex::new(MockTrace::default())),
        }
    }

    /// Fail the n-th decode call (0 = the prompt decode).
    pub fn fail_decode_at(mut self, call: usize) -> Self {
        self.fail_decode_at = Some(call);
        self
    }

    /// Sleep this long in every decode, to simulate a slow model.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Sleep this long in `init`, to simulate a slow backend start.
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    pub fn trace(&self) -> Arc<Mutex<MockTrace>> {
        self.trace.clone()
    }

    fn encode_char(c: char) -> Token {
        CHAR_OFFSET + c as Token
    }

    fn decode_token(token: Token) -> Option<char> {
        if token < CHAR_OFFSET {
            return None;
        }
        u32::try_from(token - CHAR_OFFSET).ok().and_then(char::from_u32)
    }

    fn with_trace(&self, f: impl FnOnce(&mut MockTrace)) {
        if let Ok(mut trace) = self.trace.lock() {
            f(&mut trace);
        }
    }
}

impl InferenceBackend for MockBackend {
    fn init(&mut self) -> Result<()> {
        if !self.init_delay.is_zero() {
            std::thread::sleep(self.init_delay);
        }
        self.initialized = true;
        Ok(())
    }

    fn load_model(&mut self, path: &str, config: &ModelConfig) -> Result<ModelInfo> {
        if !self.initialized {
            return Err(LlamaError::NotInitialized);
        }
        self.context = None;
        self.model = None;
        if !path.ends_with(".gguf") {
            return Err(LlamaError::ModelLoadFailure {
                path: path.to_string(),
                detail: "only .gguf model files are supported".to_string(),
            });
        }
        self.model = Some(path.to_string());
        Ok(ModelInfo {
            path: path.to_string(),
            n_ctx_train: 8192,
            n_vocab: 0x11_0000 + CHAR_OFFSET,
            gpu_layers: config.gpu_layers,
        })
    }

    fn create_context(&mut self, config: &ContextConfig) -> Result<ContextInfo> {
        if self.model.is_none() {
            return Err(LlamaError::ModelNotLoaded);
        }
        self.context = Some(config.clone());
        self.n_past = 0;
        self.evaluated.clear();
        Ok(ContextInfo {
            n_ctx: config.n_ctx,
            n_batch: config.n_batch,
            embeddings: config.embeddings,
        })
    }

    fn clear(&mut self) -> Result<()> {
        if self.context.is_none() {
            return Err(LlamaError::ContextNotCreated);
        }
        self.cursor = 0;
        self.n_past = 0;
        self.evaluated.clear();
        self.with_trace(|p| p.clears += 1);
        Ok(())
    }

    fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        if self.model.is_none() {
            return Err(LlamaError::ModelNotLoaded);
        }
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos && !text.is_empty() {
            tokens.push(BOS);
        }
        tokens.extend(text.chars().map(Self::encode_char));
        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[Token]) -> Result<String> {
        Ok(tokens.iter().filter_map(|&t| Self::decode_token(t)).collect())
    }

    fn token_to_piece(&mut self, token: Token) -> Result<String> {
        Ok(Self::decode_token(token).map(String::from).unwrap_or_default())
    }

    fn is_eog(&self, token: Token) -> bool {
        token == EOS
    }

    fn context_size(&self) -> Option<u32> {
        self.context.as_ref().map(|c| c.n_ctx)
    }

    fn decode(&mut self, tokens: &[Token], start_pos: u32) -> Result<()> {
        let n_ctx = self.context_size().ok_or(LlamaError::ContextNotCreated)?;

        let call = {
            let mut trace = self.trace.lock().map_err(|_| {
                LlamaError::DecodeFailure("mock trace poisoned".to_string())
            })?;
            trace.decode_starts.push(start_pos);
            trace.decode_starts.len() - 1
        };
        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }
        if self.fail_decode_at == Some(call) {
            return Err(LlamaError::DecodeFailure(format!(
                "injected failure at decode call {call}"
            )));
        }

        let end = start_pos as usize + tokens.len();
        if end > n_ctx as usize {
            return Err(LlamaError::DecodeFailure(format!(
                "position {end} beyond context window {n_ctx}"
            )));
        }
        self.evaluated.truncate(start_pos as usize);
        self.evaluated.extend_from_slice(tokens);
        self.n_past = end as u32;
        Ok(())
    }

    fn truncate(&mut self, keep: usize) -> Result<()> {
        if self.context.is_none() {
            return Err(LlamaError::ContextNotCreated);
        }
        if keep > self.evaluated.len() {
            return Err(LlamaError::DecodeFailure(format!(
                "cannot keep {keep} of {} cached tokens",
                self.evaluated.len()
            )));
        }
        self.evaluated.truncate(keep);
        self.n_past = u32::try_from(keep).unwrap_or(u32::MAX);
        Ok(())
    }

    fn configure_sampler(&mut self, stages: &[SamplerStage]) -> Result<()> {
        if !stages.last().is_some_and(SamplerStage::is_final) {
            return Err(LlamaError::SamplingParameterInvalid(
                "sampler chain must end in a selection stage".to_string(),
            ));
        }
        // A fresh chain starts the script over.
        self.cursor = 0;
        let chain = stages.to_vec();
        self.with_trace(|p| p.sampler_chains.push(chain));
        Ok(())
    }

    fn sample(&mut self) -> Result<Token> {
        if self.n_past == 0 {
            return Err(LlamaError::DecodeFailure("no logits to sample".to_string()));
        }
        let token = match self.script.get(self.cursor) {
            Some(&c) => {
                self.cursor += 1;
                Self::encode_char(c)
            }
            None => EOS,
        };
        Ok(token)
    }

    fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        match &self.context {
            Some(c) if c.embeddings => {}
            Some(_) => {
                return Err(LlamaError::EmbeddingsFailure(
                    "context was created without embeddings".to_string(),
                ))
            }
            None => return Err(LlamaError::ContextNotCreated),
        }
        let mut buckets = vec![0.0f32; 8];
        for c in text.chars() {
            buckets[(c as usize) % 8] += 1.0;
        }
        let norm = buckets.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            buckets.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(buckets)
    }

    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> Result<()> {
        if self.context.is_none() {
            return Err(LlamaError::ContextNotCreated);
        }
        let blob = serde_json::to_vec(tokens).map_err(wrap(LlamaError::SessionFailure, "encode state"))?;
        std::fs::write(path, blob).map_err(wrap(LlamaError::SessionFailure, "write state"))
    }

    fn load_state(&mut self, path: &Path, max_tokens: usize) -> Result<Vec<Token>> {
        if self.context.is_none() {
            return Err(LlamaError::ContextNotCreated);
        }
        let blob = std::fs::read(path).map_err(wrap(LlamaError::SessionFailure, "read state"))?;
        let tokens: Vec<Token> =
            serde_json::from_slice(&blob).map_err(wrap(LlamaError::SessionFailure, "decode state"))?;
        if tokens.len() > max_tokens {
            return Err(LlamaError::SessionFailure(format!(
                "state holds {} tokens, limit is {max_tokens}",
                tokens.len()
            )));
        }
        self.evaluated = tokens.clone();
        self.n_past = u32::try_from(tokens.len()).unwrap_or(u32::MAX);
        Ok(tokens)
    }
}
