//! Configuration value objects.
//!
//! All of these are plain immutable values: built once, validated once, and
//! moved (or cloned) into commands. Missing JSON fields fall back to the
//! `default_*` functions so older config files keep loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LlamaError, Result};

/// GBNF grammar restricting output to a single JSON value.
pub const JSON_GRAMMAR: &str = r##"root   ::= object
value  ::= object | array | string | number | ("true" | "false" | "null") ws

object ::=
  "{" ws (
            string ":" ws value
    ("," ws string ":" ws value)*
  )? "}" ws

array  ::=
  "[" ws (
            value
    ("," ws value)*
  )? "]" ws

string ::=
  "\"" (
    [^"\\\x7F\x00-\x1F] |
    "\\" (["\\bfnrt] | "u" [0-9a-fA-F]{4})
  )* "\"" ws

number ::= ("-"? ([0-9] | [1-9] [0-9]{0,15})) ("." [0-9]+)? ([eE] [-+]? [0-9] [1-9]{0,15})? ws

ws ::= | " " | "\n" [ \t]{0,20}
"##;

/// Model-level parameters applied at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Layers offloaded to the GPU (0 = CPU only).
    #[serde(default)]
    pub gpu_layers: u32,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
        }
    }
}

/// Inference context parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_n_ctx")]
    pub n_ctx: u32,
    #[serde(default = "default_n_batch")]
    pub n_batch: u32,
    /// 0 = let llama.cpp decide.
    #[serde(default)]
    pub n_threads: i32,
    /// Enable the embeddings output (required by `embed`).
    #[serde(default)]
    pub embeddings: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_threads: 0,
            embeddings: false,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(LlamaError::Config("n_ctx must be non-zero".to_string()));
        }
        if self.n_batch == 0 {
            return Err(LlamaError::Config("n_batch must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Sampling configuration sent with every generation command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// 0.0 selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// 0 disables top-k.
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub min_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: i32,
    #[serde(default = "default_seed")]
    pub seed: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub stop_strings: Vec<String>,
    /// Optional GBNF grammar constraint.
    #[serde(default)]
    pub grammar: Option<String>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self::balanced()
    }
}

impl SamplerConfig {
    /// General chat settings.
    pub fn balanced() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.05,
            repeat_penalty: default_repeat_penalty(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            penalty_last_n: default_penalty_last_n(),
            seed: default_seed(),
            max_tokens: default_max_tokens(),
            stop_strings: Vec::new(),
            grammar: None,
        }
    }

    /// Greedy decoding; same prompt and model always give the same output.
    pub fn deterministic() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            repeat_penalty: 1.0,
            ..Self::balanced()
        }
    }

    pub fn creative() -> Self {
        Self {
            temperature: 1.0,
            top_k: 80,
            top_p: 0.98,
            min_p: 0.02,
            repeat_penalty: 1.15,
            presence_penalty: 0.3,
            ..Self::balanced()
        }
    }

    /// Low temperature with the JSON grammar attached.
    pub fn json() -> Self {
        Self {
            temperature: 0.2,
            grammar: Some(JSON_GRAMMAR.to_string()),
            ..Self::balanced()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stop_strings<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_strings = stops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(LlamaError::SamplingParameterInvalid(msg));

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return invalid(format!("temperature must be >= 0, got {}", self.temperature));
        }
        if self.top_k < 0 {
            return invalid(format!("top_k must be >= 0, got {}", self.top_k));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return invalid(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return invalid(format!("min_p must be in [0, 1], got {}", self.min_p));
        }
        if self.repeat_penalty <= 0.0 {
            return invalid(format!(
                "repeat_penalty must be > 0, got {}",
                self.repeat_penalty
            ));
        }
        if self.penalty_last_n < -1 {
            return invalid(format!(
                "penalty_last_n must be >= -1, got {}",
                self.penalty_last_n
            ));
        }
        if self.max_tokens == 0 {
            return invalid("max_tokens must be > 0".to_string());
        }
        if self.stop_strings.iter().any(String::is_empty) {
            return invalid("stop strings must be non-empty".to_string());
        }
        if matches!(self.grammar.as_deref(), Some(g) if g.trim().is_empty()) {
            return invalid("grammar must be non-empty when set".to_string());
        }
        Ok(())
    }
}

/// Settings for the coordinator and worker themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long `init_backend` / `create_context` wait for the worker.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Upper bound on waits for model loading and other long commands.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// How long `dispose` waits for the worker thread to exit.
    #[serde(default = "default_dispose_join_timeout_ms")]
    pub dispose_join_timeout_ms: u64,
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: default_ready_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            dispose_join_timeout_ms: default_dispose_join_timeout_ms(),
            default_system_prompt: default_system_prompt(),
            session_dir: default_session_dir(),
        }
    }
}

impl WorkerConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| LlamaError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LlamaError::Config(format!("{}: {e}", path.display()))),
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn dispose_join_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_join_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_n_ctx() -> u32 {
    4096
}

fn default_n_batch() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_k() -> i32 {
    40
}

fn default_top_p() -> f32 {
    0.95
}

fn default_repeat_penalty() -> f32 {
    1.1
}

fn default_penalty_last_n() -> i32 {
    64
}

fn default_seed() -> u32 {
    1234
}

fn default_max_tokens() -> u32 {
    512
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_command_timeout_ms() -> u64 {
    300_000
}

fn default_dispose_join_timeout_ms() -> u64 {
    5_000
}

fn default_system_prompt() -> String {
    "You are a helpful AI assistant.".to_string()
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}
