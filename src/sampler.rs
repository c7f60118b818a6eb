//! Sampler pipeline construction.
//!
//! The pipeline is described as a list of `SamplerStage`s that the backend
//! turns into a native sampler chain. Stage order is fixed: penalties, top-k,
//! min-p, top-p, temperature, grammar, final selection. Grammar runs after
//! distribution shaping and before selection so the selected token is always
//! grammar-valid.

use serde::{Deserialize, Serialize};

use crate::config::SamplerConfig;
use crate::logger::Logger;

/// One stage of the native sampler chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SamplerStage {
    Penalties {
        last_n: i32,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    TopK(i32),
    MinP(f32),
    TopP(f32),
    Temperature(f32),
    Grammar { grammar: String, root: String },
    /// Seeded categorical draw from the shaped distribution.
    Dist { seed: u32 },
    Greedy,
}

impl SamplerStage {
    /// Short label used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SamplerStage::Penalties { .. } => "penalties",
            SamplerStage::TopK(_) => "top_k",
            SamplerStage::MinP(_) => "min_p",
            SamplerStage::TopP(_) => "top_p",
            SamplerStage::Temperature(_) => "temp",
            SamplerStage::Grammar { .. } => "grammar",
            SamplerStage::Dist { .. } => "dist",
            SamplerStage::Greedy => "greedy",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, SamplerStage::Dist { .. } | SamplerStage::Greedy)
    }
}

/// Build the stage list for a sampling configuration.
///
/// Stages whose parameters are neutral are left out; the relative order of
/// the remaining stages never changes. Temperature 0 drops the temperature
/// stage and ends the chain with greedy selection.
pub fn build_pipeline(config: &SamplerConfig, logger: &Logger) -> Vec<SamplerStage> {
    let mut stages = Vec::new();

    let use_penalties = config.repeat_penalty != 1.0
        || config.frequency_penalty != 0.0
        || config.presence_penalty != 0.0;
    if use_penalties && config.penalty_last_n != 0 {
        stages.push(SamplerStage::Penalties {
            last_n: config.penalty_last_n,
            repeat: config.repeat_penalty,
            frequency: config.frequency_penalty,
            presence: config.presence_penalty,
        });
    }

    if config.top_k > 0 {
        stages.push(SamplerStage::TopK(config.top_k));
    }
    if config.min_p > 0.0 {
        stages.push(SamplerStage::MinP(config.min_p));
    }
    if config.top_p < 1.0 {
        stages.push(SamplerStage::TopP(config.top_p));
    }
    if !config.is_greedy() {
        stages.push(SamplerStage::Temperature(config.temperature));
    }
    if let Some(grammar) = &config.grammar {
        stages.push(SamplerStage::Grammar {
            grammar: grammar.clone(),
            root: "root".to_string(),
        });
    }

    if config.is_greedy() {
        stages.push(SamplerStage::Greedy);
    } else {
        stages.push(SamplerStage::Dist { seed: config.seed });
    }

    let names: Vec<&str> = stages.iter().map(SamplerStage::name).collect();
    crate::log_debug!(
        logger,
        "Sampler chain: {} (temp={}, top_k={}, top_p={}, min_p={})",
        names.join(" -> "),
        config.temperature,
        config.top_k,
        config.top_p,
        config.min_p
    );

    stages
}
