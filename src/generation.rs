//! Generation service: prompt formatting, tokenization, the decode loop,
//! sampling, detokenization and stop checks against an [`InferenceBackend`].
//!
//! Shared by the blocking and streaming paths; the only difference is what
//! the `on_text` callback does with released fragments.

use std::time::Instant;

use crate::backend::{InferenceBackend, Token};
use crate::error::{LlamaError, Result};
use crate::logger::Logger;
use crate::prompt::{format_chat, TEMPLATE_STOP_STRINGS};
use crate::protocol::{GenerationMetrics, GenerationRequest, StopReason};
use crate::sampler::build_pipeline;
use crate::stop::{StopCheck, StopMatcher};
use crate::{log_debug, log_info, log_warn};

/// Answer of the per-token checkpoint callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    Continue,
    Stop,
}

/// Output from a generation run, including timing metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    /// Generated text, truncated before any stop string.
    pub text: String,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
    pub metrics: GenerationMetrics,
    /// Prompt plus generated tokens now held in the KV cache.
    pub evaluated_tokens: Vec<Token>,
}

/// Run one generation against `backend`.
///
/// `cached` lists the tokens the KV cache holds from the previous command;
/// the longest common prefix with the new prompt is kept and only the rest
/// is decoded. `checkpoint` is consulted before the prompt decode and before every
/// sampled token; returning [`Checkpoint::Stop`] ends the loop with
/// [`StopReason::Stopped`]. `on_text(index, fragment)` receives each
/// non-empty fragment of visible text together with the index of the token
/// that produced it.
pub fn run_generation<B, F, C>(
    backend: &mut B,
    request: &GenerationRequest,
    cached: &[Token],
    default_system_prompt: &str,
    logger: &Logger,
    mut on_text: F,
    mut checkpoint: C,
) -> Result<GenerationOutcome>
where
    B: InferenceBackend + ?Sized,
    F: FnMut(usize, &str),
    C: FnMut() -> Checkpoint,
{
    let config = &request.config;
    config.validate()?;

    let n_ctx = backend.context_size().ok_or(LlamaError::ContextNotCreated)? as usize;

    let prompt = format_chat(
        &request.history,
        &request.prompt,
        request.system_prompt.as_deref(),
        default_system_prompt,
    );
    let tokens = backend.tokenize(&prompt, true)?;
    if tokens.is_empty() {
        return Err(LlamaError::TokenizationFailure(request.prompt.clone()));
    }
    if tokens.len() > n_ctx {
        return Err(LlamaError::ContextOverflow {
            current: tokens.len(),
            max: n_ctx,
        });
    }
    log_debug!(
        logger,
        "Prompt tokenized to {} tokens (context window {})",
        tokens.len(),
        n_ctx
    );

    let stages = build_pipeline(config, logger);
    backend.configure_sampler(&stages)?;

    let mut stop_strings = config.stop_strings.clone();
    for s in TEMPLATE_STOP_STRINGS {
        if !stop_strings.iter().any(|existing| existing.as_str() == *s) {
            stop_strings.push((*s).to_string());
        }
    }
    let mut matcher = StopMatcher::new(&stop_strings);

    let reused = reuse_prefix(backend, cached, &tokens, logger)?;
    let mut metrics = GenerationMetrics {
        prompt_tokens: tokens.len(),
        reused_tokens: reused,
        ..GenerationMetrics::default()
    };

    if checkpoint() == Checkpoint::Stop {
        log_info!(logger, "Stopped before prompt decode");
        return Ok(GenerationOutcome {
            text: String::new(),
            tokens_generated: 0,
            stop_reason: StopReason::Stopped,
            metrics,
            evaluated_tokens: tokens[..reused].to_vec(),
        });
    }

    let prompt_eval_start = Instant::now();
    backend.decode(&tokens[reused..], reused as u32)?;
    metrics.prompt_eval_ms = prompt_eval_start.elapsed().as_secs_f64() * 1000.0;

    let gen_start = Instant::now();
    let max_tokens = config.max_tokens as usize;
    let mut evaluated = tokens;
    let mut generated = 0usize;

    let stop_reason = loop {
        if generated >= max_tokens {
            break StopReason::MaxTokens;
        }
        if checkpoint() == Checkpoint::Stop {
            log_info!(logger, "Generation stopped after {} tokens", generated);
            break StopReason::Stopped;
        }

        let token = backend.sample()?;
        if backend.is_eog(token) {
            log_debug!(logger, "EOG token {} at position {}", token, generated);
            break StopReason::Eog;
        }

        let index = generated;
        generated += 1;
        if generated % 50 == 0 {
            log_debug!(logger, "Generated {} tokens so far...", generated);
        }

        let piece = backend.token_to_piece(token)?;
        match matcher.push(&piece) {
            StopCheck::Continue { release } => {
                if !release.is_empty() {
                    on_text(index, &release);
                }
            }
            StopCheck::Stop { release, matched } => {
                if !release.is_empty() {
                    on_text(index, &release);
                }
                log_debug!(logger, "Stop string {:?} matched", matched);
                break StopReason::StopString;
            }
        }

        let pos = evaluated.len();
        if pos >= n_ctx {
            log_info!(logger, "Context window of {} tokens is full", n_ctx);
            break StopReason::ContextLimit;
        }
        backend.decode(&[token], pos as u32)?;
        evaluated.push(token);
    };

    if stop_reason != StopReason::StopString {
        let rest = matcher.finish();
        if !rest.is_empty() {
            on_text(generated.saturating_sub(1), &rest);
        }
    }

    metrics.tokens_generated = generated;
    metrics.gen_eval_ms = gen_start.elapsed().as_secs_f64() * 1000.0;
    metrics.prompt_tok_per_sec = rate(metrics.prompt_tokens - reused, metrics.prompt_eval_ms);
    metrics.gen_tok_per_sec = rate(generated, metrics.gen_eval_ms);

    log_info!(
        logger,
        "Timing: prompt={:.1} tok/s ({} tokens in {:.0}ms), gen={:.1} tok/s ({} tokens in {:.0}ms), reason={:?}",
        metrics.prompt_tok_per_sec.unwrap_or(0.0),
        metrics.prompt_tokens,
        metrics.prompt_eval_ms,
        metrics.gen_tok_per_sec.unwrap_or(0.0),
        generated,
        metrics.gen_eval_ms,
        stop_reason
    );

    Ok(GenerationOutcome {
        text: matcher.into_text(),
        tokens_generated: generated,
        stop_reason,
        metrics,
        evaluated_tokens: evaluated,
    })
}

/// Keep the longest cached prefix of `tokens` in the KV cache and return
/// its length. At least one prompt token is always left to decode so the
/// sampler has fresh logits.
fn reuse_prefix<B>(backend: &mut B, cached: &[Token], tokens: &[Token], logger: &Logger) -> Result<usize>
where
    B: InferenceBackend + ?Sized,
{
    let common = cached
        .iter()
        .zip(tokens)
        .take_while(|(a, b)| a == b)
        .count()
        .min(tokens.len() - 1);

    if common == 0 {
        backend.clear()?;
        return Ok(0);
    }
    match backend.truncate(common) {
        Ok(()) => {
            log_info!(
                logger,
                "Reusing KV cache: {} of {} prompt tokens already evaluated, {} new",
                common,
                tokens.len(),
                tokens.len() - common
            );
            Ok(common)
        }
        Err(e) => {
            log_warn!(logger, "KV cache trim failed ({}); starting fresh", e);
            backend.clear()?;
            Ok(0)
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn rate(tokens: usize, ms: f64) -> Option<f64> {
    if ms > 0.0 && tokens > 0 {
        Some(tokens as f64 / ms * 1000.0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::config::{ContextConfig, ModelConfig, SamplerConfig};
    use crate::sampler::SamplerStage;

    fn backend(script: &str, n_ctx: u32) -> MockBackend {
        let mut b = MockBackend::new(script);
        b.init().unwrap();
        b.load_model("/models/tiny.gguf", &ModelConfig::default())
            .unwrap();
        b.create_context(&ContextConfig {
            n_ctx,
            ..ContextConfig::default()
        })
        .unwrap();
        b
    }

    fn request(prompt: &str, config: SamplerConfig) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            system_prompt: None,
            config,
            history: Vec::new(),
        }
    }

    fn run(
        b: &mut MockBackend,
        req: &GenerationRequest,
    ) -> (Result<GenerationOutcome>, Vec<(usize, String)>) {
        let mut fragments = Vec::new();
        let result = run_generation(
            b,
            req,
            &[],
            "sys",
            &Logger::new("test"),
            |i, t| fragments.push((i, t.to_string())),
            || Checkpoint::Continue,
        );
        (result, fragments)
    }

    #[test]
    fn test_greedy_generation_is_reproducible() {
        let req = request("Hello", SamplerConfig::deterministic().with_max_tokens(5));
        let (first, _) = run(&mut backend("Hi there!", 4096), &req);
        let (second, _) = run(&mut backend("Hi there!", 4096), &req);
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.text, second.text);
        assert_eq!(first.evaluated_tokens, second.evaluated_tokens);
        assert_eq!(first.text, "Hi th");
        assert_eq!(first.tokens_generated, 5);
        assert_eq!(first.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_eog_before_max_tokens() {
        let req = request("Hello", SamplerConfig::deterministic().with_max_tokens(5));
        let (outcome, fragments) = run(&mut backend("ok", 4096), &req);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.text, "ok");
        assert_eq!(outcome.tokens_generated, 2);
        assert_eq!(outcome.stop_reason, StopReason::Eog);
        assert_eq!(fragments, vec![(0, "o".to_string()), (1, "k".to_string())]);
    }

    #[test]
    fn test_stop_string_truncates_output() {
        let config = SamplerConfig::deterministic().with_stop_strings(["\n"]);
        let (outcome, fragments) = run(&mut backend("abc\ndef", 4096), &request("x", config));
        let outcome = outcome.unwrap();
        assert_eq!(outcome.text, "abc");
        assert_eq!(outcome.stop_reason, StopReason::StopString);
        let streamed: String = fragments.into_iter().map(|(_, t)| t).collect();
        assert_eq!(streamed, "abc");
    }

    #[test]
    fn test_template_end_marker_stops_generation() {
        let config = SamplerConfig::deterministic();
        let (outcome, _) = run(
            &mut backend("done<|im_end|><|im_start|>user", 4096),
            &request("x", config),
        );
        let outcome = outcome.unwrap();
        assert_eq!(outcome.text, "done");
        assert_eq!(outcome.stop_reason, StopReason::StopString);
    }

    #[test]
    fn test_context_limit_ends_loop() {
        let req = request("", SamplerConfig::deterministic());
        let prompt_len = format_chat(&[], "", None, "sys").chars().count() + 1;
        let n_ctx = u32::try_from(prompt_len + 3).unwrap();
        let (outcome, _) = run(&mut backend("abcdefgh", n_ctx), &req);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.stop_reason, StopReason::ContextLimit);
        assert_eq!(outcome.evaluated_tokens.len(), n_ctx as usize);
        assert_eq!(outcome.text, "abcd");
    }

    #[test]
    fn test_prompt_larger_than_window_overflows() {
        let req = request("a long prompt", SamplerConfig::deterministic());
        let (outcome, _) = run(&mut backend("x", 16), &req);
        assert!(matches!(
            outcome,
            Err(LlamaError::ContextOverflow { max: 16, .. })
        ));
    }

    #[test]
    fn test_decode_failure_propagates() {
        let mut b = backend("abc", 4096).fail_decode_at(2);
        let req = request("x", SamplerConfig::deterministic());
        let (outcome, _) = run(&mut b, &req);
        assert!(matches!(outcome, Err(LlamaError::DecodeFailure(_))));
    }

    #[test]
    fn test_checkpoint_stop_ends_early() {
        let mut b = backend("abcdefghij", 4096);
        let req = request("x", SamplerConfig::deterministic().with_max_tokens(10));
        let mut calls = 0;
        let outcome = run_generation(
            &mut b,
            &req,
            &[],
            "sys",
            &Logger::new("test"),
            |_, _| {},
            || {
                calls += 1;
                if calls > 4 {
                    Checkpoint::Stop
                } else {
                    Checkpoint::Continue
                }
            },
        )
        .unwrap();
        assert_eq!(outcome.stop_reason, StopReason::Stopped);
        assert_eq!(outcome.tokens_generated, 3);
        assert!(outcome.tokens_generated < 10);
    }

    #[test]
    fn test_follow_up_turn_reuses_cached_prefix() {
        let mut b = backend("Hi!", 4096);
        let trace = b.trace();
        let first = request("Hello", SamplerConfig::deterministic());
        let (outcome, _) = run(&mut b, &first);
        let outcome = outcome.unwrap();
        assert_eq!(outcome.metrics.reused_tokens, 0);

        let mut session = crate::session::ChatSession::new("/models/tiny.gguf", SamplerConfig::default());
        session.push(crate::session::Role::User, "Hello");
        session.push(crate::session::Role::Assistant, outcome.text.clone());
        let second = GenerationRequest {
            history: session.history,
            ..request("And you?", SamplerConfig::deterministic())
        };
        let result = run_generation(
            &mut b,
            &second,
            &outcome.evaluated_tokens,
            "sys",
            &Logger::new("test"),
            |_, _| {},
            || Checkpoint::Continue,
        )
        .unwrap();

        let first_prompt_len = b.tokenize(&format_chat(&[], "Hello", None, "sys"), true).unwrap().len();
        assert!(result.metrics.reused_tokens >= first_prompt_len);
        assert_eq!(result.text, "Hi!");

        let trace = trace.lock().unwrap();
        assert_eq!(trace.clears, 1);
        // Decodes: first prompt, three generated tokens, then the new suffix.
        assert_eq!(trace.decode_starts.len(), 8);
        assert_eq!(trace.decode_starts[4] as usize, result.metrics.reused_tokens);
    }

    #[test]
    fn test_diverged_cache_is_trimmed_to_common_prefix() {
        let mut b = backend("ok", 4096);
        let (first, _) = run(&mut b, &request("Hello", SamplerConfig::deterministic()));
        let first = first.unwrap();

        let other = request("Goodbye", SamplerConfig::deterministic());
        let outcome = run_generation(
            &mut b,
            &other,
            &first.evaluated_tokens,
            "sys",
            &Logger::new("test"),
            |_, _| {},
            || Checkpoint::Continue,
        )
        .unwrap();
        // BOS plus the system turn and the opening of the user turn.
        let shared = 1 + "<|im_start|>system\nsys<|im_end|>\n<|im_start|>user\n".chars().count();
        assert_eq!(outcome.metrics.reused_tokens, shared);
        assert_eq!(outcome.text, "ok");
    }

    #[test]
    fn test_sampler_chain_reaches_backend() {
        let mut b = backend("a", 4096);
        let trace = b.trace();
        let (outcome, _) = run(&mut b, &request("x", SamplerConfig::json()));
        outcome.unwrap();
        let chains = &trace.lock().unwrap().sampler_chains;
        assert_eq!(chains.len(), 1);
        assert!(chains[0]
            .iter()
            .any(|s| matches!(s, SamplerStage::Grammar { .. })));
    }
}
