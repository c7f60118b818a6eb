//! Worker-side executor.
//!
//! Thread design:
//! - Worker thread (named `llama-worker`): owns the [`InferenceBackend`],
//!   blocks on the command inbox, runs one command at a time.
//! - During generation the inbox is drained between tokens: `Stop` and
//!   `Dispose` end the decode loop, anything else is deferred and run in
//!   arrival order afterwards.
//!
//! Every response goes out on a tokio unbounded channel; sending never blocks
//! the worker.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tokio::sync::mpsc::UnboundedSender;

use crate::backend::{InferenceBackend, Token};
use crate::error::{LlamaError, Result};
use crate::generation::{run_generation, Checkpoint};
use crate::logger::Logger;
use crate::protocol::{
    Command, GenerationRequest, RequestId, Response, StopReason, SuccessPayload, WorkerStatus,
};
use crate::{log_debug, log_error, log_info, log_warn};

/// Whether the worker loop keeps running after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Spawn the worker thread around `backend`.
///
/// Returns the command inbox and the thread handle. The thread exits after
/// a `Dispose` command or once every inbox sender is dropped.
pub fn spawn_worker<B: InferenceBackend>(
    backend: B,
    default_system_prompt: String,
    responses: UnboundedSender<Response>,
    logger: Logger,
) -> Result<(Sender<Command>, JoinHandle<()>)> {
    let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
    let spawn_logger = logger.clone();

    let handle = thread::Builder::new()
        .name("llama-worker".to_string())
        .spawn(move || {
            let mut worker = Worker {
                backend,
                status: WorkerStatus::Uninitialized,
                inbox: inbox_rx,
                deferred: VecDeque::new(),
                out: responses,
                default_system_prompt,
                evaluated: Vec::new(),
                logger,
            };
            worker.run();
        })
        .map_err(|e| {
            log_error!(spawn_logger, "Failed to spawn worker thread: {}", e);
            LlamaError::WorkerUnavailable
        })?;

    Ok((inbox_tx, handle))
}

struct Worker<B> {
    backend: B,
    status: WorkerStatus,
    inbox: Receiver<Command>,
    /// Commands that arrived during a generation.
    deferred: VecDeque<Command>,
    out: UnboundedSender<Response>,
    default_system_prompt: String,
    /// Tokens currently held in the KV cache, saved alongside session state.
    evaluated: Vec<Token>,
    logger: Logger,
}

impl<B: InferenceBackend> Worker<B> {
    fn run(&mut self) {
        log_info!(self.logger, "Ready, waiting for commands...");

        loop {
            let command = match self.deferred.pop_front() {
                Some(c) => c,
                None => match self.inbox.recv() {
                    Ok(c) => c,
                    Err(_) => {
                        log_info!(self.logger, "Command channel disconnected, shutting down");
                        break;
                    }
                },
            };

            if self.handle(command) == Flow::Exit {
                break;
            }
        }

        log_info!(self.logger, "Exiting");
    }

    fn send(&self, response: Response) {
        send_response(&self.out, &self.logger, response);
    }

    fn set_status(&mut self, status: WorkerStatus, id: Option<RequestId>) {
        self.status = status;
        self.send(Response::Status { id, status });
    }

    /// Send `Success` or `Error` for `id` depending on `result`.
    fn reply(&self, id: RequestId, result: Result<SuccessPayload>) {
        match result {
            Ok(payload) => self.send(Response::ok(id, payload)),
            Err(e) => {
                log_warn!(self.logger, "[{}] Command failed: {}", id.short(), e);
                self.send(Response::error(id, e));
            }
        }
    }

    fn handle(&mut self, command: Command) -> Flow {
        log_debug!(
            self.logger,
            "[{}] Handling {} (status {:?})",
            command.id().map_or("-", RequestId::short),
            command.name(),
            self.status
        );

        match command {
            Command::InitBackend { id } => match self.backend.init() {
                Ok(()) => {
                    self.set_status(WorkerStatus::Ready, Some(id.clone()));
                    self.reply(id, Ok(SuccessPayload::BackendReady));
                }
                Err(e) => {
                    log_error!(self.logger, "Backend init failed: {}", e);
                    self.set_status(WorkerStatus::Error, Some(id.clone()));
                    self.reply(id, Err(e));
                }
            },

            Command::LoadModel { id, path, config } => {
                log_info!(self.logger, "Loading model: {}", path);
                self.evaluated.clear();
                match self.backend.load_model(&path, &config) {
                    Ok(info) => {
                        log_info!(
                            self.logger,
                            "Model loaded: n_ctx_train={}, n_vocab={}",
                            info.n_ctx_train,
                            info.n_vocab
                        );
                        self.reply(id, Ok(SuccessPayload::ModelLoaded { info }));
                    }
                    Err(e) => {
                        log_error!(self.logger, "Model load failed: {}", e);
                        self.set_status(WorkerStatus::Error, Some(id.clone()));
                        self.reply(id, Err(e));
                    }
                }
            }

            Command::CreateContext { id, config } => {
                self.evaluated.clear();
                let result = config
                    .validate()
                    .and_then(|()| self.backend.create_context(&config));
                match result {
                    Ok(info) => {
                        self.set_status(WorkerStatus::Ready, Some(id.clone()));
                        self.reply(id, Ok(SuccessPayload::ContextCreated { info }));
                    }
                    Err(e) => self.reply(id, Err(e)),
                }
            }

            Command::Generate { id, request } => return self.generate(id, &request, false),
            Command::GenerateStream { id, request } => return self.generate(id, &request, true),

            Command::Stop { target } => {
                log_debug!(
                    self.logger,
                    "Stop ({}) received while idle; nothing to stop",
                    target.as_ref().map_or("any", RequestId::short)
                );
            }

            Command::Clear { id } => {
                let result = self.backend.clear().map(|()| SuccessPayload::Cleared);
                self.evaluated.clear();
                self.reply(id, result);
            }

            Command::Tokenize { id, text, add_bos } => {
                let result = self
                    .backend
                    .tokenize(&text, add_bos)
                    .map(|tokens| SuccessPayload::Tokens { tokens });
                self.reply(id, result);
            }

            Command::Detokenize { id, tokens } => {
                let result = self
                    .backend
                    .detokenize(&tokens)
                    .map(|text| SuccessPayload::Text { text });
                self.reply(id, result);
            }

            Command::Embed { id, text } => {
                // Embedding evaluates into the same context.
                self.evaluated.clear();
                let result = self
                    .backend
                    .embed(&text)
                    .map(|values| SuccessPayload::Embedding { values });
                self.reply(id, result);
            }

            Command::SaveState { id, path } => {
                let result = self
                    .backend
                    .save_state(&path, &self.evaluated)
                    .map(|()| SuccessPayload::StateSaved {
                        tokens: self.evaluated.clone(),
                    });
                self.reply(id, result);
            }

            Command::LoadState { id, path } => {
                let result = self
                    .backend
                    .context_size()
                    .ok_or(LlamaError::ContextNotCreated)
                    .and_then(|n_ctx| self.backend.load_state(&path, n_ctx as usize));
                match result {
                    Ok(tokens) => {
                        self.evaluated.clone_from(&tokens);
                        self.reply(id, Ok(SuccessPayload::StateLoaded { tokens }));
                    }
                    Err(e) => {
                        self.evaluated.clear();
                        self.reply(id, Err(e));
                    }
                }
            }

            Command::Dispose { id } => {
                if !self.deferred.is_empty() {
                    log_info!(
                        self.logger,
                        "Dispose requested; dropping {} queued commands",
                        self.deferred.len()
                    );
                    self.deferred.clear();
                }
                log_info!(self.logger, "Dispose requested");
                self.reply(id, Ok(SuccessPayload::Disposed));
                return Flow::Exit;
            }
        }

        Flow::Continue
    }

    fn generate(&mut self, id: RequestId, request: &GenerationRequest, stream: bool) -> Flow {
        log_info!(
            self.logger,
            "[{}] Starting generation: stream={}, prompt_len={}",
            id.short(),
            stream,
            request.prompt.len()
        );
        self.set_status(WorkerStatus::Generating, Some(id.clone()));

        let Self {
            backend,
            inbox,
            deferred,
            out,
            default_system_prompt,
            evaluated,
            logger,
            ..
        } = self;

        let mut stop_requested = false;
        let checkpoint = || {
            drain_inbox(inbox, deferred, out, &id, &mut stop_requested, logger);
            if stop_requested {
                Checkpoint::Stop
            } else {
                Checkpoint::Continue
            }
        };
        let on_text = |index: usize, text: &str| {
            if stream {
                send_response(
                    out,
                    logger,
                    Response::Token {
                        id: id.clone(),
                        text: text.to_string(),
                        index,
                    },
                );
            }
        };

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_generation(
                backend,
                request,
                evaluated,
                default_system_prompt,
                logger,
                on_text,
                checkpoint,
            )
        }));

        match result {
            Ok(Ok(outcome)) => {
                self.evaluated = outcome.evaluated_tokens;
                self.send(Response::Metrics {
                    id: id.clone(),
                    metrics: outcome.metrics,
                });
                self.send(Response::Complete {
                    id,
                    text: outcome.text,
                    tokens_generated: outcome.tokens_generated,
                    stop_reason: outcome.stop_reason,
                });
            }
            Ok(Err(e)) => {
                log_error!(self.logger, "[{}] Generation failed: {}", id.short(), e);
                self.evaluated.clear();
                self.send(Response::error(id, e));
            }
            Err(panic_info) => {
                let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic_info.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic in generation".to_string()
                };
                log_error!(self.logger, "[{}] Generation panicked: {}", id.short(), msg);
                self.evaluated.clear();
                self.send(Response::error(
                    id,
                    LlamaError::DecodeFailure(format!("generation panicked: {msg}")),
                ));
            }
        }

        self.set_status(WorkerStatus::Ready, None);
        Flow::Continue
    }
}

fn send_response(out: &UnboundedSender<Response>, logger: &Logger, response: Response) {
    if out.send(response).is_err() {
        log_debug!(logger, "Response channel closed; dropping response");
    }
}

/// Non-blocking inbox drain run at every token checkpoint.
fn drain_inbox(
    inbox: &Receiver<Command>,
    deferred: &mut VecDeque<Command>,
    out: &UnboundedSender<Response>,
    current: &RequestId,
    stop_requested: &mut bool,
    logger: &Logger,
) {
    loop {
        match inbox.try_recv() {
            Ok(Command::Stop { target }) => match target {
                None => *stop_requested = true,
                Some(t) if &t == current => *stop_requested = true,
                Some(t) => cancel_deferred(deferred, out, &t, logger),
            },
            Ok(dispose @ Command::Dispose { .. }) => {
                *stop_requested = true;
                deferred.push_front(dispose);
            }
            Ok(other) => {
                log_debug!(logger, "Deferring {} until generation ends", other.name());
                deferred.push_back(other);
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                *stop_requested = true;
                break;
            }
        }
    }
}

/// Drop a queued generation that was stopped before it started.
fn cancel_deferred(
    deferred: &mut VecDeque<Command>,
    out: &UnboundedSender<Response>,
    target: &RequestId,
    logger: &Logger,
) {
    let position = deferred.iter().position(|c| {
        matches!(c, Command::Generate { id, .. } | Command::GenerateStream { id, .. } if id == target)
    });
    match position {
        Some(i) => {
            deferred.remove(i);
            log_info!(logger, "[{}] Stopped before it started", target.short());
            send_response(
                out,
                logger,
                Response::Complete {
                    id: target.clone(),
                    text: String::new(),
                    tokens_generated: 0,
                    stop_reason: StopReason::Stopped,
                },
            );
        }
        None => log_debug!(logger, "Stale stop for {} ignored", target.short()),
    }
}
