//! Control-side coordinator.
//!
//! Turns async method calls into [`Command`]s for the worker thread and
//! routes the worker's [`Response`]s back to the waiting callers through a
//! pending-request table keyed by [`RequestId`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crossbeam_channel::Sender;
use futures_util::Stream;
use tokio::sync::{mpsc, oneshot, watch, Mutex as TokioMutex};

use crate::backend::{ContextInfo, InferenceBackend, ModelInfo, Token};
use crate::config::{ContextConfig, ModelConfig, SamplerConfig, WorkerConfig};
use crate::error::{LlamaError, Result};
use crate::logger::Logger;
use crate::protocol::{
    Command, Completion, GenerationMetrics, GenerationRequest, RequestId, Response,
    SuccessPayload, WorkerStatus,
};
use crate::session::{ChatMessage, ChatSession, SessionStore};
use crate::worker::spawn_worker;
use crate::{log_debug, log_info, log_warn};

/// What a call needs from the worker before its command may be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    Started,
    Backend,
    Model,
    Context,
}

/// Event delivered to a [`TokenStream`].
#[derive(Debug)]
enum StreamEvent {
    Token(String),
    Done(Completion),
    Failed(LlamaError),
}

/// A caller waiting on the worker.
enum Pending {
    /// Single `Success` / `Error` reply.
    Reply(oneshot::Sender<Result<SuccessPayload>>),
    /// Blocking generation; resolved on `Complete` or `Error`.
    Completion {
        tx: oneshot::Sender<Result<Completion>>,
        metrics: Option<GenerationMetrics>,
    },
    /// Streaming generation.
    Stream {
        sink: mpsc::UnboundedSender<StreamEvent>,
        metrics: Option<GenerationMetrics>,
    },
}

/// State shared with the response dispatcher task.
struct Dispatch {
    pending: TokioMutex<HashMap<RequestId, Pending>>,
    status: watch::Sender<WorkerStatus>,
    logger: Logger,
}

impl Dispatch {
    async fn register(&self, id: RequestId, pending: Pending) {
        self.pending.lock().await.insert(id, pending);
    }

    async fn forget(&self, id: &RequestId) {
        self.pending.lock().await.remove(id);
    }

    async fn dispatch(&self, response: Response) {
        match response {
            Response::Status { id, status } => {
                log_debug!(
                    self.logger,
                    "Worker status {:?} ({})",
                    status,
                    id.as_ref().map_or("-", RequestId::short)
                );
                self.status.send_replace(status);
            }

            Response::Token { id, text, .. } => {
                let pending = self.pending.lock().await;
                match pending.get(&id) {
                    Some(Pending::Stream { sink, .. }) => {
                        let _ = sink.send(StreamEvent::Token(text));
                    }
                    Some(_) => {}
                    None => self.unmatched("Token", &id),
                }
            }

            Response::Metrics { id, metrics } => {
                let mut pending = self.pending.lock().await;
                match pending.get_mut(&id) {
                    Some(
                        Pending::Completion { metrics: slot, .. }
                        | Pending::Stream { metrics: slot, .. },
                    ) => *slot = Some(metrics),
                    Some(Pending::Reply(_)) => {
                        log_warn!(self.logger, "Metrics for non-generation request {}", id.short());
                    }
                    None => self.unmatched("Metrics", &id),
                }
            }

            Response::Complete {
                id,
                text,
                tokens_generated,
                stop_reason,
            } => {
                let entry = self.pending.lock().await.remove(&id);
                let completion = |metrics| Completion {
                    request_id: id.clone(),
                    text,
                    tokens_generated,
                    stop_reason,
                    metrics,
                };
                match entry {
                    Some(Pending::Completion { tx, metrics }) => {
                        let _ = tx.send(Ok(completion(metrics)));
                    }
                    Some(Pending::Stream { sink, metrics }) => {
                        let _ = sink.send(StreamEvent::Done(completion(metrics)));
                    }
                    Some(Pending::Reply(tx)) => {
                        log_warn!(self.logger, "Complete for non-generation request {}", id.short());
                        let _ = tx.send(Err(LlamaError::WorkerUnavailable));
                    }
                    None => self.unmatched("Complete", &id),
                }
            }

            Response::Success { id, payload } => {
                let entry = self.pending.lock().await.remove(&id);
                match entry {
                    Some(Pending::Reply(tx)) => {
                        let _ = tx.send(Ok(payload));
                    }
                    Some(_) => {
                        log_warn!(self.logger, "Success for generation request {}", id.short());
                    }
                    None if payload == SuccessPayload::Disposed => {
                        log_debug!(self.logger, "Worker acknowledged dispose");
                    }
                    None => self.unmatched("Success", &id),
                }
            }

            Response::Error { id, error } => {
                let entry = self.pending.lock().await.remove(&id);
                match entry {
                    Some(Pending::Reply(tx)) => {
                        let _ = tx.send(Err(error));
                    }
                    Some(Pending::Completion { tx, .. }) => {
                        let _ = tx.send(Err(error));
                    }
                    Some(Pending::Stream { sink, .. }) => {
                        let _ = sink.send(StreamEvent::Failed(error));
                    }
                    None => self.unmatched("Error", &id),
                }
            }
        }
    }

    fn unmatched(&self, kind: &str, id: &RequestId) {
        log_warn!(self.logger, "No pending request for {} response id={}", kind, id);
    }
}

/// Task that reads responses from the worker and dispatches them.
async fn dispatcher_task(mut responses: mpsc::UnboundedReceiver<Response>, dispatch: Arc<Dispatch>) {
    while let Some(response) = responses.recv().await {
        dispatch.dispatch(response).await;
    }
    log_debug!(dispatch.logger, "Response dispatcher exiting");
}

/// Mutable coordinator bookkeeping.
#[derive(Default)]
struct State {
    inbox: Option<Sender<Command>>,
    worker: Option<std::thread::JoinHandle<()>>,
    dispatcher: Option<tokio::task::JoinHandle<()>>,
    disposed: bool,
    backend_ready: bool,
    model: Option<ModelInfo>,
    context: Option<ContextInfo>,
}

/// Async handle to a worker thread that owns an [`InferenceBackend`].
pub struct Coordinator<B> {
    /// Moved into the worker thread by `start`.
    backend: TokioMutex<Option<B>>,
    config: WorkerConfig,
    state: TokioMutex<State>,
    dispatch: Arc<Dispatch>,
    status_rx: watch::Receiver<WorkerStatus>,
    logger: Logger,
}

impl<B> std::fmt::Debug for Coordinator<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("status", &*self.status_rx.borrow())
            .field("logger", &self.logger)
            .finish_non_exhaustive()
    }
}

impl<B: InferenceBackend> Coordinator<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self::with_logger(backend, config, Logger::new("coordinator"))
    }

    pub fn with_logger(backend: B, config: WorkerConfig, logger: Logger) -> Self {
        let (status_tx, status_rx) = watch::channel(WorkerStatus::Uninitialized);
        Self {
            backend: TokioMutex::new(Some(backend)),
            config,
            state: TokioMutex::new(State::default()),
            dispatch: Arc::new(Dispatch {
                pending: TokioMutex::new(HashMap::new()),
                status: status_tx,
                logger: logger.clone(),
            }),
            status_rx,
            logger,
        }
    }

    /// Spawn the worker thread and the response dispatcher.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(LlamaError::Disposed);
        }
        if state.inbox.is_some() {
            return Err(LlamaError::AlreadyStarted);
        }
        let backend = self
            .backend
            .lock()
            .await
            .take()
            .ok_or(LlamaError::AlreadyStarted)?;

        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (inbox, worker) = spawn_worker(
            backend,
            self.config.default_system_prompt.clone(),
            response_tx,
            Logger::new("worker"),
        )?;
        let dispatcher = tokio::spawn(dispatcher_task(response_rx, self.dispatch.clone()));

        state.inbox = Some(inbox);
        state.worker = Some(worker);
        state.dispatcher = Some(dispatcher);
        log_info!(self.logger, "Worker started");
        Ok(())
    }

    /// Last status reported by the worker.
    pub fn status(&self) -> WorkerStatus {
        *self.status_rx.borrow()
    }

    /// Metadata of the loaded model, if any.
    pub async fn model_info(&self) -> Option<ModelInfo> {
        self.state.lock().await.model.clone()
    }

    /// Initialize the native backend.
    ///
    /// Returns `Ok(false)` if the worker does not answer within the ready
    /// timeout.
    pub async fn init_backend(&self) -> Result<bool> {
        let result = self
            .call(Requirement::Started, self.config.ready_timeout(), |id| {
                Command::InitBackend { id }
            })
            .await;
        match result {
            Ok(SuccessPayload::BackendReady) => {
                self.state.lock().await.backend_ready = true;
                Ok(true)
            }
            Ok(other) => Err(self.unexpected("InitBackend", &other)),
            Err(LlamaError::Timeout(_)) => {
                log_warn!(self.logger, "Backend did not become ready in time");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Load a GGUF model, replacing any loaded model and context.
    pub async fn load_model(&self, path: &str, config: ModelConfig) -> Result<ModelInfo> {
        let path = path.to_string();
        let result = self
            .call(Requirement::Backend, self.config.command_timeout(), |id| {
                Command::LoadModel { id, path, config }
            })
            .await;

        let mut state = self.state.lock().await;
        state.context = None;
        match result {
            Ok(SuccessPayload::ModelLoaded { info }) => {
                state.model = Some(info.clone());
                Ok(info)
            }
            Ok(other) => {
                state.model = None;
                Err(self.unexpected("LoadModel", &other))
            }
            Err(e) => {
                state.model = None;
                Err(e)
            }
        }
    }

    /// Create the inference context for the loaded model.
    pub async fn create_context(&self, config: ContextConfig) -> Result<ContextInfo> {
        config.validate()?;
        let result = self
            .call(Requirement::Model, self.config.ready_timeout(), |id| {
                Command::CreateContext { id, config }
            })
            .await?;
        match result {
            SuccessPayload::ContextCreated { info } => {
                self.state.lock().await.context = Some(info.clone());
                Ok(info)
            }
            other => Err(self.unexpected("CreateContext", &other)),
        }
    }

    /// Generate a full completion.
    ///
    /// Resolves to `Ok(None)` when the coordinator is disposed before the
    /// worker finishes.
    pub async fn generate(
        &self,
        prompt: &str,
        config: SamplerConfig,
        system_prompt: Option<&str>,
    ) -> Result<Option<Completion>> {
        config.validate()?;
        let inbox = self.checked_inbox(Requirement::Context).await?;

        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.dispatch
            .register(id.clone(), Pending::Completion { tx, metrics: None })
            .await;

        let command = Command::Generate {
            id: id.clone(),
            request: request(prompt, config, system_prompt, &[]),
        };
        self.send(&inbox, &id, command).await?;

        match rx.await {
            Ok(result) => result.map(Some),
            Err(_) => {
                log_info!(self.logger, "[{}] Generation cancelled by dispose", id.short());
                Ok(None)
            }
        }
    }

    /// Generate, yielding visible text fragments as they are produced.
    ///
    /// Dropping the stream before it ends stops the generation.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        config: SamplerConfig,
        system_prompt: Option<&str>,
    ) -> Result<TokenStream> {
        self.generate_stream_with_history(prompt, config, system_prompt, &[])
            .await
    }

    /// Like [`generate_stream`](Self::generate_stream), with earlier turns of
    /// the conversation rendered ahead of `prompt`.
    ///
    /// Whatever prefix of the rendered prompt is still in the KV cache (from
    /// the previous turn or a loaded session) is not decoded again.
    pub async fn generate_stream_with_history(
        &self,
        prompt: &str,
        config: SamplerConfig,
        system_prompt: Option<&str>,
        history: &[ChatMessage],
    ) -> Result<TokenStream> {
        config.validate()?;
        let inbox = self.checked_inbox(Requirement::Context).await?;

        let id = RequestId::new();
        let (sink, events) = mpsc::unbounded_channel();
        self.dispatch
            .register(id.clone(), Pending::Stream { sink, metrics: None })
            .await;

        let command = Command::GenerateStream {
            id: id.clone(),
            request: request(prompt, config, system_prompt, history),
        };
        self.send(&inbox, &id, command).await?;

        Ok(TokenStream {
            request_id: id,
            events,
            completion: None,
            finished: false,
            inbox,
        })
    }

    /// Ask the worker to stop a generation at its next token checkpoint.
    ///
    /// `None` stops whatever is running. Advisory; no reply is awaited.
    pub async fn stop_generation(&self, request_id: Option<RequestId>) -> Result<()> {
        let inbox = self.checked_inbox(Requirement::Started).await?;
        inbox
            .send(Command::Stop { target: request_id })
            .map_err(|_| LlamaError::WorkerUnavailable)
    }

    /// Clear the KV cache.
    pub async fn clear_context(&self) -> Result<()> {
        match self
            .call(Requirement::Context, self.config.command_timeout(), |id| {
                Command::Clear { id }
            })
            .await?
        {
            SuccessPayload::Cleared => Ok(()),
            other => Err(self.unexpected("Clear", &other)),
        }
    }

    pub async fn tokenize(&self, text: &str, add_bos: bool) -> Result<Vec<Token>> {
        let text = text.to_string();
        match self
            .call(Requirement::Model, self.config.command_timeout(), |id| {
                Command::Tokenize { id, text, add_bos }
            })
            .await?
        {
            SuccessPayload::Tokens { tokens } => Ok(tokens),
            other => Err(self.unexpected("Tokenize", &other)),
        }
    }

    pub async fn detokenize(&self, tokens: Vec<Token>) -> Result<String> {
        match self
            .call(Requirement::Model, self.config.command_timeout(), |id| {
                Command::Detokenize { id, tokens }
            })
            .await?
        {
            SuccessPayload::Text { text } => Ok(text),
            other => Err(self.unexpected("Detokenize", &other)),
        }
    }

    /// Sequence embedding; the context must have been created with
    /// `embeddings: true`.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_string();
        match self
            .call(Requirement::Context, self.config.command_timeout(), |id| {
                Command::Embed { id, text }
            })
            .await?
        {
            SuccessPayload::Embedding { values } => Ok(values),
            other => Err(self.unexpected("Embed", &other)),
        }
    }

    /// Save the context state next to the session's metadata.
    pub async fn save_session(&self, store: &SessionStore, session: &mut ChatSession) -> Result<()> {
        let model_path = self
            .state
            .lock()
            .await
            .model
            .as_ref()
            .map(|m| m.path.clone())
            .ok_or(LlamaError::ModelNotLoaded)?;
        let (_, state_path) = store.paths(&session.id)?;

        match self
            .call(Requirement::Context, self.config.command_timeout(), |id| {
                Command::SaveState {
                    id,
                    path: state_path,
                }
            })
            .await?
        {
            SuccessPayload::StateSaved { tokens } => {
                session.model_path = model_path;
                session.tokens = tokens;
                session.updated_at = chrono::Utc::now();
                store.write_metadata(session)?;
                log_info!(
                    self.logger,
                    "Saved session {} ({} tokens)",
                    session.id,
                    session.tokens.len()
                );
                Ok(())
            }
            other => Err(self.unexpected("SaveState", &other)),
        }
    }

    /// Restore a saved session into the context.
    ///
    /// Fails with `SessionFailure` if it was saved with a different model.
    pub async fn load_session(&self, store: &SessionStore, id: &str) -> Result<ChatSession> {
        let mut session = store.read_metadata(id)?;
        let model_path = self
            .state
            .lock()
            .await
            .model
            .as_ref()
            .map(|m| m.path.clone())
            .ok_or(LlamaError::ModelNotLoaded)?;
        session.ensure_model(&model_path)?;
        let (_, state_path) = store.paths(id)?;

        match self
            .call(Requirement::Context, self.config.command_timeout(), |id| {
                Command::LoadState {
                    id,
                    path: state_path,
                }
            })
            .await?
        {
            SuccessPayload::StateLoaded { tokens } => {
                session.tokens = tokens;
                Ok(session)
            }
            other => Err(self.unexpected("LoadState", &other)),
        }
    }

    /// Shut the worker down.
    ///
    /// Pending generations resolve to `Ok(None)`, open streams end, and the
    /// worker thread is joined within the configured timeout. Every later
    /// call fails with `Disposed`.
    pub async fn dispose(&self) -> Result<()> {
        let (inbox, worker, dispatcher) = {
            let mut state = self.state.lock().await;
            if state.disposed {
                return Err(LlamaError::Disposed);
            }
            state.disposed = true;
            state.backend_ready = false;
            state.model = None;
            state.context = None;
            (state.inbox.take(), state.worker.take(), state.dispatcher.take())
        };

        {
            let mut pending = self.dispatch.pending.lock().await;
            if !pending.is_empty() {
                log_info!(self.logger, "Cancelling {} pending requests", pending.len());
            }
            // Dropping the senders resolves every waiter.
            pending.clear();
        }

        if let Some(inbox) = inbox {
            if inbox.send(Command::Dispose { id: RequestId::new() }).is_err() {
                log_debug!(self.logger, "Worker inbox already closed");
            }
        }

        if let Some(handle) = worker {
            let join = tokio::task::spawn_blocking(move || handle.join());
            match tokio::time::timeout(self.config.dispose_join_timeout(), join).await {
                Ok(Ok(Ok(()))) => log_info!(self.logger, "Worker thread joined"),
                Ok(Ok(Err(_))) => log_warn!(self.logger, "Worker thread panicked"),
                Ok(Err(e)) => log_warn!(self.logger, "Join task failed: {}", e),
                Err(_) => {
                    log_warn!(
                        self.logger,
                        "Worker did not exit within {:?}; detaching",
                        self.config.dispose_join_timeout()
                    );
                    if let Some(dispatcher) = &dispatcher {
                        dispatcher.abort();
                    }
                }
            }
        }
        Ok(())
    }

    async fn checked_inbox(&self, requirement: Requirement) -> Result<Sender<Command>> {
        let state = self.state.lock().await;
        if state.disposed {
            return Err(LlamaError::Disposed);
        }
        let inbox = state.inbox.clone().ok_or(LlamaError::NotInitialized)?;
        if requirement == Requirement::Started {
            return Ok(inbox);
        }
        if !state.backend_ready {
            return Err(LlamaError::NotInitialized);
        }
        if requirement == Requirement::Backend {
            return Ok(inbox);
        }
        if state.model.is_none() {
            return Err(LlamaError::ModelNotLoaded);
        }
        if requirement == Requirement::Context && state.context.is_none() {
            return Err(LlamaError::ContextNotCreated);
        }
        Ok(inbox)
    }

    async fn send(&self, inbox: &Sender<Command>, id: &RequestId, command: Command) -> Result<()> {
        log_debug!(self.logger, "[{}] Sending {}", id.short(), command.name());
        if inbox.send(command).is_err() {
            self.dispatch.forget(id).await;
            return Err(LlamaError::WorkerUnavailable);
        }
        Ok(())
    }

    /// Send a command and wait for its `Success` / `Error` reply.
    async fn call(
        &self,
        requirement: Requirement,
        timeout: Duration,
        make: impl FnOnce(RequestId) -> Command,
    ) -> Result<SuccessPayload> {
        let inbox = self.checked_inbox(requirement).await?;
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        self.dispatch.register(id.clone(), Pending::Reply(tx)).await;

        let command = make(id.clone());
        let name = command.name();
        self.send(&inbox, &id, command).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LlamaError::Disposed),
            Err(_) => {
                self.dispatch.forget(&id).await;
                Err(LlamaError::Timeout(name.to_string()))
            }
        }
    }

    fn unexpected(&self, command: &str, payload: &SuccessPayload) -> LlamaError {
        log_warn!(self.logger, "Unexpected reply to {}: {:?}", command, payload);
        LlamaError::WorkerUnavailable
    }
}

fn request(
    prompt: &str,
    config: SamplerConfig,
    system_prompt: Option<&str>,
    history: &[ChatMessage],
) -> GenerationRequest {
    GenerationRequest {
        prompt: prompt.to_string(),
        system_prompt: system_prompt.map(str::to_string),
        history: history.to_vec(),
        config,
    }
}

/// Visible text of a streaming generation.
///
/// Yields `Ok(fragment)` per released fragment, then ends. A worker error is
/// yielded once as `Err` before the end; a dispose ends the stream without
/// an error. Dropping an unfinished stream sends a targeted stop.
#[derive(Debug)]
pub struct TokenStream {
    request_id: RequestId,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    completion: Option<Completion>,
    finished: bool,
    inbox: Sender<Command>,
}

impl TokenStream {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Final result, available once the stream ended normally.
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    pub fn into_completion(mut self) -> Option<Completion> {
        self.completion.take()
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The worker ignores a stop for a request it is no longer running.
        let _ = self.inbox.send(Command::Stop {
            target: Some(self.request_id.clone()),
        });
    }
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Token(text))) => Poll::Ready(Some(Ok(text))),
            Poll::Ready(Some(StreamEvent::Done(completion))) => {
                this.completion = Some(completion);
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Failed(error))) => {
                this.finished = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::protocol::StopReason;
    use crate::session::Role;

    async fn ready(backend: MockBackend) -> Coordinator<MockBackend> {
        ready_with(backend, ContextConfig::default()).await
    }

    async fn ready_with(backend: MockBackend, context: ContextConfig) -> Coordinator<MockBackend> {
        let coordinator = Coordinator::new(backend, WorkerConfig::default());
        coordinator.start().await.unwrap();
        assert!(coordinator.init_backend().await.unwrap());
        coordinator
            .load_model("/models/tiny.gguf", ModelConfig::default())
            .await
            .unwrap();
        coordinator.create_context(context).await.unwrap();
        coordinator
    }

    fn greedy(max_tokens: u32) -> SamplerConfig {
        SamplerConfig::deterministic().with_max_tokens(max_tokens)
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let coordinator = Coordinator::new(MockBackend::new(""), WorkerConfig::default());
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.start().await, Err(LlamaError::AlreadyStarted));
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_validate_readiness_before_sending() {
        let coordinator = Coordinator::new(MockBackend::new("x"), WorkerConfig::default());
        assert_eq!(
            coordinator.generate("hi", greedy(4), None).await,
            Err(LlamaError::NotInitialized)
        );
        coordinator.start().await.unwrap();
        assert_eq!(
            coordinator.load_model("/m.gguf", ModelConfig::default()).await,
            Err(LlamaError::NotInitialized)
        );
        assert!(coordinator.init_backend().await.unwrap());
        assert_eq!(coordinator.status(), WorkerStatus::Ready);
        assert_eq!(
            coordinator.tokenize("hi", true).await,
            Err(LlamaError::ModelNotLoaded)
        );
        coordinator
            .load_model("/models/tiny.gguf", ModelConfig::default())
            .await
            .unwrap();
        assert_eq!(
            coordinator.generate("hi", greedy(4), None).await,
            Err(LlamaError::ContextNotCreated)
        );
        coordinator.create_context(ContextConfig::default()).await.unwrap();

        let bad = SamplerConfig {
            top_p: 0.0,
            ..SamplerConfig::default()
        };
        assert!(matches!(
            coordinator.generate("hi", bad, None).await,
            Err(LlamaError::SamplingParameterInvalid(_))
        ));
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_generate_is_deterministic() {
        let coordinator = ready(MockBackend::new("Hello world")).await;
        let a = coordinator
            .generate("Say hi", greedy(32), None)
            .await
            .unwrap()
            .unwrap();
        let b = coordinator
            .generate("Say hi", greedy(32), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.text, "Hello world");
        assert_eq!(a.text, b.text);
        assert_eq!(a.stop_reason, StopReason::Eog);
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.metrics.as_ref().map(|m| m.tokens_generated), Some(11));
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_string_truncates_completion() {
        let coordinator = ready(MockBackend::new("abc\ndef")).await;
        let config = greedy(32).with_stop_strings(["\n"]);
        let c = coordinator.generate("x", config, None).await.unwrap().unwrap();
        assert_eq!(c.text, "abc");
        assert_eq!(c.stop_reason, StopReason::StopString);
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_matches_completion() {
        let coordinator = ready(MockBackend::new("streamed text")).await;
        let mut stream = coordinator
            .generate_stream("x", greedy(64), Some("Be terse."))
            .await
            .unwrap();
        let mut text = String::new();
        while let Some(piece) = stream.next().await {
            text.push_str(&piece.unwrap());
        }
        let completion = stream.completion().cloned().unwrap();
        assert_eq!(text, "streamed text");
        assert_eq!(completion.text, text);
        assert_eq!(&completion.request_id, stream.request_id());
        assert!(stream.next().await.is_none());
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_generation_ends_stream_early() {
        let script = "a".repeat(200);
        let backend = MockBackend::new(&script).with_step_delay(Duration::from_millis(2));
        let coordinator = ready(backend).await;
        let mut stream = coordinator
            .generate_stream("x", greedy(200), None)
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, "a");
        coordinator
            .stop_generation(Some(stream.request_id().clone()))
            .await
            .unwrap();
        while let Some(piece) = stream.next().await {
            piece.unwrap();
        }

        let completion = stream.into_completion().unwrap();
        assert_eq!(completion.stop_reason, StopReason::Stopped);
        assert!(completion.tokens_generated < 200);
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_is_yielded_once() {
        let coordinator = ready(MockBackend::new("abc").fail_decode_at(2)).await;
        let mut stream = coordinator
            .generate_stream("x", greedy(8), None)
            .await
            .unwrap();
        let mut errors = 0;
        while let Some(item) = stream.next().await {
            if let Err(e) = item {
                assert!(matches!(e, LlamaError::DecodeFailure(_)));
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
        assert!(stream.completion().is_none());

        // Worker is usable again.
        let c = coordinator.generate("x", greedy(8), None).await.unwrap();
        assert!(c.is_some());
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispose_during_stream_ends_it_silently() {
        let script = "b".repeat(500);
        let backend = MockBackend::new(&script).with_step_delay(Duration::from_millis(2));
        let coordinator = ready(backend).await;
        let mut stream = coordinator
            .generate_stream("x", greedy(500), None)
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());

        coordinator.dispose().await.unwrap();
        let mut rest = 0;
        while let Some(item) = stream.next().await {
            assert!(item.is_ok());
            rest += 1;
        }
        assert!(rest < 500);
        assert!(stream.completion().is_none());

        assert_eq!(
            coordinator.generate("x", greedy(4), None).await,
            Err(LlamaError::Disposed)
        );
        assert_eq!(coordinator.dispose().await, Err(LlamaError::Disposed));
        assert_eq!(coordinator.start().await, Err(LlamaError::Disposed));
    }

    #[tokio::test]
    async fn test_dispose_resolves_pending_generate_to_none() {
        let script = "c".repeat(500);
        let backend = MockBackend::new(&script).with_step_delay(Duration::from_millis(2));
        let coordinator = Arc::new(ready(backend).await);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.generate("x", greedy(500), None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.dispose().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Ok(None));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_generation() {
        let script = "d".repeat(500);
        let backend = MockBackend::new(&script).with_step_delay(Duration::from_millis(5));
        let trace = backend.trace();
        let coordinator = ready(backend).await;
        let mut stream = coordinator
            .generate_stream("x", greedy(500), None)
            .await
            .unwrap();
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);

        // Unstopped, the first generation would hold the worker for 2.5s.
        let next = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.generate("y", greedy(3), None),
        )
        .await
        .expect("worker still busy with the dropped stream");
        assert_eq!(next.unwrap().unwrap().text, "ddd");
        assert!(trace.lock().unwrap().decode_starts.len() < 100);
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let coordinator = ready(MockBackend::new("same")).await;
        let (a, b, tokens) = tokio::join!(
            coordinator.generate("one", greedy(8), None),
            coordinator.generate("two", greedy(8), None),
            coordinator.tokenize("hey", false),
        );
        let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.text, "same");
        assert_eq!(b.text, "same");
        assert_eq!(tokens.unwrap().len(), 3);
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_load_model_error_reply() {
        let coordinator = Coordinator::new(MockBackend::new(""), WorkerConfig::default());
        coordinator.start().await.unwrap();
        assert!(coordinator.init_backend().await.unwrap());
        let err = coordinator
            .load_model("/models/weights.bin", ModelConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlamaError::ModelLoadFailure { .. }));
        assert_eq!(coordinator.status(), WorkerStatus::Error);
        assert!(coordinator.model_info().await.is_none());
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_init_backend_timeout_returns_false() {
        let config = WorkerConfig {
            ready_timeout_ms: 20,
            ..WorkerConfig::default()
        };
        let backend = MockBackend::new("").with_init_delay(Duration::from_millis(300));
        let coordinator = Coordinator::new(backend, config);
        coordinator.start().await.unwrap();
        assert_eq!(coordinator.init_backend().await, Ok(false));
        assert_eq!(
            coordinator.load_model("/models/tiny.gguf", ModelConfig::default()).await,
            Err(LlamaError::NotInitialized)
        );
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_tokenize_detokenize_round_trip() {
        let coordinator = ready(MockBackend::new("")).await;
        let tokens = coordinator.tokenize("Hello, llama", true).await.unwrap();
        assert_eq!(tokens.len(), 13);
        let text = coordinator.detokenize(tokens).await.unwrap();
        assert_eq!(text, "Hello, llama");
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_embed_requires_embeddings_context() {
        let coordinator = ready(MockBackend::new("")).await;
        assert!(matches!(
            coordinator.embed("x").await,
            Err(LlamaError::EmbeddingsFailure(_))
        ));
        coordinator.dispose().await.unwrap();

        let context = ContextConfig {
            embeddings: true,
            ..ContextConfig::default()
        };
        let coordinator = ready_with(MockBackend::new(""), context).await;
        assert_eq!(coordinator.embed("hello").await.unwrap().len(), 8);
        coordinator.dispose().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_save_and_load() {
        let dir = std::env::temp_dir().join(format!("llama-coord-{}", RequestId::new()));
        let store = SessionStore::new(&dir).unwrap();
        let coordinator = ready(MockBackend::new("remember me")).await;
        coordinator.generate("x", greedy(32), None).await.unwrap();

        let mut session = ChatSession::new("", greedy(32));
        coordinator.save_session(&store, &mut session).await.unwrap();
        assert_eq!(session.model_path, "/models/tiny.gguf");
        assert!(!session.tokens.is_empty());

        let loaded = coordinator.load_session(&store, &session.id).await.unwrap();
        assert_eq!(loaded.tokens, session.tokens);

        let mut foreign = session.clone();
        foreign.id = "foreign".to_string();
        foreign.model_path = "/models/other.gguf".to_string();
        store.write_metadata(&foreign).unwrap();
        assert!(matches!(
            coordinator.load_session(&store, "foreign").await,
            Err(LlamaError::SessionFailure(_))
        ));

        coordinator.dispose().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    async fn collect(stream: &mut TokenStream) -> String {
        let mut text = String::new();
        while let Some(piece) = stream.next().await {
            text.push_str(&piece.unwrap());
        }
        text
    }

    #[tokio::test]
    async fn test_resumed_session_continues_from_saved_state() {
        let dir = std::env::temp_dir().join(format!("llama-resume-{}", RequestId::new()));
        let store = SessionStore::new(&dir).unwrap();

        let coordinator = ready(MockBackend::new("Hi!")).await;
        let mut session = ChatSession::new("", greedy(32));
        let mut stream = coordinator
            .generate_stream_with_history("Hello", greedy(32), None, &session.history)
            .await
            .unwrap();
        let reply = collect(&mut stream).await;
        session.push(Role::User, "Hello");
        session.push(Role::Assistant, reply);
        coordinator.save_session(&store, &mut session).await.unwrap();
        coordinator.dispose().await.unwrap();

        // A fresh worker, as after a restart.
        let backend = MockBackend::new("Fine.");
        let trace = backend.trace();
        let coordinator = ready(backend).await;
        let resumed = coordinator.load_session(&store, &session.id).await.unwrap();
        assert_eq!(resumed.history.len(), 2);

        let mut stream = coordinator
            .generate_stream_with_history("And you?", greedy(32), None, &resumed.history)
            .await
            .unwrap();
        assert_eq!(collect(&mut stream).await, "Fine.");
        let reused = stream
            .completion()
            .and_then(|c| c.metrics.as_ref())
            .map(|m| m.reused_tokens)
            .unwrap();
        assert_eq!(reused, resumed.tokens.len());

        {
            let trace = trace.lock().unwrap();
            assert_eq!(trace.clears, 0);
            assert_eq!(trace.decode_starts.first().copied(), Some(reused as u32));
            assert!(reused > 0);
        }

        coordinator.dispose().await.unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }
}
