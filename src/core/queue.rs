/// Request queue and worker loop — serialized access to one engine.
///
/// Any number of threads submit requests; a single dedicated worker thread
/// owns the engine and runs them one at a time, in submission order, each to
/// completion before the next is dequeued.
///
/// ```text
///  caller threads                       worker thread
///  ──────────────                       ─────────────
///  submit_blocking ──┐                  loop {
///  submit_streaming ─┼─> FIFO queue ──>   recv (poll) ──> reset + generate
///  submit_blocking ──┘                    reply / chunks ──> per-request channel
///                                       }
/// ```

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::core::accounting::TaskAccounting;
use crate::core::config::{ConfigError, QueueConfig};
use crate::core::engine::{generate_to_string, Engine, EngineError, EngineInput};
use crate::core::prompt::{clean_completion, StreamAccumulator, STOP_MARKERS};
use crate::core::stream::{
    chunk_channel, reply_channel, ChunkSender, ReplySender, ResponseStream,
};
use crate::core::tasks::panic_message;
use crate::schema::request::{PromptRequest, RequestMode};
use crate::schema::status::QueueStatus;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("request queue is shut down")]
    ShutDown,
    #[error("worker dropped the request without replying")]
    WorkerLost,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Where a request's output goes.
#[derive(Debug)]
enum Reply {
    Blocking(ReplySender),
    Streaming(ChunkSender),
}

/// A queued unit of work. Consumed exactly once by the worker.
#[derive(Debug)]
struct Request {
    prompt: PromptRequest,
    reply: Reply,
}

impl Request {
    fn mode(&self) -> RequestMode {
        match self.reply {
            Reply::Blocking(_) => RequestMode::Blocking,
            Reply::Streaming(_) => RequestMode::Streaming,
        }
    }

    /// Answer without running: used when the queue closes under the request.
    fn reject(self, error: QueueError) {
        match self.reply {
            Reply::Blocking(tx) => tx.send(Err(error)),
            Reply::Streaming(tx) => tx.fail(error),
        }
    }
}

/// Cheap, cloneable submission handle. Hand one to every component that
/// needs the engine (dialogue, quest analysis, name generation).
///
/// Do not submit a blocking request from inside the worker thread (for
/// example from an engine callback): it would wait on itself forever.
#[derive(Debug, Clone)]
pub struct QueueClient {
    sender: Sender<Request>,
    accounting: Arc<TaskAccounting>,
}

impl QueueClient {
    /// Queue a request and wait, without timeout, for its cleaned-up text.
    ///
    /// An empty `system_prompt` means no system turn.
    pub fn submit_blocking(&self, prompt: &str, system_prompt: &str) -> Result<String, QueueError> {
        self.submit_request(PromptRequest::from_pair(prompt, system_prompt))
    }

    /// Queue a request and return its stream of growing partial texts.
    ///
    /// The first item is always `""` and is available immediately.
    pub fn submit_streaming(&self, prompt: &str, system_prompt: &str) -> ResponseStream {
        self.stream_request(PromptRequest::from_pair(prompt, system_prompt))
    }

    /// Blocking submission of a fully built request.
    pub fn submit_request(&self, request: PromptRequest) -> Result<String, QueueError> {
        debug!("LLM query: {}", display_label(&request));
        let (tx, rx) = reply_channel();
        self.enqueue(Request {
            prompt: request,
            reply: Reply::Blocking(tx),
        })?;
        rx.wait()
    }

    /// Streaming submission of a fully built request.
    pub fn stream_request(&self, request: PromptRequest) -> ResponseStream {
        debug!("LLM stream query: {}", display_label(&request));
        let (tx, stream) = chunk_channel();
        match self.enqueue(Request {
            prompt: request,
            reply: Reply::Streaming(tx),
        }) {
            Ok(()) => stream,
            Err(error) => ResponseStream::failed(error),
        }
    }

    /// `queued + active` at this instant.
    pub fn pending_work_count(&self) -> usize {
        self.accounting.pending()
    }

    pub fn status(&self) -> QueueStatus {
        self.accounting.status()
    }

    pub fn is_shut_down(&self) -> bool {
        self.accounting.is_closed()
    }

    fn enqueue(&self, request: Request) -> Result<(), QueueError> {
        let mut counters = self.accounting.lock();
        if counters.is_closed() {
            return Err(QueueError::ShutDown);
        }
        counters.enqueue();
        if self.sender.send(request).is_err() {
            counters.withdraw();
            return Err(QueueError::ShutDown);
        }
        Ok(())
    }
}

fn display_label(request: &PromptRequest) -> &str {
    if request.label.is_empty() {
        "unlabeled"
    } else {
        &request.label
    }
}

/// Owner of the worker thread. Dropping it shuts the queue down.
#[derive(Debug)]
pub struct RequestQueue {
    client: QueueClient,
    worker: Option<JoinHandle<()>>,
}

impl RequestQueue {
    /// Move `engine` onto a new worker thread and start serving requests.
    pub fn start<E: Engine>(engine: E, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let (sender, receiver) = unbounded::<Request>();
        let accounting = Arc::new(TaskAccounting::new());
        let worker = Worker {
            engine,
            receiver,
            accounting: Arc::clone(&accounting),
            config: config.clone(),
        };

        let handle = thread::Builder::new()
            .name(config.worker.thread_name.clone())
            .spawn(move || worker.run())
            .map_err(QueueError::Spawn)?;

        info!(
            "request queue started on thread '{}' (max_tokens={}, context_size={})",
            config.worker.thread_name, config.generation.max_tokens, config.generation.context_size
        );

        Ok(Self {
            client: QueueClient { sender, accounting },
            worker: Some(handle),
        })
    }

    /// A new submission handle.
    pub fn client(&self) -> QueueClient {
        self.client.clone()
    }

    pub fn submit_blocking(&self, prompt: &str, system_prompt: &str) -> Result<String, QueueError> {
        self.client.submit_blocking(prompt, system_prompt)
    }

    pub fn submit_streaming(&self, prompt: &str, system_prompt: &str) -> ResponseStream {
        self.client.submit_streaming(prompt, system_prompt)
    }

    pub fn pending_work_count(&self) -> usize {
        self.client.pending_work_count()
    }

    pub fn status(&self) -> QueueStatus {
        self.client.status()
    }

    /// Stop accepting work, let the running request finish, fail everything
    /// still queued with `QueueError::ShutDown`, and join the worker.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        self.client.accounting.lock().close();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("worker thread panicked outside of a request");
            }
            info!("request queue shut down");
        }
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

/// State owned by the worker thread. The engine never leaves it.
struct Worker<E: Engine> {
    engine: E,
    receiver: Receiver<Request>,
    accounting: Arc<TaskAccounting>,
    config: QueueConfig,
}

impl<E: Engine> Worker<E> {
    fn run(mut self) {
        let poll = self.config.poll_interval();
        loop {
            if self.accounting.is_closed() {
                break;
            }
            match self.receiver.recv_timeout(poll) {
                Ok(request) => self.process(request),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.drain();
    }

    fn process(&mut self, request: Request) {
        let status = {
            let mut counters = self.accounting.lock();
            counters.start();
            counters.status()
        };
        debug!(
            "running {:?} request '{}' ({} still queued)",
            request.mode(),
            display_label(&request.prompt),
            status.queued
        );

        let Request { prompt, reply } = request;
        let formatted = prompt.formatted();
        let input = EngineInput {
            prompt: &formatted,
            stop: &STOP_MARKERS,
            params: &self.config.generation,
        };

        match reply {
            Reply::Blocking(tx) => {
                let result = guarded(|| run_blocking(&mut self.engine, &input));
                if let Err(ref err) = result {
                    warn!("request '{}' failed: {}", display_label(&prompt), err);
                }
                self.accounting.lock().finish();
                tx.send(result.map_err(QueueError::from));
            }
            Reply::Streaming(tx) => {
                let result = guarded(|| run_streaming(&mut self.engine, &input, &tx));
                self.accounting.lock().finish();
                match result {
                    Ok(()) => tx.finish(),
                    Err(err) => {
                        warn!("stream '{}' failed: {}", display_label(&prompt), err);
                        tx.fail(QueueError::from(err));
                    }
                }
            }
        }
    }

    /// Fail every request left in the queue after shutdown.
    fn drain(&mut self) {
        let mut dropped = 0;
        while let Ok(request) = self.receiver.try_recv() {
            self.accounting.lock().discard();
            request.reject(QueueError::ShutDown);
            dropped += 1;
        }
        if dropped > 0 {
            info!("shutdown rejected {} queued request(s)", dropped);
        }
    }
}

/// Reset the engine and run one blocking generation.
fn run_blocking<E: Engine>(engine: &mut E, input: &EngineInput<'_>) -> Result<String, EngineError> {
    engine.reset();
    let raw = generate_to_string(engine, input)?;
    Ok(clean_completion(&raw))
}

/// Reset the engine and stream one generation into `tx`.
fn run_streaming<E: Engine>(
    engine: &mut E,
    input: &EngineInput<'_>,
    tx: &ChunkSender,
) -> Result<(), EngineError> {
    engine.reset();
    let mut accumulator = StreamAccumulator::new();
    engine.generate(input, &mut |token| match accumulator.push(token) {
        Some(text) => {
            tx.send_text(text);
            ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
    })
}

/// Run an engine call, turning a panic into `EngineError::Panicked` so the
/// caller gets an answer and the worker keeps serving.
fn guarded<T>(f: impl FnOnce() -> Result<T, EngineError>) -> Result<T, EngineError> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(EngineError::Panicked(panic_message(&*payload))))
}
