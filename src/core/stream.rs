/// Per-request result channels between the worker and the submitting thread.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::iter::FusedIterator;

use crate::core::queue::QueueError;

/// What the worker sends down a streaming request's channel.
#[derive(Debug)]
pub enum StreamChunk {
    /// Full text accumulated so far.
    Text(String),
    /// Generation ended normally.
    Done,
    /// Generation failed; nothing follows.
    Error(QueueError),
}

/// Worker side of a streaming request.
#[derive(Debug)]
pub struct ChunkSender {
    tx: Sender<StreamChunk>,
}

impl ChunkSender {
    /// Send a chunk. A consumer that went away is not an error: the worker
    /// finishes the generation regardless.
    pub fn send_text(&self, text: String) {
        let _ = self.tx.send(StreamChunk::Text(text));
    }

    pub fn finish(self) {
        let _ = self.tx.send(StreamChunk::Done);
    }

    pub fn fail(self, error: QueueError) {
        let _ = self.tx.send(StreamChunk::Error(error));
    }
}

/// Worker side of a blocking request.
#[derive(Debug)]
pub struct ReplySender {
    tx: Sender<Result<String, QueueError>>,
}

impl ReplySender {
    pub fn send(self, result: Result<String, QueueError>) {
        let _ = self.tx.send(result);
    }
}

/// Caller side of a blocking request.
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: Receiver<Result<String, QueueError>>,
}

impl ReplyReceiver {
    /// Wait, without timeout, for the worker's answer.
    pub fn wait(self) -> Result<String, QueueError> {
        self.rx.recv().unwrap_or(Err(QueueError::WorkerLost))
    }
}

/// Create the single-value channel of a blocking request.
pub fn reply_channel() -> (ReplySender, ReplyReceiver) {
    let (tx, rx) = bounded(1);
    (ReplySender { tx }, ReplyReceiver { rx })
}

/// Create the chunk channel of a streaming request.
///
/// Unbounded: the worker never waits for the consumer.
pub fn chunk_channel() -> (ChunkSender, ResponseStream) {
    let (tx, rx) = unbounded();
    (ChunkSender { tx }, ResponseStream::new(rx))
}

/// The caller's view of a streaming request.
///
/// Yields `""` first without waiting, then the full text so far each time the
/// worker produces more, until generation ends. Every yielded string extends
/// (or equals) the previous one. An engine failure is yielded as one `Err`,
/// after which the stream is over.
///
/// Drain or drop the stream: chunks the consumer never reads stay buffered.
/// Dropping it does not stop the generation.
#[derive(Debug)]
pub struct ResponseStream {
    rx: Option<Receiver<StreamChunk>>,
    primed: bool,
    pending_error: Option<QueueError>,
}

impl ResponseStream {
    fn new(rx: Receiver<StreamChunk>) -> Self {
        Self {
            rx: Some(rx),
            primed: false,
            pending_error: None,
        }
    }

    /// A stream that never reached the queue: yields `""`, then `error`.
    pub fn failed(error: QueueError) -> Self {
        Self {
            rx: None,
            primed: false,
            pending_error: Some(error),
        }
    }

    /// Consume the stream and return its last text.
    pub fn final_text(self) -> Result<String, QueueError> {
        let mut last = String::new();
        for chunk in self {
            last = chunk?;
        }
        Ok(last)
    }
}

impl Iterator for ResponseStream {
    type Item = Result<String, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.primed {
            self.primed = true;
            return Some(Ok(String::new()));
        }
        if let Some(error) = self.pending_error.take() {
            return Some(Err(error));
        }

        let rx = self.rx.as_ref()?;
        match rx.recv() {
            Ok(StreamChunk::Text(text)) => Some(Ok(text)),
            Ok(StreamChunk::Done) => {
                self.rx = None;
                None
            }
            Ok(StreamChunk::Error(error)) => {
                self.rx = None;
                Some(Err(error))
            }
            Err(_) => {
                self.rx = None;
                Some(Err(QueueError::WorkerLost))
            }
        }
    }
}

impl FusedIterator for ResponseStream {}
