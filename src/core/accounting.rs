/// Task accounting — the queued/active counter pair behind one mutex.
///
/// The same lock also guards admission to the queue: a request is counted and
/// pushed in one critical section, and closing the queue happens under that
/// lock too, so nothing can slip in after the worker drains on shutdown.

use parking_lot::{Mutex, MutexGuard};

use crate::schema::status::QueueStatus;

/// Counter state. Only reachable through [`TaskAccounting::lock`].
#[derive(Debug, Default)]
pub struct Counters {
    queued: usize,
    active: usize,
    closed: bool,
}

impl Counters {
    /// A request was admitted to the queue.
    pub fn enqueue(&mut self) {
        self.queued += 1;
    }

    /// Undo `enqueue` for a request that never reached the queue.
    pub fn withdraw(&mut self) {
        debug_assert!(self.queued > 0, "withdraw without enqueue");
        self.queued = self.queued.saturating_sub(1);
    }

    /// The worker dequeued a request and is about to run it.
    pub fn start(&mut self) {
        debug_assert!(self.queued > 0, "start without a queued request");
        debug_assert_eq!(self.active, 0, "single worker runs one request at a time");
        self.queued = self.queued.saturating_sub(1);
        self.active += 1;
    }

    /// The running request delivered its result.
    pub fn finish(&mut self) {
        debug_assert!(self.active > 0, "finish without an active request");
        self.active = self.active.saturating_sub(1);
    }

    /// A queued request was dropped without running (shutdown drain).
    pub fn discard(&mut self) {
        self.withdraw();
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            active: self.active,
            queued: self.queued,
        }
    }
}

/// Shared counters, readable from any thread.
#[derive(Debug, Default)]
pub struct TaskAccounting {
    inner: Mutex<Counters>,
}

impl TaskAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the counters for a compound update.
    pub fn lock(&self) -> MutexGuard<'_, Counters> {
        self.inner.lock()
    }

    /// `queued + active` right now. Never waits on the engine: the lock is
    /// only ever held for counter updates and a non-blocking channel push.
    pub fn pending(&self) -> usize {
        self.inner.lock().status().total()
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.lock().status()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_closed()
    }
}
