/// Supervised background tasks.
///
/// Game systems run blocking queue requests (quest analysis, name generation,
/// reward extraction) off the main thread. Each task gets a named OS thread;
/// its result or panic is delivered to its handle. The pool holds on to
/// threads until they exit and to failures until someone has seen them, so
/// shutdown can join what is left and report what went wrong.

use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task '{label}' panicked: {message}")]
    Panicked { label: String, message: String },
    #[error("task '{label}' failed: {message}")]
    Failed { label: String, message: String },
    #[error("task '{label}' ended without a result")]
    Lost { label: String },
    #[error("failed to spawn task '{label}': {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

/// A task that panicked or returned an error, as reported by `join_all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub label: String,
    pub message: String,
    pub panicked: bool,
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type FailureLog = Arc<Mutex<Vec<(u64, TaskFailure)>>>;

/// Handle to one spawned task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    id: u64,
    label: String,
    result: Receiver<Result<T, TaskError>>,
    done: Arc<AtomicBool>,
    failures: FailureLog,
}

impl<T> TaskHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Wait for the task's result.
    ///
    /// A failure returned here is no longer reported by `TaskPool::join_all`.
    pub fn join(self) -> Result<T, TaskError> {
        match self.result.recv() {
            Ok(result) => self.reported(result),
            Err(_) => Err(TaskError::Lost { label: self.label }),
        }
    }

    /// The result if the task is done, without waiting.
    pub fn try_join(&self) -> Option<Result<T, TaskError>> {
        match self.result.try_recv() {
            Ok(result) => Some(self.reported(result)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(TaskError::Lost {
                label: self.label.clone(),
            })),
        }
    }

    fn reported(&self, result: Result<T, TaskError>) -> Result<T, TaskError> {
        if result.is_err() {
            self.failures.lock().retain(|(id, _)| *id != self.id);
        }
        result
    }

    pub fn is_finished(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// A set of supervised background threads.
#[derive(Debug)]
pub struct TaskPool {
    name: String,
    threads: Mutex<Vec<JoinHandle<()>>>,
    failures: FailureLog,
    running: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl TaskPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            threads: Mutex::new(Vec::new()),
            failures: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `f` on a new thread. A panic is reported to the handle and kept
    /// for `join_all`.
    pub fn spawn<T, F>(&self, label: &str, f: F) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn_inner(label, move || Ok::<T, std::convert::Infallible>(f()))
    }

    /// Like `spawn`, but an `Err` returned by `f` is also recorded as a failure.
    pub fn spawn_fallible<T, E, F>(&self, label: &str, f: F) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.spawn_inner(label, f)
    }

    fn spawn_inner<T, E, F>(&self, label: &str, f: F) -> Result<TaskHandle<T>, TaskError>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let failures = Arc::clone(&self.failures);
        let running = Arc::clone(&self.running);
        let done = Arc::new(AtomicBool::new(false));
        let task_done = Arc::clone(&done);
        let task_label = label.to_string();

        running.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("{}:{}", self.name, label))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f));
                let result = match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(err)) => {
                        let message = err.to_string();
                        log::warn!("task '{}' failed: {}", task_label, message);
                        failures.lock().push((
                            id,
                            TaskFailure {
                                label: task_label.clone(),
                                message: message.clone(),
                                panicked: false,
                            },
                        ));
                        Err(TaskError::Failed {
                            label: task_label,
                            message,
                        })
                    }
                    Err(payload) => {
                        let message = panic_message(&*payload);
                        log::warn!("task '{}' panicked: {}", task_label, message);
                        failures.lock().push((
                            id,
                            TaskFailure {
                                label: task_label.clone(),
                                message: message.clone(),
                                panicked: true,
                            },
                        ));
                        Err(TaskError::Panicked {
                            label: task_label,
                            message,
                        })
                    }
                };
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(result);
                task_done.store(true, Ordering::Release);
            });

        match spawned {
            Ok(handle) => {
                let mut threads = self.threads.lock();
                reap_finished(&mut threads);
                threads.push(handle);
                Ok(TaskHandle {
                    id,
                    label: label.to_string(),
                    result: rx,
                    done,
                    failures: Arc::clone(&self.failures),
                })
            }
            Err(source) => {
                self.running.fetch_sub(1, Ordering::SeqCst);
                Err(TaskError::Spawn {
                    label: label.to_string(),
                    source,
                })
            }
        }
    }

    /// Tasks that have not finished yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Join every thread still held and drain the failures no handle has
    /// reported yet.
    pub fn join_all(&self) -> Vec<TaskFailure> {
        let threads: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        std::mem::take(&mut *self.failures.lock())
            .into_iter()
            .map(|(_, failure)| failure)
            .collect()
    }
}

/// Join and drop threads that have already exited.
fn reap_finished(threads: &mut Vec<JoinHandle<()>>) {
    let mut i = 0;
    while i < threads.len() {
        if threads[i].is_finished() {
            let _ = threads.swap_remove(i).join();
        } else {
            i += 1;
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        let failures = self.join_all();
        if !failures.is_empty() {
            log::warn!(
                "task pool '{}' dropped with {} unreported failure(s)",
                self.name,
                failures.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_returns_value() {
        let pool = TaskPool::new("test");
        let handle = pool.spawn("add", || 2 + 2).unwrap();
        assert_eq!(handle.label(), "add");
        assert_eq!(handle.join().unwrap(), 4);
        assert!(pool.join_all().is_empty());
    }

    #[test]
    fn panic_is_reported_to_handle_once() {
        let pool = TaskPool::new("test");
        let handle = pool
            .spawn("boom", || -> u32 { panic!("quest parser exploded") })
            .unwrap();

        match handle.join() {
            Err(TaskError::Panicked { label, message }) => {
                assert_eq!(label, "boom");
                assert_eq!(message, "quest parser exploded");
            }
            other => panic!("expected panic error, got {:?}", other),
        }

        // Seen through the handle, so not reported twice.
        assert!(pool.join_all().is_empty());
    }

    #[test]
    fn unjoined_panic_is_kept_for_join_all() {
        let pool = TaskPool::new("test");
        drop(pool.spawn("boom", || -> u32 { panic!("name generator exploded") }));

        let failures = pool.join_all();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].panicked);
        assert_eq!(failures[0].message, "name generator exploded");
    }

    #[test]
    fn fallible_error_is_recorded() {
        let pool = TaskPool::new("test");
        let handle = pool
            .spawn_fallible("reward", || -> Result<u32, String> { Err("no number".to_string()) })
            .unwrap();
        drop(handle);

        let failures = pool.join_all();
        assert_eq!(
            failures,
            vec![TaskFailure {
                label: "reward".to_string(),
                message: "no number".to_string(),
                panicked: false,
            }]
        );
    }

    #[test]
    fn join_all_waits_for_detached_tasks() {
        let pool = TaskPool::new("test");
        let flag = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let flag = Arc::clone(&flag);
            // Handle dropped on purpose: the pool still owns the thread.
            let _ = pool.spawn("bump", move || {
                thread::sleep(std::time::Duration::from_millis(10));
                flag.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(pool.join_all().is_empty());
        assert_eq!(flag.load(Ordering::SeqCst), 4);
        assert_eq!(pool.running(), 0);
    }

    #[test]
    fn try_join_before_and_after() {
        let pool = TaskPool::new("test");
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let handle = pool
            .spawn("gated", move || {
                let _ = gate_rx.recv();
                "done"
            })
            .unwrap();
        assert!(handle.try_join().is_none());
        assert!(!handle.is_finished());
        gate_tx.send(()).unwrap();
        pool.join_all();
        assert!(handle.is_finished());
        assert_eq!(handle.try_join().unwrap().unwrap(), "done");
    }

    #[test]
    fn finished_threads_are_not_retained() {
        let pool = TaskPool::new("test");
        for n in 0..500u32 {
            let handle = pool.spawn("quest", move || n * 2).unwrap();
            assert_eq!(handle.join().unwrap(), n * 2);
            assert!(pool.threads.lock().len() < 64);
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        loop {
            let mut threads = pool.threads.lock();
            reap_finished(&mut threads);
            if threads.is_empty() {
                break;
            }
            drop(threads);
            assert!(std::time::Instant::now() < deadline, "threads never exited");
            thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[test]
    fn reported_failures_are_not_retained() {
        let pool = TaskPool::new("test");
        for _ in 0..100 {
            let handle = pool
                .spawn_fallible("reward", || -> Result<u32, String> { Err("no number".to_string()) })
                .unwrap();
            assert!(handle.join().is_err());
        }
        assert!(pool.failures.lock().is_empty());
        assert!(pool.join_all().is_empty());
    }

    #[test]
    fn panic_message_handles_both_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
