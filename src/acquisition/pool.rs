//! Bounded pool of named acquisition threads.
//!
//! Workers are plain OS threads: the fetch loops block in driver calls and
//! must never share an executor. Teardown joins with a deadline; a worker
//! that has not finished by then is abandoned (its handle is dropped and
//! the thread detaches) so one stuck driver call cannot hang shutdown.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{AcqError, AcqResult};

/// Result of [`WorkerPool::join_with_timeout`].
#[derive(Debug)]
pub struct JoinOutcome<R> {
    /// Workers that returned normally, in spawn order.
    pub results: Vec<(String, R)>,
    /// Workers that panicked.
    pub panicked: Vec<String>,
    /// Workers still running at the deadline.
    pub abandoned: Vec<String>,
}

/// Named worker threads returning `R`.
#[derive(Debug)]
pub struct WorkerPool<R> {
    handles: Vec<(String, JoinHandle<R>)>,
}

impl<R> Default for WorkerPool<R> {
    fn default() -> Self {
        Self {
            handles: Vec::new(),
        }
    }
}

impl<R: Send + 'static> WorkerPool<R> {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers spawned and not yet joined.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Start `f` on a new OS thread named `name`.
    ///
    /// Fails with [`AcqError::Spawn`] if the thread cannot be created; the
    /// workers already in the pool are unaffected.
    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> AcqResult<()>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let name = name.into();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(AcqError::Spawn)?;
        tracing::debug!(worker = %name, "Worker spawned");
        self.handles.push((name, handle));
        Ok(())
    }

    /// Join every worker, waiting at most `timeout` overall and polling
    /// every `poll`.
    pub fn join_with_timeout(self, timeout: Duration, poll: Duration) -> JoinOutcome<R> {
        let deadline = Instant::now() + timeout;
        let mut pending = self.handles;
        let mut outcome = JoinOutcome {
            results: Vec::new(),
            panicked: Vec::new(),
            abandoned: Vec::new(),
        };

        loop {
            let (done, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, h)| h.is_finished());
            for (name, handle) in done {
                match handle.join() {
                    Ok(r) => outcome.results.push((name, r)),
                    Err(_) => {
                        tracing::error!(worker = %name, "Worker panicked");
                        outcome.panicked.push(name);
                    }
                }
            }
            pending = running;

            let now = Instant::now();
            if pending.is_empty() || now >= deadline {
                break;
            }
            thread::sleep(poll.min(deadline - now));
        }

        for (name, _handle) in pending {
            tracing::warn!(worker = %name, timeout_ms = timeout.as_millis() as u64, "Worker did not stop in time; abandoning");
            outcome.abandoned.push(name);
        }
        outcome
    }
}
