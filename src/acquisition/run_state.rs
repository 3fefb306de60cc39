//! Cross-thread coordination for one acquisition session.
//!
//! [`SharedRunState`] is the only state mutated by more than one thread
//! during a run. It holds:
//!
//! - the startup barrier (workers asleep/awake, common start instant)
//! - the stop flag, polled at the top of every worker iteration
//! - the pause ledger used by live update: which slot is paused, how many
//!   probes must acknowledge, and which ports already have
//! - the fatal-error latch, so a session reports exactly one fatal error
//!
//! Everything except the stop flag and the error latch sits behind one
//! `parking_lot::Mutex` paired with a `Condvar`. The stop flag is an atomic
//! so the hot loop can poll it without taking the lock; [`request_stop`]
//! still takes the lock before broadcasting so a sleeping worker cannot
//! miss the wakeup.
//!
//! Acquirers of one session share a [`FatalErrorReporter`]. Once it reports
//! [`session_stopped`], every run state built on it reads as stopped, and
//! condition-variable waits re-check that at least every
//! [`SESSION_STOP_POLL`].
//!
//! [`request_stop`]: SharedRunState::request_stop
//! [`session_stopped`]: FatalErrorReporter::session_stopped

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AcqError, FatalErrorReporter};

/// Longest a barrier wait goes without re-checking the session stop.
pub const SESSION_STOP_POLL: Duration = Duration::from_millis(20);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Workers are being spawned.
    Constructing,
    /// Every worker is parked on the barrier.
    AllAsleep,
    /// Workers released; data flowing.
    Running,
    /// A stop was requested or a slot is paused.
    StoppingOrPaused,
    /// Workers joined and hardware closed.
    Terminated,
}

#[derive(Debug, Default)]
struct PauseLedger {
    target: Option<u8>,
    required: usize,
    acked: BTreeSet<u8>,
}

#[derive(Debug)]
struct RunShared {
    expected: usize,
    asleep: usize,
    awake: usize,
    woken: bool,
    start: Option<Instant>,
    phase: RunPhase,
    pause: PauseLedger,
}

/// Shared run state for one acquisition session.
pub struct SharedRunState {
    shared: Mutex<RunShared>,
    wake: Condvar,
    stop: AtomicBool,
    error_latched: AtomicBool,
    reporter: Arc<dyn FatalErrorReporter>,
}

impl std::fmt::Debug for SharedRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRunState")
            .field("phase", &self.phase())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl SharedRunState {
    /// Fresh state in [`RunPhase::Constructing`], reporting fatal errors to
    /// `reporter`.
    pub fn new(reporter: Arc<dyn FatalErrorReporter>) -> Self {
        Self {
            shared: Mutex::new(RunShared {
                expected: 0,
                asleep: 0,
                awake: 0,
                woken: false,
                start: None,
                phase: RunPhase::Constructing,
                pause: PauseLedger::default(),
            }),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            error_latched: AtomicBool::new(false),
            reporter,
        }
    }

    // =========================================================================
    // Startup barrier
    // =========================================================================

    /// Declare how many workers will call [`worker_wait`](Self::worker_wait).
    pub fn expect_workers(&self, n: usize) {
        let mut s = self.shared.lock();
        s.expected = n;
        s.asleep = 0;
        s.awake = 0;
        s.woken = false;
        s.phase = RunPhase::Constructing;
    }

    /// Park the calling worker until [`wake_all`](Self::wake_all).
    ///
    /// Returns `false` if the session was stopped instead.
    pub fn worker_wait(&self) -> bool {
        let mut s = self.shared.lock();
        s.asleep += 1;
        if s.asleep >= s.expected && s.phase == RunPhase::Constructing {
            s.phase = RunPhase::AllAsleep;
        }
        self.wake.notify_all();

        while !s.woken && !self.is_stopped() {
            self.wake.wait_for(&mut s, SESSION_STOP_POLL);
        }
        s.asleep -= 1;
        s.awake += 1;
        !self.is_stopped()
    }

    /// Block until every expected worker is parked.
    ///
    /// Returns `false` on stop or when `timeout` elapses first.
    pub fn wait_all_asleep(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut s = self.shared.lock();
        while s.asleep < s.expected && !self.is_stopped() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let poll = deadline.map_or(SESSION_STOP_POLL, |d| {
                d.saturating_duration_since(Instant::now()).min(SESSION_STOP_POLL)
            });
            self.wake.wait_for(&mut s, poll);
        }
        s.asleep >= s.expected && !self.is_stopped()
    }

    /// Record the common start instant and release every worker.
    pub fn wake_all(&self) -> Instant {
        let mut s = self.shared.lock();
        let start = Instant::now();
        s.start = Some(start);
        s.woken = true;
        s.phase = RunPhase::Running;
        self.wake.notify_all();
        tracing::debug!(workers = s.expected, "Workers released");
        start
    }

    /// The instant recorded by [`wake_all`](Self::wake_all).
    pub fn start_instant(&self) -> Option<Instant> {
        self.shared.lock().start
    }

    /// Workers past the barrier.
    pub fn awake_workers(&self) -> usize {
        self.shared.lock().awake
    }

    // =========================================================================
    // Stop and fatal errors
    // =========================================================================

    /// Whether this run, or the session it belongs to, has been stopped.
    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.reporter.session_stopped()
    }

    /// Set the stop flag and wake anything parked on the barrier.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let mut s = self.shared.lock();
        if s.phase != RunPhase::Terminated {
            s.phase = RunPhase::StoppingOrPaused;
        }
        self.wake.notify_all();
    }

    /// Workers joined and hardware released.
    pub fn mark_terminated(&self) {
        self.shared.lock().phase = RunPhase::Terminated;
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> RunPhase {
        self.shared.lock().phase
    }

    /// Report a fatal run error.
    ///
    /// The first error of the session stops the run and goes to the
    /// reporter; later ones are only logged. Errors raised after the owner
    /// (or another acquirer's fatal error) already stopped the session are
    /// teardown noise: they are neither latched nor reported.
    pub fn run_error(&self, error: &AcqError) {
        if self.is_stopped() && !self.has_error() {
            tracing::debug!(kind = error.kind(), error = %error, "Run error during shutdown");
            return;
        }
        if self.error_latched.swap(true, Ordering::AcqRel) {
            tracing::warn!(kind = error.kind(), error = %error, "Additional run error after fatal stop");
            return;
        }
        tracing::error!(kind = error.kind(), error = %error, "Fatal run error; stopping");
        self.request_stop();
        self.reporter.report_fatal(error);
    }

    /// Whether a fatal error has been latched.
    pub fn has_error(&self) -> bool {
        self.error_latched.load(Ordering::Acquire)
    }

    // =========================================================================
    // Pause ledger
    // =========================================================================

    /// Pause `slot` (or clear the pause with `None`), expecting `required`
    /// acknowledgements. Always resets the acknowledgement set.
    pub fn pause_slot(&self, slot: Option<u8>, required: usize) {
        let mut s = self.shared.lock();
        s.pause.target = slot;
        s.pause.required = required;
        s.pause.acked.clear();
        match (slot, s.phase) {
            (Some(_), RunPhase::Running) => s.phase = RunPhase::StoppingOrPaused,
            (None, RunPhase::StoppingOrPaused) if !self.is_stopped() => s.phase = RunPhase::Running,
            _ => {}
        }
    }

    /// Slot currently paused for a live update.
    pub fn paused_slot(&self) -> Option<u8> {
        self.shared.lock().pause.target
    }

    /// Acknowledge the pause for the probe on `port` of the paused slot.
    ///
    /// Returns `true` if this port had already acknowledged.
    pub fn pause_ack(&self, port: u8) -> bool {
        !self.shared.lock().pause.acked.insert(port)
    }

    /// Probes that have acknowledged the current pause.
    pub fn pause_acks(&self) -> usize {
        self.shared.lock().pause.acked.len()
    }

    /// Whether the paused slot has its full quorum.
    pub fn pause_all_ack(&self) -> bool {
        let s = self.shared.lock();
        s.pause.target.is_some() && s.pause.acked.len() >= s.pause.required
    }

    /// Poll until the paused slot reaches quorum.
    ///
    /// With no timeout this waits as long as it takes. Returns `false` on
    /// stop or timeout.
    pub fn wait_for_pause_quorum(&self, poll: Duration, timeout: Option<Duration>) -> bool {
        let started = Instant::now();
        loop {
            if self.is_stopped() {
                return false;
            }
            if self.pause_all_ack() {
                return true;
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                return false;
            }
            std::thread::sleep(poll);
        }
    }
}
