//! Error types for the acquisition pipeline.
//!
//! This module defines `AcqError`, the single error type surfaced by every
//! acquirer, and the seam through which fatal run errors reach the owning
//! controller.
//!
//! ## Error Taxonomy
//!
//! - **Fatal** (abort the run): `Hardware`, `NoData`, `FifoOverflow`,
//!   `OutOfMemory`, `Spawn`. The first one raised in a session sets the
//!   shared stop flag and is forwarded exactly once through a
//!   [`FatalErrorReporter`].
//! - **Recoverable**: FIFO fill warnings, cross-device phase shifts and
//!   timestamp discontinuities are *not* errors. They are logged with
//!   `tracing::warn!` and acquisition continues.
//! - **Expected**: an empty fetch during an acknowledged pause is not an
//!   error at all; it produces a zero-fill marker.
//!
//! Hardware calls return [`HwResult`]. A [`HardwareFault`] is the
//! per-call error context (call name, vendor code, vendor text); there is no
//! process-wide "last error" state. The acquirer attaches the target unit
//! with [`HardwareFault::at`] when it escalates a fault to `AcqError`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Convenience alias for results using the acquisition error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

/// Result of a single call across the hardware boundary.
pub type HwResult<T> = std::result::Result<T, HardwareFault>;

/// Errors raised by the acquisition pipeline.
#[derive(Error, Debug)]
pub enum AcqError {
    #[error("{call}({target}) error code {code} '{message}'")]
    Hardware {
        call: &'static str,
        target: String,
        code: i32,
        message: String,
    },

    #[error("{stream} getting no samples.")]
    NoData { stream: String },

    #[error("FIFO queue {stream} overflow ({percent}%); stopping run.")]
    FifoOverflow { stream: String, percent: u32 },

    #[error("{stream}: out of memory growing buffer to {frames} frames")]
    OutOfMemory { stream: String, frames: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Failed to spawn acquisition thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Acquisition stopped")]
    Stopped,
}

impl AcqError {
    /// Whether this error must abort the whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AcqError::Stopped | AcqError::NotSupported(_))
    }

    /// Short machine-friendly tag, used as a structured log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            AcqError::Hardware { .. } => "hardware",
            AcqError::NoData { .. } => "no_data",
            AcqError::FifoOverflow { .. } => "fifo_overflow",
            AcqError::OutOfMemory { .. } => "out_of_memory",
            AcqError::Config(_) | AcqError::Configuration(_) => "configuration",
            AcqError::Spawn(_) => "spawn",
            AcqError::NotSupported(_) => "not_supported",
            AcqError::Stopped => "stopped",
        }
    }
}

/// A failed call across the hardware boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} error code {code} '{message}'")]
pub struct HardwareFault {
    /// Name of the vendor call that failed.
    pub call: &'static str,
    /// Vendor-specific status code.
    pub code: i32,
    /// Vendor-supplied message text.
    pub message: String,
}

impl HardwareFault {
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            code,
            message: message.into(),
        }
    }

    /// Escalate to a fatal run error naming the unit that failed.
    #[must_use]
    pub fn at(self, target: impl Into<String>) -> AcqError {
        AcqError::Hardware {
            call: self.call,
            target: target.into(),
            code: self.code,
            message: self.message,
        }
    }
}

/// Single entry point for fatal run errors.
///
/// Implemented by whatever owns the acquisition session. The owner is
/// responsible for stopping the full pipeline and notifying the user.
pub trait FatalErrorReporter: Send + Sync {
    /// Deliver the session's fatal error.
    fn report_fatal(&self, error: &AcqError);

    /// Whether a fatal error anywhere in the session has stopped it.
    ///
    /// Every acquirer sharing this reporter treats `true` as its own stop
    /// flag, so one fatal error stops all of them.
    fn session_stopped(&self) -> bool {
        false
    }
}

/// Forwards fatal errors to the owning controller over a tokio channel.
///
/// The first report also trips the session-wide stop seen through
/// [`FatalErrorReporter::session_stopped`].
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<String>,
    tripped: Arc<AtomicBool>,
}

impl ChannelReporter {
    /// Create a reporter and the receiving end held by the controller.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self {
            tx,
            tripped: Arc::new(AtomicBool::new(false)),
        };
        (reporter, rx)
    }

    /// Clear the session stop before a new run.
    pub fn reset(&self) {
        self.tripped.store(false, Ordering::Release);
    }
}

impl FatalErrorReporter for ChannelReporter {
    fn session_stopped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    fn report_fatal(&self, error: &AcqError) {
        self.tripped.store(true, Ordering::Release);
        if self.tx.send(error.to_string()).is_err() {
            tracing::error!(error = %error, "Fatal error dropped: controller has gone away");
        }
    }
}

/// Reporter that only logs; used when no controller is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl FatalErrorReporter for LogReporter {
    fn report_fatal(&self, error: &AcqError) {
        tracing::error!(kind = error.kind(), "{}", error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_fault_message_names_target() {
        let err = HardwareFault::new("readElectrodeData", -7, "timeout").at("slot 3, port 1");
        assert_eq!(
            err.to_string(),
            "readElectrodeData(slot 3, port 1) error code -7 'timeout'"
        );
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "hardware");
    }

    #[test]
    fn test_classification() {
        assert!(AcqError::NoData { stream: "probe 0".into() }.is_fatal());
        assert!(AcqError::FifoOverflow {
            stream: "probe 2".into(),
            percent: 96
        }
        .is_fatal());
        assert!(!AcqError::Stopped.is_fatal());
        assert!(!AcqError::NotSupported("update".into()).is_fatal());
    }

    #[test]
    fn test_channel_reporter_forwards_message() {
        let (reporter, mut rx) = ChannelReporter::channel();
        reporter.report_fatal(&AcqError::NoData {
            stream: "Imec probe 1".into(),
        });
        assert_eq!(rx.try_recv().unwrap(), "Imec probe 1 getting no samples.");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_reporter_trips_session_stop() {
        let (reporter, _rx) = ChannelReporter::channel();
        let shared = reporter.clone();
        assert!(!shared.session_stopped());

        reporter.report_fatal(&AcqError::NoData { stream: "Mux DAQ".into() });
        assert!(shared.session_stopped());
        shared.reset();
        assert!(!reporter.session_stopped());
        assert!(!LogReporter.session_stopped());
    }
}
