//! Acquisition engine.
//!
//! Every data source is driven by an [`Acquirer`]: a configure step that
//! programs the hardware, a run step that starts worker threads behind a
//! common startup barrier, and a bounded stop. Workers only ever share the
//! per-acquirer [`SharedRunState`] and their output queues.
//!
//! # Sources
//!
//! - [`ImecAcquirer`] / [`ImecSimAcquirer`] - packetized probe streams
//! - [`MuxDaqAcquirer`] / [`MuxDaqSimAcquirer`] - clocked multiplexed DAQ
//!
//! [`RunController`] starts a set of acquirers together and surfaces the
//! first fatal error any of them reports.

pub mod controller;
pub mod demux;
pub mod imec;
pub mod imec_sim;
pub mod mux_daq;
pub mod mux_sim;
pub mod pacing;
pub mod pool;
pub mod probe;
pub mod run_state;
pub mod worker;

use crate::config::ProbeSettings;
use crate::error::{AcqError, AcqResult};

pub use controller::RunController;
pub use demux::{DemuxEngine, MuxLayout};
pub use imec::ImecAcquirer;
pub use imec_sim::ImecSimAcquirer;
pub use mux_daq::{MuxDaqAcquirer, MuxDaqReader};
pub use mux_sim::MuxDaqSimAcquirer;
pub use run_state::{RunPhase, SharedRunState};

/// Fill level of one hardware (or simulated) buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoStatus {
    /// Stream name as used in log and error messages.
    pub stream: String,
    /// 0..=100
    pub percent: u32,
}

/// Lifecycle of one acquisition source.
///
/// `configure` then `run`; `stop` is always safe to call and leaves the
/// acquirer ready to be configured again.
pub trait Acquirer: Send {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Program the hardware. Blocking; checks for stop between steps.
    fn configure(&mut self) -> AcqResult<()>;

    /// Start workers and release them together. Returns once data flow.
    fn run(&mut self) -> AcqResult<()>;

    /// Current buffer fill per stream.
    fn fifo_status(&self) -> Vec<FifoStatus>;

    /// Apply new settings to one probe, live if running.
    fn update(&mut self, probe: usize, _settings: ProbeSettings) -> AcqResult<()> {
        Err(AcqError::NotSupported(format!(
            "{} has no probe {probe} to update",
            self.name()
        )))
    }

    /// Stop workers, join them (bounded) and release the hardware.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Closed set of acquirers a run can hold.
pub enum AnyAcquirer {
    Imec(ImecAcquirer),
    ImecSim(ImecSimAcquirer),
    MuxDaq(MuxDaqAcquirer),
    MuxDaqSim(MuxDaqSimAcquirer),
}

impl AnyAcquirer {
    fn inner(&self) -> &dyn Acquirer {
        match self {
            Self::Imec(a) => a,
            Self::ImecSim(a) => a,
            Self::MuxDaq(a) => a,
            Self::MuxDaqSim(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Acquirer {
        match self {
            Self::Imec(a) => a,
            Self::ImecSim(a) => a,
            Self::MuxDaq(a) => a,
            Self::MuxDaqSim(a) => a,
        }
    }

    /// Shared state of the underlying acquirer.
    pub fn run_state(&self) -> std::sync::Arc<SharedRunState> {
        match self {
            Self::Imec(a) => a.run_state(),
            Self::ImecSim(a) => a.run_state(),
            Self::MuxDaq(a) => a.run_state(),
            Self::MuxDaqSim(a) => a.run_state(),
        }
    }
}

impl Acquirer for AnyAcquirer {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn configure(&mut self) -> AcqResult<()> {
        self.inner_mut().configure()
    }

    fn run(&mut self) -> AcqResult<()> {
        self.inner_mut().run()
    }

    fn fifo_status(&self) -> Vec<FifoStatus> {
        self.inner().fifo_status()
    }

    fn update(&mut self, probe: usize, settings: ProbeSettings) -> AcqResult<()> {
        self.inner_mut().update(probe, settings)
    }

    fn stop(&mut self) {
        self.inner_mut().stop()
    }

    fn is_running(&self) -> bool {
        self.inner().is_running()
    }
}

impl From<ImecAcquirer> for AnyAcquirer {
    fn from(a: ImecAcquirer) -> Self {
        Self::Imec(a)
    }
}

impl From<ImecSimAcquirer> for AnyAcquirer {
    fn from(a: ImecSimAcquirer) -> Self {
        Self::ImecSim(a)
    }
}

impl From<MuxDaqAcquirer> for AnyAcquirer {
    fn from(a: MuxDaqAcquirer) -> Self {
        Self::MuxDaq(a)
    }
}

impl From<MuxDaqSimAcquirer> for AnyAcquirer {
    fn from(a: MuxDaqSimAcquirer) -> Self {
        Self::MuxDaqSim(a)
    }
}
