//! Hardware Boundary Capabilities
//!
//! The acquisition core never talks to vendor drivers directly. It sees each
//! device class through small capability traits, and every call returns a
//! [`HwResult`] whose error carries the vendor call name, code and message.
//!
//! Probe front end:
//! - [`SlotControl`]: base-station (slot) lifecycle, sync, triggering
//! - [`ProbeControl`]: per-probe setup and channel settings
//! - [`ElectrodeStream`]: packet fetch and FIFO occupancy
//! - [`ProbeHardware`]: all three, what the imec acquirer needs
//!
//! Multiplexed DAQ:
//! - [`MuxDaqHardware`]: task setup and clocked reads for up to two devices
//!
//! # Design Philosophy
//!
//! Each trait:
//! - Is blocking: calls run on dedicated acquisition threads, bounded by a
//!   driver-level timeout
//! - Is thread-safe (requires Send + Sync) and takes `&self`, so one handle
//!   can be shared by every worker and the orchestrator
//! - Reports failures as [`HardwareFault`](crate::error::HardwareFault)
//!
//! # Example
//!
//! ```rust,ignore
//! fn start_slot<H: SlotControl + ?Sized>(hw: &H, slot: u8) -> HwResult<()> {
//!     hw.set_trigger_input(slot, TriggerSource::Software)?;
//!     hw.arm(slot)?;
//!     hw.software_trigger(slot)
//! }
//! ```

use crate::config::{ProbeSettings, TriggerSource};
use crate::error::HwResult;
use crate::hardware::packet::PacketBuffer;

/// Role of a slot in the shared sync signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync not used.
    Disabled,
    /// This slot generates the sync square wave.
    Source,
    /// This slot samples sync on its input connector.
    Input,
}

/// Hardware FIFO occupancy in packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FifoState {
    pub used: usize,
    pub empty: usize,
}

impl FifoState {
    /// Fill level 0..=100; 0 for an unsized FIFO.
    pub fn percent(&self) -> u32 {
        let total = self.used + self.empty;
        if total == 0 {
            0
        } else {
            ((100 * self.used) / total) as u32
        }
    }
}

/// Base-station lifecycle.
pub trait SlotControl: Send + Sync {
    fn open_slot(&self, slot: u8) -> HwResult<()>;

    fn close_slot(&self, slot: u8) -> HwResult<()>;

    fn configure_sync(&self, slot: u8, mode: SyncMode) -> HwResult<()>;

    fn set_trigger_input(&self, slot: u8, source: TriggerSource) -> HwResult<()>;

    /// Stop streaming on every probe of the slot and wait for a trigger.
    fn arm(&self, slot: u8) -> HwResult<()>;

    /// Start streaming on an armed slot.
    fn software_trigger(&self, slot: u8) -> HwResult<()>;
}

/// Per-probe setup.
pub trait ProbeControl: Send + Sync {
    fn open_probe(&self, slot: u8, port: u8) -> HwResult<()>;

    /// Load ADC and gain calibration into the probe.
    fn calibrate(&self, slot: u8, port: u8) -> HwResult<()>;

    fn set_led(&self, slot: u8, port: u8, on: bool) -> HwResult<()>;

    /// Select electrodes, references, gains, filter and standby, then write
    /// the whole set to the probe.
    fn write_probe_settings(&self, slot: u8, port: u8, settings: &ProbeSettings) -> HwResult<()>;
}

/// Streaming side of a probe.
pub trait ElectrodeStream: Send + Sync {
    /// Fetch up to `max_packets` packets without waiting for more to arrive.
    ///
    /// Returns the number of packets written to the front of `buf`.
    fn read_packets(&self, slot: u8, port: u8, buf: &mut PacketBuffer, max_packets: usize) -> HwResult<usize>;

    fn fifo_state(&self, slot: u8, port: u8) -> HwResult<FifoState>;
}

/// Everything the probe acquirer needs from its hardware.
pub trait ProbeHardware: SlotControl + ProbeControl + ElectrodeStream {}

impl<T: SlotControl + ProbeControl + ElectrodeStream> ProbeHardware for T {}

/// One of the two physical devices sharing the mux DAQ clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Dev1,
    Dev2,
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceId::Dev1 => write!(f, "dev1"),
            DeviceId::Dev2 => write!(f, "dev2"),
        }
    }
}

/// How many scans a read asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadRequest {
    /// Everything available right now.
    Available,
    /// Exactly this many, waiting up to the driver timeout.
    Exactly(usize),
}

/// Tasks to create on one device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TaskPlan {
    /// Analog input lines, scan order MN, MA, XA. At least one: a
    /// digital-only device still needs an analog task for its clock.
    pub analog_lines: usize,
    /// Digital input bytes (0 = no digital task).
    pub digital_bytes: usize,
    /// Converter scans per second (timepoint rate times mux factor).
    pub scan_rate: f64,
    /// Driver-side buffer size in scans.
    pub buffer_scans: usize,
    /// Symmetric input range in volts.
    pub range_volts: f64,
}

/// Clocked analog/digital input across one or two devices.
pub trait MuxDaqHardware: Send + Sync {
    fn create_tasks(&self, dev: DeviceId, plan: &TaskPlan) -> HwResult<()>;

    fn start_tasks(&self, dev: DeviceId) -> HwResult<()>;

    fn stop_tasks(&self, dev: DeviceId) -> HwResult<()>;

    /// Release the tasks created by [`create_tasks`](Self::create_tasks).
    fn clear_tasks(&self, dev: DeviceId) -> HwResult<()>;

    /// Read interleaved scans (`analog_lines` samples each) into `out`.
    ///
    /// Returns scans read; never more than fit in `out`.
    fn read_analog(&self, dev: DeviceId, request: ReadRequest, out: &mut [i16]) -> HwResult<usize>;

    /// Read one digital word per scan into `out`.
    fn read_digital(&self, dev: DeviceId, request: ReadRequest, out: &mut [u32]) -> HwResult<usize>;

    /// Drive the optional "acquisition running" output line.
    fn set_start_line(&self, high: bool) -> HwResult<()>;

    /// Occupancy of the driver input buffer, 0..=100.
    fn buffer_fill_percent(&self, dev: DeviceId) -> HwResult<u32>;
}
