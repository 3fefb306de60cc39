//! Simulated Hardware
//!
//! Wall-clock paced stand-ins for both device classes, so the real worker
//! and demux paths run without vendor hardware.
//!
//! # Available Simulators
//!
//! - `SimProbeHardware` - probe front end producing electrode packets at the
//!   configured AP rate once a slot is triggered
//! - `SimMuxDaqHardware` - one or two clocked DAQ devices producing
//!   deterministic ramps, on the wall clock or a manually advanced clock
//!
//! # Test Hooks
//!
//! - one-shot fault injection per vendor call name (`fail_next`)
//! - scripted FIFO fill levels, silent probes, status-bit errors
//! - a log of every control call, for checking call order
//! - a one-shot dev2 read shortfall, to provoke phase-shift warnings

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Instant;

use crate::config::{ImecConfig, ProbeSettings, TriggerSource};
use crate::error::{HardwareFault, HwResult};
use crate::hardware::capabilities::{
    DeviceId, ElectrodeStream, FifoState, MuxDaqHardware, ProbeControl, ReadRequest, SlotControl,
    SyncMode, TaskPlan,
};
use crate::hardware::packet::{status, PacketBuffer, PacketLayout, SAMPLES_PER_PACKET};

/// Call names used by the simulators, for `fail_next`.
pub mod calls {
    pub const OPEN_SLOT: &str = "openBS";
    pub const CLOSE_SLOT: &str = "close";
    pub const CONFIGURE_SYNC: &str = "setSyncMode";
    pub const TRIGGER_INPUT: &str = "setTriggerInput";
    pub const ARM: &str = "arm";
    pub const SOFTWARE_TRIGGER: &str = "setSWTrigger";
    pub const OPEN_PROBE: &str = "openProbe";
    pub const CALIBRATE: &str = "setCalibration";
    pub const LED: &str = "setHSLed";
    pub const WRITE_PROBE: &str = "writeProbeConfiguration";
    pub const READ_PACKETS: &str = "readElectrodeData";
    pub const FIFO_STATE: &str = "getElectrodeDataFifoState";
    pub const CREATE_TASKS: &str = "DAQmxCreateTask";
    pub const START_TASKS: &str = "DAQmxStartTask";
    pub const STOP_TASKS: &str = "DAQmxStopTask";
    pub const CLEAR_TASKS: &str = "DAQmxClearTask";
    pub const READ_ANALOG: &str = "DAQmxReadBinaryI16";
    pub const READ_DIGITAL: &str = "DAQmxReadDigitalU32";
    pub const START_LINE: &str = "DAQmxWriteDigitalLines";
}

/// Shared bookkeeping for call logs and one-shot faults.
#[derive(Debug, Default)]
struct CallLog {
    calls: Vec<String>,
    faults: HashMap<&'static str, HardwareFault>,
}

impl CallLog {
    fn check(&mut self, call: &'static str) -> HwResult<()> {
        match self.faults.remove(call) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    fn record(&mut self, call: &'static str, entry: String) -> HwResult<()> {
        self.check(call)?;
        self.calls.push(entry);
        Ok(())
    }
}

// =============================================================================
// SimProbeHardware - Simulated Probe Front End
// =============================================================================

/// AP sample value produced by the simulator for `ch` at sample index `s`.
pub fn sim_ap_value(ch: usize, s: u64) -> i16 {
    ((s + 16 * ch as u64) % 512) as i16 - 256
}

/// LF sample value produced by the simulator for `ch` in packet `k`.
pub fn sim_lf_value(ch: usize, k: u64) -> i16 {
    (4 * ch as u64 + k % 64) as i16
}

#[derive(Debug)]
struct SimProbe {
    layout: PacketLayout,
    open: bool,
    settings: Option<ProbeSettings>,
    streaming_since: Option<Instant>,
    delivered: u64,
    timestamp: u32,
    fill: VecDeque<u32>,
    last_fill: u32,
    silent: bool,
    pending_status: u16,
}

impl SimProbe {
    fn new(layout: PacketLayout) -> Self {
        Self {
            layout,
            open: false,
            settings: None,
            streaming_since: None,
            delivered: 0,
            timestamp: 0,
            fill: VecDeque::new(),
            last_fill: 0,
            silent: false,
            pending_status: 0,
        }
    }
}

#[derive(Debug, Default)]
struct SimProbeState {
    open_slots: BTreeSet<u8>,
    probes: HashMap<(u8, u8), SimProbe>,
    log: CallLog,
}

impl SimProbeState {
    fn slot_open(&self, call: &'static str, slot: u8) -> HwResult<()> {
        if self.open_slots.contains(&slot) {
            Ok(())
        } else {
            Err(HardwareFault::new(call, 3, format!("slot {slot} is not open")))
        }
    }

    fn probe_mut(&mut self, call: &'static str, slot: u8, port: u8) -> HwResult<&mut SimProbe> {
        self.probes
            .get_mut(&(slot, port))
            .ok_or_else(|| HardwareFault::new(call, 9, format!("no probe at slot {slot} port {port}")))
    }
}

/// Simulated probe front end.
///
/// Probes stream once their slot has been triggered and stop when the
/// slot is re-armed, like the real base station.
///
/// # Example
///
/// ```rust,ignore
/// let hw = SimProbeHardware::new(30_000.0).with_probe(2, 1, PacketLayout::new(384, 384));
/// hw.open_slot(2)?;
/// hw.arm(2)?;
/// hw.software_trigger(2)?;
/// ```
#[derive(Debug)]
pub struct SimProbeHardware {
    sample_rate: f64,
    inner: Mutex<SimProbeState>,
}

impl SimProbeHardware {
    pub fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            inner: Mutex::new(SimProbeState::default()),
        }
    }

    /// One simulated probe per configured probe.
    pub fn from_config(config: &ImecConfig) -> Self {
        config.probes.iter().fold(Self::new(config.sample_rate), |hw, p| {
            hw.with_probe(p.slot, p.port, PacketLayout::new(p.ap_channels, p.lf_channels))
        })
    }

    pub fn with_probe(self, slot: u8, port: u8, layout: PacketLayout) -> Self {
        self.inner.lock().probes.insert((slot, port), SimProbe::new(layout));
        self
    }

    /// Make the next call named `call` fail.
    pub fn fail_next(&self, call: &'static str, code: i32, message: &str) {
        self.inner
            .lock()
            .log
            .faults
            .insert(call, HardwareFault::new(call, code, message));
    }

    /// FIFO fill percentages returned by successive queries; the last one sticks.
    pub fn set_fill_profile(&self, slot: u8, port: u8, profile: impl IntoIterator<Item = u32>) {
        if let Some(p) = self.inner.lock().probes.get_mut(&(slot, port)) {
            p.fill = profile.into_iter().collect();
        }
    }

    /// Probe never delivers packets.
    pub fn set_silent(&self, slot: u8, port: u8) {
        if let Some(p) = self.inner.lock().probes.get_mut(&(slot, port)) {
            p.silent = true;
        }
    }

    /// OR `bits` into every status word of the next fetch.
    pub fn inject_status(&self, slot: u8, port: u8, bits: u16) {
        if let Some(p) = self.inner.lock().probes.get_mut(&(slot, port)) {
            p.pending_status |= bits;
        }
    }

    /// Control calls so far, e.g. `"arm(2)"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().log.calls.clone()
    }

    pub fn settings(&self, slot: u8, port: u8) -> Option<ProbeSettings> {
        self.inner
            .lock()
            .probes
            .get(&(slot, port))
            .and_then(|p| p.settings.clone())
    }

    pub fn is_slot_open(&self, slot: u8) -> bool {
        self.inner.lock().open_slots.contains(&slot)
    }

    fn for_slot(state: &mut SimProbeState, slot: u8, f: impl Fn(&mut SimProbe)) {
        state
            .probes
            .iter_mut()
            .filter(|((s, _), _)| *s == slot)
            .for_each(|(_, p)| f(p));
    }
}

impl SlotControl for SimProbeHardware {
    fn open_slot(&self, slot: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::OPEN_SLOT, format!("open_slot({slot})"))?;
        st.open_slots.insert(slot);
        Ok(())
    }

    fn close_slot(&self, slot: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::CLOSE_SLOT, format!("close_slot({slot})"))?;
        st.open_slots.remove(&slot);
        Self::for_slot(&mut st, slot, |p| {
            p.open = false;
            p.streaming_since = None;
        });
        Ok(())
    }

    fn configure_sync(&self, slot: u8, mode: SyncMode) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::CONFIGURE_SYNC, format!("configure_sync({slot}, {mode:?})"))?;
        st.slot_open(calls::CONFIGURE_SYNC, slot)
    }

    fn set_trigger_input(&self, slot: u8, source: TriggerSource) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::TRIGGER_INPUT, format!("set_trigger_input({slot}, {source:?})"))?;
        st.slot_open(calls::TRIGGER_INPUT, slot)
    }

    fn arm(&self, slot: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::ARM, format!("arm({slot})"))?;
        st.slot_open(calls::ARM, slot)?;
        Self::for_slot(&mut st, slot, |p| {
            p.streaming_since = None;
            p.delivered = 0;
        });
        Ok(())
    }

    fn software_trigger(&self, slot: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::SOFTWARE_TRIGGER, format!("software_trigger({slot})"))?;
        st.slot_open(calls::SOFTWARE_TRIGGER, slot)?;
        let now = Instant::now();
        Self::for_slot(&mut st, slot, |p| {
            if p.open {
                p.streaming_since = Some(now);
                p.delivered = 0;
            }
        });
        Ok(())
    }
}

impl ProbeControl for SimProbeHardware {
    fn open_probe(&self, slot: u8, port: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::OPEN_PROBE, format!("open_probe({slot}, {port})"))?;
        st.slot_open(calls::OPEN_PROBE, slot)?;
        st.probe_mut(calls::OPEN_PROBE, slot, port)?.open = true;
        Ok(())
    }

    fn calibrate(&self, slot: u8, port: u8) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::CALIBRATE, format!("calibrate({slot}, {port})"))?;
        st.probe_mut(calls::CALIBRATE, slot, port).map(|_| ())
    }

    fn set_led(&self, slot: u8, port: u8, on: bool) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::LED, format!("set_led({slot}, {port}, {on})"))?;
        st.probe_mut(calls::LED, slot, port).map(|_| ())
    }

    fn write_probe_settings(&self, slot: u8, port: u8, settings: &ProbeSettings) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::WRITE_PROBE, format!("write_probe_settings({slot}, {port})"))?;
        st.probe_mut(calls::WRITE_PROBE, slot, port)?.settings = Some(settings.clone());
        Ok(())
    }
}

impl ElectrodeStream for SimProbeHardware {
    fn read_packets(&self, slot: u8, port: u8, buf: &mut PacketBuffer, max_packets: usize) -> HwResult<usize> {
        let sample_rate = self.sample_rate;
        let mut st = self.inner.lock();
        st.log.check(calls::READ_PACKETS)?;
        let probe = st.probe_mut(calls::READ_PACKETS, slot, port)?;
        if probe.layout != buf.layout() {
            return Err(HardwareFault::new(
                calls::READ_PACKETS,
                11,
                "packet buffer layout does not match probe",
            ));
        }
        let Some(since) = probe.streaming_since else {
            return Ok(0);
        };
        if probe.silent {
            return Ok(0);
        }

        let produced = (since.elapsed().as_secs_f64() * sample_rate) as u64 / SAMPLES_PER_PACKET as u64;
        let n = produced
            .saturating_sub(probe.delivered)
            .min(max_packets.min(buf.capacity()) as u64) as usize;

        let half_period = (sample_rate / 2.0).max(1.0) as u64;
        let extra_status = std::mem::take(&mut probe.pending_status);
        for ie in 0..n {
            let k = probe.delivered + ie as u64;
            let Some(mut packet) = buf.packet_mut(ie) else {
                break;
            };
            for it in 0..SAMPLES_PER_PACKET {
                let s = k * SAMPLES_PER_PACKET as u64 + it as u64;
                packet.set_timestamp(it, probe.timestamp);
                probe.timestamp = probe.timestamp.wrapping_add(1);
                for ch in 0..probe.layout.n_ap {
                    packet.set_ap(it, ch, sim_ap_value(ch, s));
                }
                // Sync line is high in even half-seconds; hardware reports it inverted
                let sync = if (s / half_period) % 2 == 0 { 0 } else { status::SYNC };
                let extra = if ie == 0 { extra_status } else { 0 };
                packet.set_status(it, sync | extra);
            }
            for ch in 0..probe.layout.n_lf {
                packet.set_lf(ch, sim_lf_value(ch, k));
            }
        }
        probe.delivered += n as u64;
        Ok(n)
    }

    fn fifo_state(&self, slot: u8, port: u8) -> HwResult<FifoState> {
        let mut st = self.inner.lock();
        st.log.check(calls::FIFO_STATE)?;
        let probe = st.probe_mut(calls::FIFO_STATE, slot, port)?;
        if let Some(pct) = probe.fill.pop_front() {
            probe.last_fill = pct.min(100);
        }
        let used = probe.last_fill as usize;
        Ok(FifoState {
            used,
            empty: 100 - used,
        })
    }
}

// =============================================================================
// SimMuxDaqHardware - Simulated Multiplexed DAQ
// =============================================================================

/// Analog value produced for `line` of `dev` at scan `scan`.
pub fn sim_analog_value(dev: DeviceId, line: usize, scan: u64) -> i16 {
    let base = match dev {
        DeviceId::Dev1 => 0,
        DeviceId::Dev2 => 1000,
    };
    ((base + 37 * line as u64 + 3 * scan) % 4096) as i16 - 2048
}

/// Digital word produced for `dev` at scan `scan`, masked to `bytes` bytes.
pub fn sim_digital_value(dev: DeviceId, scan: u64, bytes: usize) -> u32 {
    let salt: u32 = match dev {
        DeviceId::Dev1 => 0x0102_0304,
        DeviceId::Dev2 => 0x5060_7080,
    };
    let word = (scan as u32).wrapping_mul(0x9E37_79B1) ^ salt;
    match bytes {
        0 => 0,
        1..=3 => word & ((1u32 << (8 * bytes)) - 1),
        _ => word,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimClock {
    WallClock(Option<Instant>),
    Manual(u64),
}

#[derive(Debug)]
struct SimDevice {
    plan: TaskPlan,
    running: bool,
    analog_read: u64,
    digital_read: u64,
}

#[derive(Debug)]
struct SimMuxState {
    clock: SimClock,
    scan_rate: f64,
    devices: HashMap<DeviceId, SimDevice>,
    start_line: bool,
    dev2_shortfall: usize,
    log: CallLog,
}

impl SimMuxState {
    fn produced(&self) -> u64 {
        match self.clock {
            SimClock::WallClock(Some(t0)) => (t0.elapsed().as_secs_f64() * self.scan_rate) as u64,
            SimClock::WallClock(None) => 0,
            SimClock::Manual(n) => n,
        }
    }

    fn device(&mut self, call: &'static str, dev: DeviceId) -> HwResult<&mut SimDevice> {
        self.devices
            .get_mut(&dev)
            .ok_or_else(|| HardwareFault::new(call, -200_088, format!("no tasks on {dev}")))
    }

    fn grant(&mut self, dev: DeviceId, request: ReadRequest, available: u64, room: usize) -> usize {
        let n = match request {
            ReadRequest::Available => available.min(room as u64) as usize,
            ReadRequest::Exactly(k) => available.min(k as u64).min(room as u64) as usize,
        };
        if dev == DeviceId::Dev2 && self.dev2_shortfall > 0 {
            n.saturating_sub(std::mem::take(&mut self.dev2_shortfall))
        } else {
            n
        }
    }
}

/// Simulated one- or two-device clocked DAQ.
///
/// Both devices share one sample clock, started when dev1's tasks start
/// (dev2 is started first, as on real hardware, and waits for it).
#[derive(Debug)]
pub struct SimMuxDaqHardware {
    inner: Mutex<SimMuxState>,
}

impl SimMuxDaqHardware {
    fn with_clock(clock: SimClock) -> Self {
        Self {
            inner: Mutex::new(SimMuxState {
                clock,
                scan_rate: 0.0,
                devices: HashMap::new(),
                start_line: false,
                dev2_shortfall: 0,
                log: CallLog::default(),
            }),
        }
    }

    /// Scans accrue in real time at the task scan rate.
    pub fn new() -> Self {
        Self::with_clock(SimClock::WallClock(None))
    }

    /// Scans accrue only through [`SimMuxDaqHardware::advance`].
    pub fn manual() -> Self {
        Self::with_clock(SimClock::Manual(0))
    }

    /// Produce `scans` more scans on the manual clock.
    pub fn advance(&self, scans: u64) {
        if let SimClock::Manual(n) = &mut self.inner.lock().clock {
            *n += scans;
        }
    }

    /// Next dev2 read returns `scans` fewer scans than granted.
    pub fn inject_dev2_shortfall(&self, scans: usize) {
        self.inner.lock().dev2_shortfall = scans;
    }

    pub fn fail_next(&self, call: &'static str, code: i32, message: &str) {
        self.inner
            .lock()
            .log
            .faults
            .insert(call, HardwareFault::new(call, code, message));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().log.calls.clone()
    }

    pub fn start_line(&self) -> bool {
        self.inner.lock().start_line
    }

    /// Whether `dev` currently holds tasks (created and not yet cleared).
    pub fn has_tasks(&self, dev: DeviceId) -> bool {
        self.inner.lock().devices.contains_key(&dev)
    }
}

impl Default for SimMuxDaqHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl MuxDaqHardware for SimMuxDaqHardware {
    fn create_tasks(&self, dev: DeviceId, plan: &TaskPlan) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(
            calls::CREATE_TASKS,
            format!(
                "create_tasks({dev}, ai={}, di={})",
                plan.analog_lines, plan.digital_bytes
            ),
        )?;
        if plan.analog_lines == 0 {
            return Err(HardwareFault::new(
                calls::CREATE_TASKS,
                -200_477,
                "a sample clock needs at least one analog line",
            ));
        }
        st.scan_rate = plan.scan_rate;
        st.devices.insert(
            dev,
            SimDevice {
                plan: *plan,
                running: false,
                analog_read: 0,
                digital_read: 0,
            },
        );
        Ok(())
    }

    fn start_tasks(&self, dev: DeviceId) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::START_TASKS, format!("start_tasks({dev})"))?;
        st.device(calls::START_TASKS, dev)?.running = true;
        if dev == DeviceId::Dev1 {
            if let SimClock::WallClock(t0 @ None) = &mut st.clock {
                *t0 = Some(Instant::now());
            }
        }
        Ok(())
    }

    fn stop_tasks(&self, dev: DeviceId) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::STOP_TASKS, format!("stop_tasks({dev})"))?;
        st.device(calls::STOP_TASKS, dev)?.running = false;
        Ok(())
    }

    fn clear_tasks(&self, dev: DeviceId) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log.record(calls::CLEAR_TASKS, format!("clear_tasks({dev})"))?;
        st.devices
            .remove(&dev)
            .map(|_| ())
            .ok_or_else(|| HardwareFault::new(calls::CLEAR_TASKS, -200_088, format!("no tasks on {dev}")))
    }

    fn read_analog(&self, dev: DeviceId, request: ReadRequest, out: &mut [i16]) -> HwResult<usize> {
        let mut st = self.inner.lock();
        st.log.check(calls::READ_ANALOG)?;
        let produced = st.produced();
        let device = st.device(calls::READ_ANALOG, dev)?;
        if !device.running {
            return Ok(0);
        }
        let lines = device.plan.analog_lines;
        let first = device.analog_read;
        let available = produced.saturating_sub(first);
        let n = st.grant(dev, request, available, out.len() / lines);

        for (i, scan) in out.chunks_exact_mut(lines).take(n).enumerate() {
            for (line, v) in scan.iter_mut().enumerate() {
                *v = sim_analog_value(dev, line, first + i as u64);
            }
        }
        // Scans are consumed even when the read came back short
        let consumed = match request {
            ReadRequest::Available => n as u64,
            ReadRequest::Exactly(k) => available.min(k as u64),
        };
        st.device(calls::READ_ANALOG, dev)?.analog_read += consumed;
        Ok(n)
    }

    fn read_digital(&self, dev: DeviceId, request: ReadRequest, out: &mut [u32]) -> HwResult<usize> {
        let mut st = self.inner.lock();
        st.log.check(calls::READ_DIGITAL)?;
        let produced = st.produced();
        let device = st.device(calls::READ_DIGITAL, dev)?;
        if !device.running || device.plan.digital_bytes == 0 {
            return Ok(0);
        }
        let bytes = device.plan.digital_bytes;
        let first = device.digital_read;
        let available = produced.saturating_sub(first);
        let n = st.grant(dev, request, available, out.len());

        for (i, word) in out.iter_mut().take(n).enumerate() {
            *word = sim_digital_value(dev, first + i as u64, bytes);
        }
        let consumed = match request {
            ReadRequest::Available => n as u64,
            ReadRequest::Exactly(k) => available.min(k as u64),
        };
        st.device(calls::READ_DIGITAL, dev)?.digital_read += consumed;
        Ok(n)
    }

    fn set_start_line(&self, high: bool) -> HwResult<()> {
        let mut st = self.inner.lock();
        st.log
            .record(calls::START_LINE, format!("set_start_line({high})"))?;
        st.start_line = high;
        Ok(())
    }

    fn buffer_fill_percent(&self, dev: DeviceId) -> HwResult<u32> {
        let mut st = self.inner.lock();
        let produced = st.produced();
        let device = st.device("DAQmxGetReadAvailSampPerChan", dev)?;
        let pending = produced.saturating_sub(device.analog_read);
        let size = device.plan.buffer_scans.max(1) as u64;
        Ok(((100 * pending) / size).min(100) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> PacketLayout {
        PacketLayout::new(4, 4)
    }

    #[test]
    fn test_probe_streams_only_after_trigger() {
        let hw = SimProbeHardware::new(12_000.0).with_probe(2, 1, layout());
        hw.open_slot(2).unwrap();
        hw.open_probe(2, 1).unwrap();
        hw.arm(2).unwrap();

        let mut buf = PacketBuffer::new(layout(), 24).unwrap();
        assert_eq!(hw.read_packets(2, 1, &mut buf, 24).unwrap(), 0);

        hw.software_trigger(2).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let n = hw.read_packets(2, 1, &mut buf, 24).unwrap();
        assert!(n > 0 && n <= 24);

        let p = buf.packet(0).unwrap();
        let mut row = [0i16; 4];
        p.read_ap_row(1, &mut row);
        assert_eq!(row[2], sim_ap_value(2, 1));
        assert_eq!(p.timestamps()[1], 1);

        hw.arm(2).unwrap();
        assert_eq!(hw.read_packets(2, 1, &mut buf, 24).unwrap(), 0);
        assert_eq!(
            hw.calls(),
            vec!["open_slot(2)", "open_probe(2, 1)", "arm(2)", "software_trigger(2)", "arm(2)"]
        );
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let hw = SimProbeHardware::new(30_000.0).with_probe(2, 1, layout());
        hw.fail_next(calls::OPEN_SLOT, -3, "no base station");
        let err = hw.open_slot(2).unwrap_err();
        assert_eq!(err.code, -3);
        assert_eq!(err.call, "openBS");
        assert!(hw.open_slot(2).is_ok());
    }

    #[test]
    fn test_fill_profile_sticks_at_last_value() {
        let hw = SimProbeHardware::new(30_000.0).with_probe(3, 2, layout());
        hw.set_fill_profile(3, 2, [10, 50]);
        assert_eq!(hw.fifo_state(3, 2).unwrap().percent(), 10);
        assert_eq!(hw.fifo_state(3, 2).unwrap().percent(), 50);
        assert_eq!(hw.fifo_state(3, 2).unwrap().percent(), 50);
    }

    #[test]
    fn test_unknown_probe_faults() {
        let hw = SimProbeHardware::new(30_000.0);
        hw.open_slot(2).unwrap();
        assert!(hw.open_probe(2, 4).is_err());
    }

    fn plan(lines: usize, bytes: usize) -> TaskPlan {
        TaskPlan {
            analog_lines: lines,
            digital_bytes: bytes,
            scan_rate: 1000.0,
            buffer_scans: 100,
            range_volts: 2.5,
        }
    }

    #[test]
    fn test_manual_clock_reads() {
        let hw = SimMuxDaqHardware::manual();
        hw.create_tasks(DeviceId::Dev1, &plan(2, 1)).unwrap();
        hw.start_tasks(DeviceId::Dev1).unwrap();
        hw.advance(5);

        let mut ai = [0i16; 20];
        assert_eq!(hw.read_analog(DeviceId::Dev1, ReadRequest::Available, &mut ai).unwrap(), 5);
        assert_eq!(ai[3], sim_analog_value(DeviceId::Dev1, 1, 1));

        let mut di = [0u32; 10];
        assert_eq!(hw.read_digital(DeviceId::Dev1, ReadRequest::Exactly(3), &mut di).unwrap(), 3);
        assert_eq!(di[2], sim_digital_value(DeviceId::Dev1, 2, 1));
        assert!(di[2] <= 0xFF);

        // Analog consumed everything; digital has two left
        assert_eq!(hw.read_analog(DeviceId::Dev1, ReadRequest::Available, &mut ai).unwrap(), 0);
        assert_eq!(hw.read_digital(DeviceId::Dev1, ReadRequest::Available, &mut di).unwrap(), 2);
    }

    #[test]
    fn test_dev2_shortfall_is_one_shot() {
        let hw = SimMuxDaqHardware::manual();
        hw.create_tasks(DeviceId::Dev1, &plan(1, 0)).unwrap();
        hw.create_tasks(DeviceId::Dev2, &plan(1, 0)).unwrap();
        hw.start_tasks(DeviceId::Dev2).unwrap();
        hw.start_tasks(DeviceId::Dev1).unwrap();
        hw.advance(10);
        hw.inject_dev2_shortfall(2);

        let mut ai = [0i16; 10];
        assert_eq!(hw.read_analog(DeviceId::Dev2, ReadRequest::Exactly(6), &mut ai).unwrap(), 4);
        assert_eq!(hw.read_analog(DeviceId::Dev2, ReadRequest::Exactly(4), &mut ai).unwrap(), 4);
    }

    #[test]
    fn test_clear_releases_tasks() {
        let hw = SimMuxDaqHardware::manual();
        hw.create_tasks(DeviceId::Dev1, &plan(1, 0)).unwrap();
        hw.start_tasks(DeviceId::Dev1).unwrap();
        hw.stop_tasks(DeviceId::Dev1).unwrap();
        hw.clear_tasks(DeviceId::Dev1).unwrap();
        assert!(!hw.has_tasks(DeviceId::Dev1));

        let mut ai = [0i16; 4];
        let err = hw.read_analog(DeviceId::Dev1, ReadRequest::Available, &mut ai).unwrap_err();
        assert_eq!(err.call, calls::READ_ANALOG);
        assert!(hw.clear_tasks(DeviceId::Dev1).is_err());
    }

    #[test]
    fn test_digital_value_masking() {
        assert_eq!(sim_digital_value(DeviceId::Dev1, 7, 0), 0);
        assert!(sim_digital_value(DeviceId::Dev2, 7, 2) <= 0xFFFF);
        assert!(sim_digital_value(DeviceId::Dev2, 7, 3) <= 0xFF_FFFF);
    }
}
