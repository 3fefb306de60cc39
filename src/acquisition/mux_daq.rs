//! Multiplexed DAQ acquirer.
//!
//! One fetch thread reads the clocked devices, hands the raw scans to the
//! [`DemuxEngine`] and publishes whole timepoints to a single queue.
//!
//! Read order within an iteration fixes the timepoint framing: dev1's
//! first enabled class is read with "everything available" and its count
//! is authoritative; every other read asks for exactly that many scans.
//! A dev2 read that comes back short is a phase shift: logged, and the
//! iteration still uses dev1's count.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{AcqConfig, DeviceChannels, MuxDaqConfig, TimingConfig};
use crate::data::stream_queue::{MemoryStreamQueue, StreamQueue};
use crate::error::{AcqError, AcqResult, FatalErrorReporter};
use crate::hardware::capabilities::{DeviceId, MuxDaqHardware, ReadRequest, TaskPlan};

use super::demux::{DemuxEngine, MuxLayout};
use super::pacing::LoopPacer;
use super::pool::WorkerPool;
use super::run_state::{RunPhase, SharedRunState};
use super::{Acquirer, FifoStatus};

/// Stream name of the mux DAQ queue.
pub const MUX_STREAM: &str = "Mux DAQ";

/// In-memory queue sized for `seconds` of merged frames.
pub fn mux_queue(config: &MuxDaqConfig, seconds: f64) -> Arc<MemoryStreamQueue> {
    let layout = MuxLayout::from_config(config);
    Arc::new(MemoryStreamQueue::with_duration(
        MUX_STREAM,
        layout.frame_width(),
        config.sample_rate,
        seconds,
    ))
}

/// Fetch stage: device reads into the engine's raw buffers.
pub struct MuxDaqReader {
    hw: Arc<dyn MuxDaqHardware>,
    engine: DemuxEngine,
}

impl MuxDaqReader {
    pub fn new(hw: Arc<dyn MuxDaqHardware>, engine: DemuxEngine) -> Self {
        Self { hw, engine }
    }

    pub fn engine(&self) -> &DemuxEngine {
        &self.engine
    }

    /// Read every device once; returns the whole timepoints now ready.
    pub fn fetch_iteration(&mut self) -> AcqResult<usize> {
        self.engine.slide_remainder();
        let layout = *self.engine.layout();
        let (l1, xd1) = (layout.dev1.analog_lines(), layout.dev1.xd_bytes);
        let (l2, xd2) = (layout.dev2.analog_lines(), layout.dev2.xd_bytes);
        let dev1 = |f: crate::error::HardwareFault| f.at(DeviceId::Dev1.to_string());
        let dev2 = |f: crate::error::HardwareFault| f.at(DeviceId::Dev2.to_string());

        let hw = self.hw.as_ref();
        let slots = self.engine.fetch_slots();
        let mut n = 0;

        if l1 > 0 {
            n = hw
                .read_analog(DeviceId::Dev1, ReadRequest::Available, slots.ai1)
                .map_err(dev1)?;
            if n == 0 {
                return Ok(0);
            }
        }
        if xd1 > 0 {
            let request = if l1 > 0 {
                ReadRequest::Exactly(n)
            } else {
                ReadRequest::Available
            };
            n = hw.read_digital(DeviceId::Dev1, request, slots.di1).map_err(dev1)?;
            if n == 0 {
                return Ok(0);
            }
        }

        if layout.is_dual() {
            if l2 > 0 {
                let n2 = hw
                    .read_analog(DeviceId::Dev2, ReadRequest::Exactly(n), slots.ai2)
                    .map_err(dev2)?;
                if n2 != n {
                    tracing::warn!(dev1 = n, dev2 = n2, "Detected dev2-dev1 analog phase shift.");
                }
            }
            if xd2 > 0 {
                let n2 = hw
                    .read_digital(DeviceId::Dev2, ReadRequest::Exactly(n), slots.di2)
                    .map_err(dev2)?;
                if n2 != n {
                    tracing::warn!(dev1 = n, dev2 = n2, "Detected dev2-dev1 digital phase shift.");
                }
            }
        }

        Ok(self.engine.commit(n))
    }

    /// Merged frames for the timepoints returned by the last fetch.
    pub fn merged(&mut self, whole: usize) -> &[i16] {
        self.engine.demux_merge(whole)
    }
}

struct MuxLoop {
    run: Arc<SharedRunState>,
    hw: Arc<dyn MuxDaqHardware>,
    reader: MuxDaqReader,
    queue: Arc<dyn StreamQueue>,
    pacer: LoopPacer,
    empty_limit: u32,
    dual: bool,
    start_line: bool,
}

impl MuxLoop {
    fn start_tasks(&self) -> AcqResult<()> {
        // Secondary first so it is waiting on the shared clock
        if self.dual {
            self.hw
                .start_tasks(DeviceId::Dev2)
                .map_err(|f| f.at(DeviceId::Dev2.to_string()))?;
        }
        self.hw
            .start_tasks(DeviceId::Dev1)
            .map_err(|f| f.at(DeviceId::Dev1.to_string()))?;
        if self.start_line {
            self.hw
                .set_start_line(true)
                .map_err(|f| f.at("start line"))?;
        }
        Ok(())
    }

    fn run(mut self) -> u64 {
        if !self.run.worker_wait() {
            return 0;
        }
        let mut tot_pts = 0u64;
        match self.start_tasks() {
            Ok(()) => tot_pts = self.fetch_loop(),
            Err(e) => self.run.run_error(&e),
        }
        self.finish();
        tot_pts
    }

    fn fetch_loop(&mut self) -> u64 {
        let mut tot_pts = 0u64;
        let mut empty = 0u32;

        while !self.run.is_stopped() {
            let loop_t = Instant::now();

            let whole = match self.reader.fetch_iteration() {
                Ok(whole) => whole,
                Err(e) => {
                    self.run.run_error(&e);
                    break;
                }
            };

            if whole > 0 {
                let frames = self.reader.merged(whole);
                if self.run.is_stopped() {
                    break;
                }
                if tot_pts == 0 {
                    self.queue.begin_session(loop_t);
                }
                if let Err(e) = self.queue.enqueue(frames, whole) {
                    self.run.run_error(&e);
                    break;
                }
                tot_pts += whole as u64;
                empty = 0;
            } else {
                // USB devices return empty reads routinely
                empty += 1;
                if empty > self.empty_limit {
                    self.run.run_error(&AcqError::NoData {
                        stream: MUX_STREAM.to_string(),
                    });
                    break;
                }
            }

            if !self.pacer.tick(loop_t, &self.run) {
                break;
            }
        }
        tot_pts
    }

    fn finish(&self) {
        if self.start_line {
            if let Err(f) = self.hw.set_start_line(false) {
                tracing::warn!(error = %f, "Clearing start line failed");
            }
        }
        release_tasks(self.hw.as_ref(), self.dual);
    }
}

/// Stop and clear the tasks of every device in use.
fn release_tasks(hw: &dyn MuxDaqHardware, dual: bool) {
    let devices: &[DeviceId] = if dual {
        &[DeviceId::Dev1, DeviceId::Dev2]
    } else {
        &[DeviceId::Dev1]
    };
    for &dev in devices {
        if let Err(f) = hw.stop_tasks(dev) {
            tracing::warn!(device = %dev, error = %f, "Stopping tasks failed");
        }
        if let Err(f) = hw.clear_tasks(dev) {
            tracing::warn!(device = %dev, error = %f, "Clearing tasks failed");
        }
    }
}

/// Orchestrator for the multiplexed DAQ.
pub struct MuxDaqAcquirer {
    config: MuxDaqConfig,
    timing: TimingConfig,
    hw: Arc<dyn MuxDaqHardware>,
    reporter: Arc<dyn FatalErrorReporter>,
    run: Arc<SharedRunState>,
    queue: Arc<dyn StreamQueue>,
    layout: MuxLayout,
    configured: bool,
    pool: Option<WorkerPool<u64>>,
    frames: u64,
}

impl MuxDaqAcquirer {
    pub fn new(
        config: &AcqConfig,
        hw: Arc<dyn MuxDaqHardware>,
        queue: Arc<dyn StreamQueue>,
        reporter: Arc<dyn FatalErrorReporter>,
    ) -> AcqResult<Self> {
        let layout = MuxLayout::from_config(&config.mux_daq);
        if queue.channels() != layout.frame_width() {
            return Err(AcqError::Configuration(format!(
                "{MUX_STREAM}: queue has {} channels, frames are {} wide",
                queue.channels(),
                layout.frame_width()
            )));
        }
        Ok(Self {
            config: config.mux_daq.clone(),
            timing: config.timing.clone(),
            hw,
            run: Arc::new(SharedRunState::new(reporter.clone())),
            reporter,
            queue,
            layout,
            configured: false,
            pool: None,
            frames: 0,
        })
    }

    /// Channel layout of the merged frames.
    pub fn layout(&self) -> &MuxLayout {
        &self.layout
    }

    pub fn run_state(&self) -> Arc<SharedRunState> {
        self.run.clone()
    }

    /// Frames published by the last completed run.
    pub fn published_frames(&self) -> u64 {
        self.frames
    }

    /// Task plan for one device.
    pub fn task_plan(&self, dev: &DeviceChannels) -> TaskPlan {
        let kmux = self.layout.kmux;
        let max_muxed = (kmux as f64 * self.timing.mux_latency_secs * self.config.sample_rate) as usize;
        TaskPlan {
            // A digital-only device still needs an analog task to clock it
            analog_lines: dev.analog_lines().max(1),
            digital_bytes: dev.xd_bytes,
            scan_rate: self.config.sample_rate * kmux as f64,
            buffer_scans: max_muxed + kmux,
            range_volts: self.config.range_max_volts,
        }
    }

    /// Loop period: slower when digital lines make fetches expensive.
    pub fn loop_period(&self) -> Duration {
        let digital = self.layout.dev1.xd_bytes + self.layout.dev2.xd_bytes > 0;
        let factor = if digital { 2.0 } else { 0.1 };
        Duration::from_micros((1000.0 * self.timing.mux_fetch_period_ms as f64 * factor) as u64)
    }
}

impl Acquirer for MuxDaqAcquirer {
    fn name(&self) -> &str {
        "mux-daq"
    }

    fn configure(&mut self) -> AcqResult<()> {
        if self.run.phase() == RunPhase::Terminated {
            self.run = Arc::new(SharedRunState::new(self.reporter.clone()));
        }
        self.hw
            .create_tasks(DeviceId::Dev1, &self.task_plan(&self.layout.dev1))
            .map_err(|f| f.at(DeviceId::Dev1.to_string()))?;
        if self.run.is_stopped() {
            return Err(AcqError::Stopped);
        }
        if self.layout.is_dual() {
            self.hw
                .create_tasks(DeviceId::Dev2, &self.task_plan(&self.layout.dev2))
                .map_err(|f| f.at(DeviceId::Dev2.to_string()))?;
        }
        self.configured = true;
        tracing::info!(
            kmux = self.layout.kmux,
            channels = self.layout.frame_width(),
            dual = self.layout.is_dual(),
            "Mux DAQ configured"
        );
        Ok(())
    }

    fn run(&mut self) -> AcqResult<()> {
        if !self.configured {
            return Err(AcqError::Configuration("mux DAQ must be configured before run".into()));
        }
        if self.pool.is_some() {
            return Err(AcqError::Configuration("mux DAQ already running".into()));
        }

        let engine = DemuxEngine::with_latency(
            self.layout,
            self.config.sample_rate,
            self.timing.mux_latency_secs,
        )?;
        let body = MuxLoop {
            run: self.run.clone(),
            hw: self.hw.clone(),
            reader: MuxDaqReader::new(self.hw.clone(), engine),
            queue: self.queue.clone(),
            pacer: LoopPacer::new(self.loop_period(), self.timing.mux_pacing_ceiling()),
            empty_limit: self.timing.mux_empty_fetch_limit,
            dual: self.layout.is_dual(),
            start_line: self.config.start_line_enabled,
        };

        self.run.expect_workers(1);
        let mut pool = WorkerPool::new();
        pool.spawn("mux-daq", move || body.run())?;
        self.pool = Some(pool);

        if !self.run.wait_all_asleep(None) {
            self.stop();
            return Err(AcqError::Stopped);
        }
        self.run.wake_all();
        tracing::info!(period_us = self.loop_period().as_micros() as u64, "Mux DAQ running");
        Ok(())
    }

    fn fifo_status(&self) -> Vec<FifoStatus> {
        let percent = match self.hw.buffer_fill_percent(DeviceId::Dev1) {
            Ok(pct) => pct,
            Err(f) => {
                tracing::warn!(error = %f, "Mux DAQ buffer query failed");
                0
            }
        };
        vec![FifoStatus {
            stream: MUX_STREAM.to_string(),
            percent,
        }]
    }

    fn stop(&mut self) {
        self.run.request_stop();
        match self.pool.take() {
            Some(pool) => {
                let outcome = pool.join_with_timeout(self.timing.join_timeout(), self.timing.join_poll());
                self.frames = outcome.results.iter().map(|(_, n)| n).sum();
                tracing::debug!(frames = self.frames, "Mux DAQ frames published");
            }
            // Configured but never run: the fetch thread's teardown never happened
            None if self.configured => release_tasks(self.hw.as_ref(), self.layout.is_dual()),
            None => {}
        }
        self.configured = false;
        self.run.mark_terminated();
    }

    fn is_running(&self) -> bool {
        self.pool.is_some() && !self.run.is_stopped()
    }
}

impl Drop for MuxDaqAcquirer {
    fn drop(&mut self) {
        if self.pool.is_some() || self.configured {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceChannels;
    use crate::hardware::mock::{sim_analog_value, sim_digital_value, SimMuxDaqHardware};
    use tracing_test::traced_test;

    fn dev(mn: usize, ma: usize, xa: usize, xd_bytes: usize) -> DeviceChannels {
        DeviceChannels { mn, ma, xa, xd_bytes }
    }

    fn started(layout: MuxLayout) -> (Arc<SimMuxDaqHardware>, MuxDaqReader) {
        let hw = Arc::new(SimMuxDaqHardware::manual());
        let plan = |d: &DeviceChannels| TaskPlan {
            analog_lines: d.analog_lines().max(1),
            digital_bytes: d.xd_bytes,
            scan_rate: 1000.0,
            buffer_scans: 64,
            range_volts: 2.5,
        };
        hw.create_tasks(DeviceId::Dev1, &plan(&layout.dev1)).unwrap();
        if layout.is_dual() {
            hw.create_tasks(DeviceId::Dev2, &plan(&layout.dev2)).unwrap();
            hw.start_tasks(DeviceId::Dev2).unwrap();
        }
        hw.start_tasks(DeviceId::Dev1).unwrap();
        let engine = DemuxEngine::new(layout, 64).unwrap();
        (hw.clone(), MuxDaqReader::new(hw, engine))
    }

    #[traced_test]
    #[test]
    fn test_dev2_shortfall_logs_phase_shift() {
        let layout = MuxLayout::new(2, dev(1, 0, 0, 0), dev(1, 0, 0, 0));
        let (hw, mut reader) = started(layout);
        hw.advance(10);
        hw.inject_dev2_shortfall(2);

        // dev1's count stays authoritative
        assert_eq!(reader.fetch_iteration().unwrap(), 5);
        assert!(logs_contain("Detected dev2-dev1 analog phase shift."));
        assert!(!logs_contain("digital phase shift"));
    }

    #[traced_test]
    #[test]
    fn test_matched_devices_log_nothing() {
        let layout = MuxLayout::new(2, dev(1, 0, 0, 1), dev(1, 0, 0, 1));
        let (hw, mut reader) = started(layout);
        hw.advance(6);
        assert_eq!(reader.fetch_iteration().unwrap(), 3);
        assert!(!logs_contain("phase shift"));
    }

    #[test]
    fn test_digital_only_device_reads_digital() {
        let layout = MuxLayout::new(1, dev(0, 0, 0, 2), DeviceChannels::default());
        let (hw, mut reader) = started(layout);
        hw.advance(3);
        assert_eq!(reader.fetch_iteration().unwrap(), 3);
        let frames = reader.merged(3).to_vec();
        let expected: Vec<i16> = (0..3)
            .map(|s| sim_digital_value(DeviceId::Dev1, s, 2) as u16 as i16)
            .collect();
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_empty_read_returns_zero() {
        let layout = MuxLayout::new(4, dev(2, 0, 0, 0), DeviceChannels::default());
        let (hw, mut reader) = started(layout);
        assert_eq!(reader.fetch_iteration().unwrap(), 0);
        hw.advance(6);
        assert_eq!(reader.fetch_iteration().unwrap(), 1);
        assert_eq!(reader.engine().remainder(), 2);
        let frames = reader.merged(1).to_vec();
        // Line 1, mux slot 3 is logical channel 7
        assert_eq!(frames[7], sim_analog_value(DeviceId::Dev1, 1, 3));
    }

    #[test]
    fn test_read_fault_names_device() {
        let layout = MuxLayout::new(1, dev(1, 0, 0, 0), DeviceChannels::default());
        let (hw, mut reader) = started(layout);
        hw.fail_next(crate::hardware::mock::calls::READ_ANALOG, -200_279, "buffer overwritten");
        let err = reader.fetch_iteration().unwrap_err();
        assert_eq!(
            err.to_string(),
            "DAQmxReadBinaryI16(dev1) error code -200279 'buffer overwritten'"
        );
    }

    #[test]
    fn test_loop_period_and_plan() {
        let mut config = AcqConfig::default();
        config.mux_daq.mux_factor = 8;
        config.mux_daq.sample_rate = 1000.0;
        config.mux_daq.dev1 = dev(0, 0, 0, 1);
        let queue = mux_queue(&config.mux_daq, 1.0);
        let hw = Arc::new(SimMuxDaqHardware::manual());
        let acq = MuxDaqAcquirer::new(&config, hw, queue, Arc::new(crate::error::LogReporter)).unwrap();

        assert_eq!(acq.loop_period(), Duration::from_millis(2));
        let plan = acq.task_plan(&config.mux_daq.dev1);
        assert_eq!(plan.analog_lines, 1);
        assert_eq!(plan.scan_rate, 8000.0);
        assert_eq!(plan.buffer_scans, 8 * 2000 + 8);
    }

    #[test]
    fn test_stop_without_run_clears_tasks() {
        let mut config = AcqConfig::default();
        config.mux_daq.dual_device = true;
        config.mux_daq.dev1 = dev(1, 0, 0, 0);
        config.mux_daq.dev2 = dev(1, 0, 0, 0);
        let queue = mux_queue(&config.mux_daq, 1.0);
        let hw = Arc::new(SimMuxDaqHardware::manual());
        let mut acq = MuxDaqAcquirer::new(&config, hw.clone(), queue, Arc::new(crate::error::LogReporter)).unwrap();

        acq.configure().unwrap();
        assert!(hw.has_tasks(DeviceId::Dev1) && hw.has_tasks(DeviceId::Dev2));
        acq.stop();
        assert!(!hw.has_tasks(DeviceId::Dev1));
        assert!(!hw.has_tasks(DeviceId::Dev2));

        // A second stop has nothing left to release
        let n = hw.calls().len();
        acq.stop();
        assert_eq!(hw.calls().len(), n);
    }
}
