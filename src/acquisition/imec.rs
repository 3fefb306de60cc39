//! Probe front-end acquirer.
//!
//! [`ImecAcquirer`] owns the hardware lifecycle for every configured probe:
//!
//! - **configure**: open slots, program sync, open/calibrate/set up each
//!   probe, select the trigger input and arm every slot
//! - **run**: spawn one [`ImecWorker`] per probe group, wait until all are
//!   parked on the barrier, trigger, then release them together
//! - **update**: live-reconfigure one probe by pausing only its slot (see
//!   below) while every other slot keeps streaming
//! - **stop**: stop flag, bounded join, close slots
//!
//! # Live update
//!
//! `update` sets the slot as pause target with a quorum equal to the number
//! of probes on that slot, then polls until every one of them has been
//! acknowledged by its worker. Only then is the slot disarmed, rewritten,
//! re-armed and re-triggered. Clearing the target lets the workers resume;
//! each publishes a zero-fill gap before its next block so sample counts
//! stay aligned with wall time.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{
    AcqConfig, CalibrationPolicy, ImecConfig, ProbeConfig, ProbeSettings, SyncSource, TimingConfig,
    TriggerSource,
};
use crate::data::stream_queue::{MemoryStreamQueue, StreamQueue};
use crate::error::{AcqError, AcqResult, FatalErrorReporter};
use crate::hardware::capabilities::{ProbeHardware, SyncMode};

use super::pool::WorkerPool;
use super::probe::{group_probes, ProbeDescriptor};
use super::run_state::{RunPhase, SharedRunState};
use super::worker::{fifo_percent, ImecWorker, TimestampHistogram, WorkerProbe, WorkerReport, WorkerTiming};
use super::{Acquirer, FifoStatus};

fn slot_target(slot: u8) -> String {
    format!("slot {slot}")
}

/// Sync role of `slot` under the configured sync source.
pub fn sync_mode(sync: SyncSource, slot: u8) -> SyncMode {
    match sync {
        SyncSource::None => SyncMode::Disabled,
        SyncSource::Imec { slot: source } if source == slot => SyncMode::Source,
        SyncSource::Imec { .. } | SyncSource::External { .. } | SyncSource::MuxDaq => SyncMode::Input,
    }
}

/// One in-memory queue per configured probe, sized for `seconds` of data.
pub fn probe_queues(config: &ImecConfig, seconds: f64) -> Vec<Arc<MemoryStreamQueue>> {
    config
        .probes
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let desc = ProbeDescriptor::from_config(i, p);
            Arc::new(MemoryStreamQueue::with_duration(
                desc.name(),
                desc.frame_width(),
                config.sample_rate,
                seconds,
            ))
        })
        .collect()
}

/// Orchestrator for the probe front end.
pub struct ImecAcquirer {
    config: ImecConfig,
    timing: TimingConfig,
    hw: Arc<dyn ProbeHardware>,
    reporter: Arc<dyn FatalErrorReporter>,
    run: Arc<SharedRunState>,
    probes: Vec<ProbeDescriptor>,
    queues: Vec<Arc<dyn StreamQueue>>,
    open_slots: Vec<u8>,
    pool: Option<WorkerPool<WorkerReport>>,
    histogram: TimestampHistogram,
    frames: Vec<(usize, u64)>,
}

impl ImecAcquirer {
    /// `queues[i]` receives the frames of `config.imec.probes[i]`.
    pub fn new(
        config: &AcqConfig,
        hw: Arc<dyn ProbeHardware>,
        queues: Vec<Arc<dyn StreamQueue>>,
        reporter: Arc<dyn FatalErrorReporter>,
    ) -> AcqResult<Self> {
        let imec = config.imec.clone();
        if queues.len() != imec.probes.len() {
            return Err(AcqError::Configuration(format!(
                "{} probes configured but {} queues supplied",
                imec.probes.len(),
                queues.len()
            )));
        }
        let probes = imec
            .probes
            .iter()
            .enumerate()
            .map(|(i, p)| ProbeDescriptor::from_config(i, p))
            .collect();

        Ok(Self {
            config: imec,
            timing: config.timing.clone(),
            hw,
            run: Arc::new(SharedRunState::new(reporter.clone())),
            reporter,
            probes,
            queues,
            open_slots: Vec::new(),
            pool: None,
            histogram: TimestampHistogram::default(),
            frames: Vec::new(),
        })
    }

    /// State of the current (or last) run.
    pub fn run_state(&self) -> Arc<SharedRunState> {
        self.run.clone()
    }

    /// One descriptor per configured probe, in config order.
    pub fn probes(&self) -> &[ProbeDescriptor] {
        &self.probes
    }

    /// Current settings of probe `ip`, including live updates.
    pub fn settings(&self, ip: usize) -> Option<&ProbeSettings> {
        self.config.probes.get(ip).map(|p| &p.settings)
    }

    /// Timestamp deltas of the last run, merged across workers.
    pub fn histogram(&self) -> &TimestampHistogram {
        &self.histogram
    }

    /// `(probe index, frames published)` from the last run's workers.
    pub fn published_frames(&self) -> &[(usize, u64)] {
        &self.frames
    }

    fn check_stop(&self) -> AcqResult<()> {
        if self.run.is_stopped() {
            Err(AcqError::Stopped)
        } else {
            Ok(())
        }
    }

    fn calibrate(&self, probe: &ProbeConfig, desc: &ProbeDescriptor) -> AcqResult<()> {
        match self.config.calibration_policy {
            CalibrationPolicy::Skip => {
                tracing::debug!(probe = desc.index, "Calibration skipped");
                Ok(())
            }
            _ if probe.calibrated => self
                .hw
                .calibrate(desc.slot, desc.port)
                .map_err(|f| f.at(desc.target())),
            CalibrationPolicy::Required => Err(AcqError::Configuration(format!(
                "{}: ADC and gain calibration missing or invalid",
                desc.name()
            ))),
            CalibrationPolicy::Warn => {
                tracing::warn!(probe = desc.index, "Running without valid calibration");
                Ok(())
            }
        }
    }

    fn configure_probe(&self, probe: &ProbeConfig, desc: &ProbeDescriptor) -> AcqResult<()> {
        let at = |f: crate::error::HardwareFault| f.at(desc.target());
        self.hw.open_probe(desc.slot, desc.port).map_err(at)?;
        self.calibrate(probe, desc)?;
        self.hw.set_led(desc.slot, desc.port, probe.led).map_err(at)?;
        self.hw
            .write_probe_settings(desc.slot, desc.port, &probe.settings)
            .map_err(at)?;
        tracing::debug!(probe = desc.index, slot = desc.slot, port = desc.port, "Probe configured");
        Ok(())
    }

    fn start_streams(&self) -> AcqResult<()> {
        match self.config.trigger {
            TriggerSource::Software => {
                for &slot in &self.open_slots {
                    self.hw
                        .software_trigger(slot)
                        .map_err(|f| f.at(slot_target(slot)))?;
                }
                Ok(())
            }
            TriggerSource::Hardware => {
                tracing::info!("Imec waiting for external trigger");
                Ok(())
            }
        }
    }

    fn spawn_workers(&self) -> AcqResult<WorkerPool<WorkerReport>> {
        let timing = WorkerTiming::from_config(&self.timing);
        let groups = group_probes(&self.probes, self.timing.probes_per_worker);
        self.run.expect_workers(groups.len());

        let mut pool = WorkerPool::new();
        for (id, group) in groups.into_iter().enumerate() {
            let probes = group
                .into_iter()
                .map(|d| WorkerProbe::new(d, self.queues[d.index].clone(), timing.packets_per_fetch))
                .collect::<AcqResult<Vec<_>>>();
            let spawned = probes.and_then(|probes| {
                let worker = ImecWorker::new(id, self.hw.clone(), self.run.clone(), timing, probes);
                pool.spawn(format!("imec-worker-{id}"), move || worker.run())
            });
            if let Err(e) = spawned {
                self.run.request_stop();
                pool.join_with_timeout(self.timing.join_timeout(), self.timing.join_poll());
                return Err(e);
            }
        }
        Ok(pool)
    }

    /// Hardware steps of a live update; the slot must already be quiescent.
    fn reconfigure(&self, desc: &ProbeDescriptor, settings: &ProbeSettings) -> AcqResult<()> {
        let slot = desc.slot;
        let at_slot = |f: crate::error::HardwareFault| f.at(slot_target(slot));
        self.hw.arm(slot).map_err(at_slot)?;
        self.hw
            .write_probe_settings(slot, desc.port, settings)
            .map_err(|f| f.at(desc.target()))?;
        self.hw
            .set_trigger_input(slot, TriggerSource::Software)
            .map_err(at_slot)?;
        self.hw.arm(slot).map_err(at_slot)?;
        self.hw.software_trigger(slot).map_err(at_slot)
    }
}

impl Acquirer for ImecAcquirer {
    fn name(&self) -> &str {
        "imec"
    }

    fn configure(&mut self) -> AcqResult<()> {
        if self.run.phase() == RunPhase::Terminated {
            self.run = Arc::new(SharedRunState::new(self.reporter.clone()));
        }
        let slots = self.config.slots();

        for &slot in &slots {
            self.check_stop()?;
            self.hw.open_slot(slot).map_err(|f| f.at(slot_target(slot)))?;
            self.open_slots.push(slot);
            tracing::info!(slot, "Slot opened");
        }

        for &slot in &slots {
            self.check_stop()?;
            let mode = sync_mode(self.config.sync, slot);
            self.hw
                .configure_sync(slot, mode)
                .map_err(|f| f.at(slot_target(slot)))?;
        }

        for (probe, desc) in self.config.probes.iter().zip(&self.probes) {
            self.check_stop()?;
            self.configure_probe(probe, desc)?;
        }

        for &slot in &slots {
            self.check_stop()?;
            self.hw
                .set_trigger_input(slot, self.config.trigger)
                .map_err(|f| f.at(slot_target(slot)))?;
        }

        for &slot in &slots {
            self.check_stop()?;
            self.hw.arm(slot).map_err(|f| f.at(slot_target(slot)))?;
        }

        tracing::info!(
            probes = self.probes.len(),
            slots = slots.len(),
            sync = ?self.config.sync,
            "Imec configured"
        );
        Ok(())
    }

    fn run(&mut self) -> AcqResult<()> {
        if self.pool.is_some() {
            return Err(AcqError::Configuration("imec acquisition already running".into()));
        }
        let pool = self.spawn_workers()?;
        let workers = pool.len();
        self.pool = Some(pool);

        if !self.run.wait_all_asleep(None) {
            self.stop();
            return Err(AcqError::Stopped);
        }
        if let Err(e) = self.start_streams() {
            self.stop();
            return Err(e);
        }
        self.run.wake_all();
        tracing::info!(workers, probes = self.probes.len(), "Imec acquisition running");
        Ok(())
    }

    fn fifo_status(&self) -> Vec<FifoStatus> {
        self.probes
            .iter()
            .map(|d| FifoStatus {
                stream: d.name(),
                percent: fifo_percent(self.hw.as_ref(), &self.run, d),
            })
            .collect()
    }

    fn update(&mut self, probe: usize, settings: ProbeSettings) -> AcqResult<()> {
        let desc = *self
            .probes
            .get(probe)
            .ok_or_else(|| AcqError::Configuration(format!("no probe {probe} to update")))?;

        if self.pool.is_none() {
            // Not streaming: takes effect at the next configure
            self.config.probes[probe].settings = settings;
            return Ok(());
        }

        let required = self.probes.iter().filter(|p| p.slot == desc.slot).count();
        tracing::info!(probe, slot = desc.slot, required, "Pausing slot for update");
        self.run.pause_slot(Some(desc.slot), required);

        let poll = (self.timing.imec_loop_period() / 8).max(Duration::from_micros(100));
        if !self.run.wait_for_pause_quorum(poll, None) {
            self.run.pause_slot(None, 0);
            return Err(AcqError::Stopped);
        }

        let result = self.reconfigure(&desc, &settings);
        self.run.pause_slot(None, 0);

        match result {
            Ok(()) => {
                self.config.probes[probe].settings = settings;
                tracing::info!(probe, slot = desc.slot, "Probe updated; slot resumed");
                Ok(())
            }
            Err(e) => {
                self.run.run_error(&e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        self.run.request_stop();

        if let Some(pool) = self.pool.take() {
            let outcome = pool.join_with_timeout(self.timing.join_timeout(), self.timing.join_poll());
            self.histogram = TimestampHistogram::default();
            self.frames.clear();
            for (_, report) in &outcome.results {
                self.histogram.merge(&report.histogram);
                self.frames.extend_from_slice(&report.frames);
            }
            self.frames.sort_unstable();
            for &(probe, frames) in &self.frames {
                tracing::debug!(probe, frames, "Probe frames published");
            }
            tracing::info!(histogram = %self.histogram, "Timestamp delta histogram");
        }

        for slot in self.open_slots.drain(..) {
            if let Err(f) = self.hw.close_slot(slot) {
                tracing::warn!(slot, error = %f.at(slot_target(slot)), "Closing slot failed");
            }
        }
        self.run.mark_terminated();
    }

    fn is_running(&self) -> bool {
        self.pool.is_some() && !self.run.is_stopped()
    }
}

impl Drop for ImecAcquirer {
    fn drop(&mut self) {
        if self.pool.is_some() || !self.open_slots.is_empty() {
            self.stop();
        }
    }
}
