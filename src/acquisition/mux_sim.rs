//! Synthetic mux DAQ generator.
//!
//! Produces merged frames directly, in the same channel order the demux
//! engine emits: a 1 s period sine on every neural channel (100 uV at the
//! neural gain), a larger one on the auxiliary analog channels, and zero
//! digital words.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{AcqConfig, MuxDaqConfig, TimingConfig};
use crate::data::stream_queue::StreamQueue;
use crate::error::{AcqError, AcqResult, FatalErrorReporter};

use super::demux::MuxLayout;
use super::mux_daq::MUX_STREAM;
use super::pacing::{sine_counts, GeneratorClock};
use super::pool::WorkerPool;
use super::run_state::{RunPhase, SharedRunState};
use super::{Acquirer, FifoStatus};

const NEURAL_VOLTS: f64 = 100e-6;
const AUX_VOLTS: f64 = 2.2;

struct MuxSimStream {
    layout: MuxLayout,
    config: MuxDaqConfig,
    queue: Arc<dyn StreamQueue>,
}

impl MuxSimStream {
    fn fill(&self, buf: &mut Vec<i16>, clock: &GeneratorClock, n: usize) -> AcqResult<()> {
        let width = self.layout.frame_width();
        buf.clear();
        buf.try_reserve(n * width).map_err(|_| AcqError::OutOfMemory {
            stream: MUX_STREAM.to_string(),
            frames: n,
        })?;
        buf.resize(n * width, 0);

        let (range, gains) = (self.config.range_max_volts, self.config.gains);
        let n_mn = self.layout.neural_channels();
        let n_ma = self.layout.aux_channels();
        let n_xa = self.layout.xa_channels();

        for (i, frame) in buf.chunks_exact_mut(width).enumerate() {
            let t = clock.frame_time(i);
            let (mn, rest) = frame.split_at_mut(n_mn);
            let (ma, rest) = rest.split_at_mut(n_ma);
            let (xa, _digital) = rest.split_at_mut(n_xa);
            mn.fill(sine_counts(NEURAL_VOLTS, gains.mn, range, t));
            ma.fill(sine_counts(AUX_VOLTS, gains.ma, range, t));
            xa.fill(sine_counts(AUX_VOLTS, gains.xa, range, t));
        }
        Ok(())
    }
}

fn generate(run: Arc<SharedRunState>, stream: MuxSimStream, timing: TimingConfig) -> u64 {
    if !run.worker_wait() {
        return 0;
    }
    let t0 = run.start_instant().unwrap_or_else(Instant::now);
    stream.queue.begin_session(t0);

    let mut clock = GeneratorClock::new(t0, stream.config.sample_rate, timing.sim_loop());
    let mut buf = Vec::new();
    loop {
        let loop_t = Instant::now();
        let n = clock.due();
        if n > 0 {
            if let Err(e) = stream
                .fill(&mut buf, &clock, n)
                .and_then(|()| stream.queue.enqueue(&buf, n))
            {
                run.run_error(&e);
                break;
            }
            clock.advance(n);
        }
        if !clock.sleep_balance(loop_t, &run) {
            break;
        }
    }
    clock.produced()
}

/// Generator standing in for the mux DAQ devices.
pub struct MuxDaqSimAcquirer {
    config: MuxDaqConfig,
    timing: TimingConfig,
    reporter: Arc<dyn FatalErrorReporter>,
    run: Arc<SharedRunState>,
    layout: MuxLayout,
    queue: Arc<dyn StreamQueue>,
    pool: Option<WorkerPool<u64>>,
}

impl MuxDaqSimAcquirer {
    pub fn new(
        config: &AcqConfig,
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
            run: Arc::new(SharedRunState::new(reporter.clone())),
            reporter,
            layout,
            queue,
            pool: None,
        })
    }

    pub fn run_state(&self) -> Arc<SharedRunState> {
        self.run.clone()
    }
}

impl Acquirer for MuxDaqSimAcquirer {
    fn name(&self) -> &str {
        "mux-daq-sim"
    }

    fn configure(&mut self) -> AcqResult<()> {
        if self.run.phase() == RunPhase::Terminated {
            self.run = Arc::new(SharedRunState::new(self.reporter.clone()));
        }
        tracing::info!(
            channels = self.layout.frame_width(),
            rate = self.config.sample_rate,
            "Mux DAQ simulation configured"
        );
        Ok(())
    }

    fn run(&mut self) -> AcqResult<()> {
        if self.pool.is_some() {
            return Err(AcqError::Configuration("mux DAQ simulation already running".into()));
        }
        self.run.expect_workers(1);
        let stream = MuxSimStream {
            layout: self.layout,
            config: self.config.clone(),
            queue: self.queue.clone(),
        };
        let (run, timing) = (self.run.clone(), self.timing.clone());
        let mut pool = WorkerPool::new();
        pool.spawn("mux-daq-sim", move || generate(run, stream, timing))?;
        self.pool = Some(pool);

        if !self.run.wait_all_asleep(None) {
            self.stop();
            return Err(AcqError::Stopped);
        }
        self.run.wake_all();
        tracing::info!("Mux DAQ simulation running");
        Ok(())
    }

    fn fifo_status(&self) -> Vec<FifoStatus> {
        vec![FifoStatus {
            stream: MUX_STREAM.to_string(),
            percent: self.queue.fill_percent(),
        }]
    }

    fn stop(&mut self) {
        self.run.request_stop();
        if let Some(pool) = self.pool.take() {
            let outcome = pool.join_with_timeout(self.timing.join_timeout(), self.timing.join_poll());
            for (_, frames) in outcome.results {
                tracing::debug!(frames, "Mux DAQ simulation frames generated");
            }
        }
        self.run.mark_terminated();
    }

    fn is_running(&self) -> bool {
        self.pool.is_some() && !self.run.is_stopped()
    }
}

impl Drop for MuxDaqSimAcquirer {
    fn drop(&mut self) {
        if self.pool.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::mux_daq::mux_queue;
    use crate::config::DeviceChannels;
    use crate::data::stream_queue::{MemoryStreamQueue, QueueEntry};
    use crate::error::LogReporter;
    use std::time::Duration;

    fn config() -> AcqConfig {
        let mut config = AcqConfig::default();
        config.timing.sim_loop_ms = 5;
        config.mux_daq.enabled = true;
        config.mux_daq.sample_rate = 1000.0;
        config.mux_daq.mux_factor = 2;
        config.mux_daq.dev1 = DeviceChannels {
            mn: 2,
            ma: 1,
            xa: 1,
            xd_bytes: 1,
        };
        config
    }

    #[test]
    fn test_frame_layout_matches_demux_order() {
        let config = config();
        let layout = MuxLayout::from_config(&config.mux_daq);
        // 2 lines x 2 + 1 line x 2 + 1 xa + 1 digital word
        assert_eq!(layout.frame_width(), 8);

        let stream = MuxSimStream {
            layout,
            config: config.mux_daq.clone(),
            queue: Arc::new(MemoryStreamQueue::new("m", 8, 4.0, 10)),
        };
        let clock = GeneratorClock::new(Instant::now(), 4.0, Duration::from_millis(5));
        let mut buf = Vec::new();
        stream.fill(&mut buf, &clock, 2).unwrap();

        // Quarter period: sine at its peak
        let peak = &buf[8..16];
        let mn = sine_counts(NEURAL_VOLTS, 200.0, 2.5, 0.25);
        let aux = sine_counts(AUX_VOLTS, 1.0, 2.5, 0.25);
        assert_eq!(&peak[..4], &[mn; 4]);
        assert_eq!(&peak[4..7], &[aux; 3]);
        assert_eq!(peak[7], 0);
        assert!(mn > 0 && aux > mn);
    }

    #[test]
    fn test_generator_runs_and_restarts() {
        let config = config();
        let queue = mux_queue(&config.mux_daq, 5.0);
        let mut acq = MuxDaqSimAcquirer::new(&config, queue.clone(), Arc::new(LogReporter)).unwrap();

        for _ in 0..2 {
            acq.configure().unwrap();
            acq.run().unwrap();
            std::thread::sleep(Duration::from_millis(100));
            acq.stop();
        }
        assert!(!acq.is_running());

        let totals = queue.totals();
        assert!(totals.data_frames >= 150, "{} frames", totals.data_frames);
        assert!(matches!(queue.snapshot()[0], QueueEntry::Samples { .. }));
    }
}
