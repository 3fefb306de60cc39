//! Synthetic probe generator.
//!
//! Stands in for the probe front end when no hardware is attached. One
//! generator thread fills every probe queue with a 1 s period sine on the
//! AP and LF channels (100 uV at the configured gain) and a sync word whose
//! bit 6 toggles every half second. Data are produced against the wall
//! clock from the common start instant, which begins every queue's
//! session: time-zero on the first run, the end of the idle gap on a
//! restart.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{AcqConfig, ImecConfig, ProbeSettings, TimingConfig};
use crate::data::stream_queue::StreamQueue;
use crate::error::{AcqError, AcqResult, FatalErrorReporter};
use crate::hardware::packet::status;

use super::pacing::{sine_counts, GeneratorClock};
use super::pool::WorkerPool;
use super::probe::ProbeDescriptor;
use super::run_state::{RunPhase, SharedRunState};
use super::{Acquirer, FifoStatus};

/// Probe input range, volts.
const PROBE_RANGE_VOLTS: f64 = 0.6;
const SIGNAL_VOLTS: f64 = 100e-6;

struct SimStream {
    desc: ProbeDescriptor,
    ap_gain: f64,
    lf_gain: f64,
    queue: Arc<dyn StreamQueue>,
}

impl SimStream {
    fn fill(&self, buf: &mut Vec<i16>, clock: &GeneratorClock, n: usize) -> AcqResult<()> {
        let width = self.desc.frame_width();
        let len = n * width;
        buf.clear();
        buf.try_reserve(len).map_err(|_| AcqError::OutOfMemory {
            stream: self.desc.name(),
            frames: n,
        })?;
        buf.resize(len, 0);

        let (n_ap, n_lf) = (self.desc.n_ap, self.desc.n_lf);
        for (i, frame) in buf.chunks_exact_mut(width).enumerate() {
            let t = clock.frame_time(i);
            let ap = sine_counts(SIGNAL_VOLTS, self.ap_gain, PROBE_RANGE_VOLTS, t);
            let lf = sine_counts(SIGNAL_VOLTS, self.lf_gain, PROBE_RANGE_VOLTS, t);
            let sync = if (2.0 * t) as u64 % 2 == 1 { status::SYNC } else { 0 };

            frame[..n_ap].fill(ap);
            frame[n_ap..n_ap + n_lf].fill(lf);
            frame[n_ap + n_lf..].fill(sync as i16);
        }
        Ok(())
    }
}

fn generate(run: Arc<SharedRunState>, streams: Vec<SimStream>, sample_rate: f64, timing: TimingConfig) -> u64 {
    if !run.worker_wait() {
        return 0;
    }
    let t0 = run.start_instant().unwrap_or_else(Instant::now);
    for s in &streams {
        s.queue.begin_session(t0);
    }

    let mut clock = GeneratorClock::new(t0, sample_rate, timing.sim_loop());
    let mut buf = Vec::new();
    loop {
        let loop_t = Instant::now();
        let n = clock.due();
        if n > 0 {
            for s in &streams {
                if let Err(e) = s.fill(&mut buf, &clock, n).and_then(|()| s.queue.enqueue(&buf, n)) {
                    run.run_error(&e);
                    return clock.produced();
                }
            }
            clock.advance(n);
        }
        if !clock.sleep_balance(loop_t, &run) {
            break;
        }
    }
    clock.produced()
}

/// Generator standing in for the probe front end.
pub struct ImecSimAcquirer {
    config: ImecConfig,
    timing: TimingConfig,
    reporter: Arc<dyn FatalErrorReporter>,
    run: Arc<SharedRunState>,
    probes: Vec<ProbeDescriptor>,
    queues: Vec<Arc<dyn StreamQueue>>,
    pool: Option<WorkerPool<u64>>,
}

impl ImecSimAcquirer {
    pub fn new(
        config: &AcqConfig,
        queues: Vec<Arc<dyn StreamQueue>>,
        reporter: Arc<dyn FatalErrorReporter>,
    ) -> AcqResult<Self> {
        let imec = config.imec.clone();
        let probes: Vec<_> = imec
            .probes
            .iter()
            .enumerate()
            .map(|(i, p)| ProbeDescriptor::from_config(i, p))
            .collect();
        if queues.len() != probes.len() {
            return Err(AcqError::Configuration(format!(
                "{} probes configured but {} queues supplied",
                probes.len(),
                queues.len()
            )));
        }
        if let Some((d, q)) = probes
            .iter()
            .zip(&queues)
            .find(|(d, q)| q.channels() != d.frame_width())
        {
            return Err(AcqError::Configuration(format!(
                "{}: queue has {} channels, frames are {} wide",
                d.name(),
                q.channels(),
                d.frame_width()
            )));
        }

        Ok(Self {
            config: imec,
            timing: config.timing.clone(),
            run: Arc::new(SharedRunState::new(reporter.clone())),
            reporter,
            probes,
            queues,
            pool: None,
        })
    }

    pub fn run_state(&self) -> Arc<SharedRunState> {
        self.run.clone()
    }

    fn streams(&self) -> Vec<SimStream> {
        self.probes
            .iter()
            .zip(&self.queues)
            .map(|(desc, queue)| {
                let settings: &ProbeSettings = &self.config.probes[desc.index].settings;
                SimStream {
                    desc: *desc,
                    ap_gain: f64::from(settings.ap_gain),
                    lf_gain: f64::from(settings.lf_gain),
                    queue: queue.clone(),
                }
            })
            .collect()
    }
}

impl Acquirer for ImecSimAcquirer {
    fn name(&self) -> &str {
        "imec-sim"
    }

    fn configure(&mut self) -> AcqResult<()> {
        if self.run.phase() == RunPhase::Terminated {
            self.run = Arc::new(SharedRunState::new(self.reporter.clone()));
        }
        tracing::info!(probes = self.probes.len(), rate = self.config.sample_rate, "Imec simulation configured");
        Ok(())
    }

    fn run(&mut self) -> AcqResult<()> {
        if self.pool.is_some() {
            return Err(AcqError::Configuration("imec simulation already running".into()));
        }
        self.run.expect_workers(1);
        let mut pool = WorkerPool::new();
        let (run, streams) = (self.run.clone(), self.streams());
        let (rate, timing) = (self.config.sample_rate, self.timing.clone());
        pool.spawn("imec-sim", move || generate(run, streams, rate, timing))?;
        self.pool = Some(pool);

        if !self.run.wait_all_asleep(None) {
            self.stop();
            return Err(AcqError::Stopped);
        }
        self.run.wake_all();
        tracing::info!("Imec simulation running");
        Ok(())
    }

    fn fifo_status(&self) -> Vec<FifoStatus> {
        self.probes
            .iter()
            .zip(&self.queues)
            .map(|(d, q)| FifoStatus {
                stream: d.name(),
                percent: q.fill_percent(),
            })
            .collect()
    }

    fn stop(&mut self) {
        self.run.request_stop();
        if let Some(pool) = self.pool.take() {
            let outcome = pool.join_with_timeout(self.timing.join_timeout(), self.timing.join_poll());
            for (_, frames) in outcome.results {
                tracing::debug!(frames, "Imec simulation frames generated");
            }
        }
        self.run.mark_terminated();
    }

    fn is_running(&self) -> bool {
        self.pool.is_some() && !self.run.is_stopped()
    }
}

impl Drop for ImecSimAcquirer {
    fn drop(&mut self) {
        if self.pool.is_some() {
            self.stop();
        }
    }
}
