//! Probe worker: the fetch → scale → enqueue loop.
//!
//! Each [`ImecWorker`] owns a small group of probes and services them
//! round-robin every iteration:
//!
//! 1. fetch whatever electrode packets the hardware FIFO holds
//! 2. check timestamps and link-error flags (diagnostics only)
//! 3. scale packets into frames: AP copied, LF linearly interpolated up to
//!    the AP rate, sync word bit-flipped
//! 4. publish to the probe's [`StreamQueue`], preceded by a zero-fill gap
//!    when resuming from a pause
//!
//! A probe under a paused slot is not fetched; the worker acknowledges the
//! pause instead. Every statistics interval the worker checks hardware
//! FIFO fill and logs a per-probe profile line. Fatal conditions go
//! through [`SharedRunState::run_error`] and end the loop; nothing is
//! thrown across the thread boundary.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::TimingConfig;
use crate::data::stream_queue::StreamQueue;
use crate::error::{AcqError, AcqResult};
use crate::hardware::capabilities::ProbeHardware;
use crate::hardware::packet::{status, PacketBuffer, SAMPLES_PER_PACKET};

use super::pacing::LoopPacer;
use super::probe::{ProbeDescriptor, RuntimeProbeState};
use super::run_state::SharedRunState;

/// Loop constants for probe workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerTiming {
    pub loop_period: Duration,
    pub pacing_ceiling: Duration,
    pub packets_per_fetch: usize,
    pub stats_interval: Duration,
    pub no_data_grace: Duration,
    pub fifo_warn_pct: u32,
    pub fifo_overflow_pct: u32,
    pub fetch_interval_log: Duration,
}

impl WorkerTiming {
    pub fn from_config(t: &TimingConfig) -> Self {
        Self {
            loop_period: t.imec_loop_period(),
            pacing_ceiling: t.pacing_ceiling(),
            packets_per_fetch: t.packets_per_fetch,
            stats_interval: t.stats_interval(),
            no_data_grace: t.no_data_grace(),
            fifo_warn_pct: t.fifo_warn_pct,
            fifo_overflow_pct: t.fifo_overflow_pct,
            fetch_interval_log: t.fetch_interval_log(),
        }
    }
}

/// Histogram bins: deltas 0..=31, then negative, then above 31.
pub const HISTOGRAM_BINS: usize = 34;

/// Distribution of consecutive hardware timestamp deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampHistogram {
    bins: [u64; HISTOGRAM_BINS],
}

impl Default for TimestampHistogram {
    fn default() -> Self {
        Self {
            bins: [0; HISTOGRAM_BINS],
        }
    }
}

impl TimestampHistogram {
    pub fn record(&mut self, delta: i32) {
        let bin = match delta {
            d if d < 0 => 32,
            d if d > 31 => 33,
            d => d as usize,
        };
        self.bins[bin] += 1;
    }

    pub fn bins(&self) -> &[u64; HISTOGRAM_BINS] {
        &self.bins
    }

    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
    }
}

impl fmt::Display for TimestampHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (i, &n) in self.bins.iter().enumerate().filter(|(_, n)| **n > 0) {
            if !first {
                write!(f, " ")?;
            }
            first = false;
            match i {
                32 => write!(f, "<0:{n}")?,
                33 => write!(f, ">31:{n}")?,
                _ => write!(f, "{i}:{n}")?,
            }
        }
        if first {
            write!(f, "empty")?;
        }
        Ok(())
    }
}

/// Link-error flags counted over one fetch.
#[derive(Debug, Default, Clone, Copy)]
struct ErrorTally {
    count: u32,
    serdes: u32,
    lock: u32,
    pop: u32,
    sync: u32,
}

impl ErrorTally {
    fn add(&mut self, word: u16) {
        self.count += u32::from(word & status::COUNT != 0);
        self.serdes += u32::from(word & status::SERDES != 0);
        self.lock += u32::from(word & status::LOCK != 0);
        self.pop += u32::from(word & status::POP != 0);
        self.sync += u32::from(word & status::SYNC_ERROR != 0);
    }

    fn any(&self) -> bool {
        self.count + self.serdes + self.lock + self.pop + self.sync > 0
    }
}

/// One probe as seen by its worker: descriptor, sink and scratch buffers.
pub struct WorkerProbe {
    desc: ProbeDescriptor,
    queue: Arc<dyn StreamQueue>,
    state: RuntimeProbeState,
    packets: PacketBuffer,
    lf_now: Vec<i16>,
    frames: Vec<i16>,
}

impl WorkerProbe {
    pub fn new(desc: ProbeDescriptor, queue: Arc<dyn StreamQueue>, packets_per_fetch: usize) -> AcqResult<Self> {
        if queue.channels() != desc.frame_width() {
            return Err(AcqError::Configuration(format!(
                "{}: queue has {} channels, probe frames are {} wide",
                desc.name(),
                queue.channels(),
                desc.frame_width()
            )));
        }
        let packets = PacketBuffer::new(desc.layout(), packets_per_fetch)?;
        let max_frames = SAMPLES_PER_PACKET * packets_per_fetch;
        let mut frames = Vec::new();
        frames
            .try_reserve_exact(max_frames * desc.frame_width())
            .map_err(|_| AcqError::OutOfMemory {
                stream: desc.name(),
                frames: max_frames,
            })?;

        Ok(Self {
            desc,
            queue,
            state: RuntimeProbeState::new(&desc),
            packets,
            lf_now: vec![0; desc.n_lf],
            frames,
        })
    }

    pub fn descriptor(&self) -> &ProbeDescriptor {
        &self.desc
    }

    pub fn state(&self) -> &RuntimeProbeState {
        &self.state
    }

    fn acknowledge_pause(&mut self, run: &SharedRunState) -> usize {
        if !run.pause_ack(self.desc.port) {
            self.state.zero_fill = true;
            tracing::debug!(probe = self.desc.index, slot = self.desc.slot, "Pause acknowledged");
        }
        0
    }

    /// Fetch packets, or acknowledge the pause if this probe's slot is paused.
    pub(crate) fn fetch(&mut self, hw: &dyn ProbeHardware, run: &SharedRunState, max: usize) -> AcqResult<usize> {
        let slot = self.desc.slot;
        if run.paused_slot() == Some(slot) {
            return Ok(self.acknowledge_pause(run));
        }
        match hw.read_packets(slot, self.desc.port, &mut self.packets, max) {
            Ok(n) => Ok(n),
            // The slot was paused (and possibly disarmed) during the read
            Err(_) if run.paused_slot() == Some(slot) => Ok(self.acknowledge_pause(run)),
            Err(fault) => Err(fault.at(self.desc.target())),
        }
    }

    /// Timestamp continuity, delta histogram and link-error flags.
    pub(crate) fn inspect(&mut self, n: usize, histogram: &mut TimestampHistogram) {
        let probe = self.desc.index;
        let mut tally = ErrorTally::default();
        let mut zero_deltas = 0u32;
        let mut big_deltas = 0u32;
        let mut prev: Option<u32> = None;

        for ie in 0..n {
            let Some(view) = self.packets.packet(ie) else {
                break;
            };
            let ts = view.timestamps();
            if ie == 0 {
                if let Some(last) = self.state.last_ts {
                    let first = ts[0];
                    if first < last || u64::from(first) > u64::from(last) + 4 {
                        tracing::warn!(probe, last, first, "Timestamp discontinuity between fetches");
                    }
                }
            }
            for &t in &ts {
                if let Some(p) = prev {
                    let delta = t.wrapping_sub(p) as i32;
                    histogram.record(delta);
                    if delta == 0 {
                        zero_deltas += 1;
                    } else if delta > 31 {
                        big_deltas += 1;
                    }
                }
                prev = Some(t);
            }
            for word in view.status_words() {
                tally.add(word);
            }
        }

        if prev.is_some() {
            self.state.last_ts = prev;
        }
        if zero_deltas > 0 || big_deltas > 0 {
            tracing::debug!(probe, zero_deltas, big_deltas, "Irregular timestamp deltas");
        }
        if tally.any() {
            tracing::warn!(
                probe,
                count = tally.count,
                serdes = tally.serdes,
                lock = tally.lock,
                pop = tally.pop,
                sync = tally.sync,
                "Packet error flags"
            );
        }
    }

    /// Convert the first `n` packets into frames; returns the frame count.
    pub(crate) fn scale(&mut self, n: usize) -> usize {
        let width = self.desc.frame_width();
        let n_ap = self.desc.n_ap;
        let n_lf = self.desc.n_lf;
        let n_frames = n * SAMPLES_PER_PACKET;
        self.frames.clear();
        self.frames.resize(n_frames * width, 0);

        for ie in 0..n {
            let Some(view) = self.packets.packet(ie) else {
                break;
            };
            let words = view.status_words();
            view.read_lf(&mut self.lf_now);

            for (it, &word) in words.iter().enumerate() {
                let at = (ie * SAMPLES_PER_PACKET + it) * width;
                let row = &mut self.frames[at..at + width];
                view.read_ap_row(it, &mut row[..n_ap]);

                let slope = it as f32 / SAMPLES_PER_PACKET as f32;
                for ((dst, &last), &now) in row[n_ap..n_ap + n_lf]
                    .iter_mut()
                    .zip(&self.state.lf_last)
                    .zip(&self.lf_now)
                {
                    let (last, now) = (f32::from(last), f32::from(now));
                    *dst = (last + slope * (now - last)) as i16;
                }
                for dst in &mut row[n_ap + n_lf..] {
                    *dst = (word ^ status::SYNC) as i16;
                }
            }
            self.state.lf_last.copy_from_slice(&self.lf_now);
        }
        n_frames
    }

    /// Publish the scaled frames, preceded by any pending zero-fill gap.
    pub(crate) fn publish(&mut self, n_frames: usize, t_pre: Instant) -> AcqResult<()> {
        if self.state.zero_fill {
            if let Some(t_post) = self.state.t_post_enqueue {
                self.queue.enqueue_zero(t_post, t_pre);
            }
            self.state.zero_fill = false;
        }
        self.queue.enqueue(&self.frames, n_frames)?;
        self.state.t_post_enqueue = Some(Instant::now());
        self.state.tot_pts += n_frames as u64;
        Ok(())
    }
}

/// Fill level of a probe's hardware FIFO, 0 while its slot is paused.
pub(crate) fn fifo_percent(hw: &dyn ProbeHardware, run: &SharedRunState, desc: &ProbeDescriptor) -> u32 {
    if run.paused_slot() == Some(desc.slot) {
        return 0;
    }
    match hw.fifo_state(desc.slot, desc.port) {
        Ok(state) => state.percent(),
        Err(fault) => {
            tracing::warn!(probe = desc.index, error = %fault.at(desc.target()), "FIFO query failed");
            0
        }
    }
}

/// What a worker hands back when it exits.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker: usize,
    pub histogram: TimestampHistogram,
    /// `(probe index, frames published)`
    pub frames: Vec<(usize, u64)>,
}

/// A worker thread body servicing a group of probes.
pub struct ImecWorker {
    id: usize,
    hw: Arc<dyn ProbeHardware>,
    run: Arc<SharedRunState>,
    timing: WorkerTiming,
    pacer: LoopPacer,
    probes: Vec<WorkerProbe>,
    histogram: TimestampHistogram,
}

impl ImecWorker {
    pub fn new(
        id: usize,
        hw: Arc<dyn ProbeHardware>,
        run: Arc<SharedRunState>,
        timing: WorkerTiming,
        probes: Vec<WorkerProbe>,
    ) -> Self {
        Self {
            id,
            hw,
            run,
            pacer: LoopPacer::new(timing.loop_period, timing.pacing_ceiling),
            timing,
            probes,
            histogram: TimestampHistogram::default(),
        }
    }

    /// Thread body: wait at the barrier, then loop until stopped.
    pub fn run(mut self) -> WorkerReport {
        if !self.run.worker_wait() {
            return self.into_report();
        }
        let start = self.run.start_instant().unwrap_or_else(Instant::now);
        let mut last_stats = start;
        tracing::debug!(worker = self.id, probes = self.probes.len(), "Worker running");

        while !self.run.is_stopped() {
            let loop_t = Instant::now();

            if let Err(e) = self.iterate(loop_t, start) {
                self.run.run_error(&e);
                break;
            }
            if loop_t.saturating_duration_since(last_stats) >= self.timing.stats_interval {
                if let Err(e) = self.check_fifos() {
                    self.run.run_error(&e);
                    break;
                }
                last_stats = loop_t;
            }

            let dt = loop_t.elapsed();
            for p in &mut self.probes {
                p.state.stats.record_loop(dt);
            }
            if !self.pacer.tick(loop_t, &self.run) {
                break;
            }
        }

        tracing::debug!(worker = self.id, "Worker exiting");
        self.into_report()
    }

    fn iterate(&mut self, loop_t: Instant, start: Instant) -> AcqResult<()> {
        for ip in 0..self.probes.len() {
            if self.run.is_stopped() {
                break;
            }
            self.service_probe(ip, loop_t, start)?;
        }
        Ok(())
    }

    fn service_probe(&mut self, ip: usize, loop_t: Instant, start: Instant) -> AcqResult<()> {
        let Self {
            hw,
            run,
            timing,
            probes,
            histogram,
            ..
        } = self;
        let p = &mut probes[ip];

        let t_get = Instant::now();
        let n = p.fetch(hw.as_ref(), run, timing.packets_per_fetch)?;
        if n == 0 {
            if p.state.tot_pts == 0 && loop_t.saturating_duration_since(start) >= timing.no_data_grace {
                return Err(AcqError::NoData {
                    stream: p.desc.name(),
                });
            }
            return Ok(());
        }

        if let Some(prev) = p.state.last_fetch {
            let interval = t_get.saturating_duration_since(prev);
            if interval > timing.fetch_interval_log {
                tracing::debug!(
                    probe = p.desc.index,
                    interval_ms = interval.as_secs_f64() * 1000.0,
                    fill_pct = fifo_percent(hw.as_ref(), run, &p.desc),
                    "Long interval between fetches"
                );
            }
        }
        p.state.last_fetch = Some(t_get);

        p.inspect(n, histogram);

        let t_scale = Instant::now();
        let n_frames = p.scale(n);

        let t_enq = Instant::now();
        if run.is_stopped() {
            return Ok(());
        }
        if p.state.tot_pts == 0 {
            p.queue.begin_session(loop_t);
        }
        p.publish(n_frames, t_enq)?;

        p.state
            .stats
            .record_stages(t_scale - t_get, t_enq - t_scale, t_enq.elapsed());
        Ok(())
    }

    fn check_fifos(&mut self) -> AcqResult<()> {
        let Self {
            hw,
            run,
            timing,
            probes,
            ..
        } = self;

        for p in probes.iter_mut() {
            let pct = fifo_percent(hw.as_ref(), run, &p.desc);
            let stats = p.state.stats;
            if pct >= timing.fifo_warn_pct {
                tracing::warn!(
                    probe = p.desc.index,
                    fill_pct = pct,
                    avg_loop_ms = stats.avg_loop_ms(),
                    peak_loop_ms = stats.peak_loop_ms(),
                    "Imec FIFO filling"
                );
            }
            if pct >= timing.fifo_overflow_pct {
                return Err(AcqError::FifoOverflow {
                    stream: format!("Imec {}", p.desc.index),
                    percent: pct,
                });
            }

            let lag_ms = p
                .queue
                .end_time()
                .map_or(0.0, |t| 1000.0 * Instant::now().saturating_duration_since(t).as_secs_f64());
            tracing::debug!(
                probe = p.desc.index,
                loop_ms = stats.avg_loop_ms(),
                lag_ms,
                get_ms = stats.avg_get_ms(),
                scale_ms = stats.avg_scale_ms(),
                enq_ms = stats.avg_enqueue_ms(),
                iterations = stats.iterations,
                fill_pct = pct,
                "Probe profile"
            );
            p.state.stats.reset();
        }
        Ok(())
    }

    fn into_report(self) -> WorkerReport {
        WorkerReport {
            worker: self.id,
            histogram: self.histogram,
            frames: self
                .probes
                .iter()
                .map(|p| (p.desc.index, p.state.tot_pts))
                .collect(),
        }
    }
}
