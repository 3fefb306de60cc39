//! Loop pacing.
//!
//! Fetch loops do not sleep a fixed amount. After each iteration they
//! compare the time spent against a target period and sleep for half of
//! the deficit, capped by a small ceiling, so fetches stay roughly the
//! same size without adding latency. [`LoopPacer`] is that scheduler tick.
//!
//! Synthetic generators instead produce data against the wall clock:
//! [`GeneratorClock`] says how many frames are due and sleeps out the rest
//! of the generator period.

use std::time::{Duration, Instant};

use super::run_state::SharedRunState;

/// Scheduler tick for a fetch loop.
#[derive(Debug, Clone, Copy)]
pub struct LoopPacer {
    period: Duration,
    ceiling: Duration,
}

impl LoopPacer {
    pub fn new(period: Duration, ceiling: Duration) -> Self {
        Self { period, ceiling }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep owed after an iteration that took `elapsed`.
    pub fn sleep_for(&self, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.period {
            return None;
        }
        let nap = ((self.period - elapsed) / 2).min(self.ceiling);
        (!nap.is_zero()).then_some(nap)
    }

    /// Sleep for the iteration that began at `loop_start`, then re-check
    /// the stop flag. Returns `true` to keep looping.
    pub fn tick(&self, loop_start: Instant, run: &SharedRunState) -> bool {
        if let Some(nap) = self.sleep_for(loop_start.elapsed()) {
            std::thread::sleep(nap);
        }
        !run.is_stopped()
    }
}

/// Wall-clock frame budget for a synthetic generator.
#[derive(Debug, Clone)]
pub struct GeneratorClock {
    t0: Instant,
    sample_rate: f64,
    loop_period: Duration,
    produced: u64,
}

impl GeneratorClock {
    pub fn new(t0: Instant, sample_rate: f64, loop_period: Duration) -> Self {
        Self {
            t0,
            sample_rate,
            loop_period,
            produced: 0,
        }
    }

    pub fn t_zero(&self) -> Instant {
        self.t0
    }

    pub fn produced(&self) -> u64 {
        self.produced
    }

    /// Most frames one iteration may generate: ten loop periods.
    pub fn max_frames(&self) -> usize {
        (10.0 * self.loop_period.as_secs_f64() * self.sample_rate) as usize
    }

    /// Frames to generate now so the stream leads the clock by one period.
    pub fn due(&self) -> usize {
        self.due_at(Instant::now())
    }

    fn due_at(&self, now: Instant) -> usize {
        let horizon = now.saturating_duration_since(self.t0) + self.loop_period;
        let target = (horizon.as_secs_f64() * self.sample_rate) as u64;
        (target.saturating_sub(self.produced) as usize).min(self.max_frames())
    }

    pub fn advance(&mut self, frames: usize) {
        self.produced += frames as u64;
    }

    /// Seconds since time-zero of frame `index` of the next block.
    pub fn frame_time(&self, index: usize) -> f64 {
        (self.produced + index as u64) as f64 / self.sample_rate
    }

    /// Sleep the balance of the generator period. Returns `true` to keep looping.
    pub fn sleep_balance(&self, loop_start: Instant, run: &SharedRunState) -> bool {
        let spent = loop_start.elapsed();
        if spent < self.loop_period {
            std::thread::sleep(self.loop_period - spent);
        }
        !run.is_stopped()
    }
}

/// Full-scale sine sample in ADC counts.
///
/// `amplitude_volts * gain` over a symmetric `range_volts` input, period
/// one second, saturated to `i16`.
pub fn sine_counts(amplitude_volts: f64, gain: f64, range_volts: f64, t_secs: f64) -> i16 {
    let amplitude = 32768.0 * amplitude_volts * gain / range_volts;
    let v = amplitude * (2.0 * std::f64::consts::PI * t_secs).sin();
    v.clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}
