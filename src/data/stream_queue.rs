//! Stream queue: the sink every acquisition path publishes into.
//!
//! The core only relies on the producer contract in [`StreamQueue`]. Frames
//! are fixed-width `i16` timepoints. Once a queue has a time-zero, its frame
//! count is contiguous: a stretch of time with no data (a paused probe, say)
//! is published as a zero-fill gap via [`StreamQueue::enqueue_zero`], never by
//! skipping counts. That keeps `t_zero + frames / sample_rate` an accurate
//! clock for every stream, across stop and restart as well:
//! [`StreamQueue::begin_session`] fills the idle time between two runs.
//!
//! [`MemoryStreamQueue`] is a bounded in-memory implementation. When the
//! retained sample data exceed the capacity, the oldest blocks are dropped
//! (ring semantics). Gap entries carry no samples and are never counted
//! against the capacity.

use crate::error::{AcqError, AcqResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Producer side of an ordered, append-only stream buffer.
///
/// Exactly one producer thread writes a given queue at a time; the
/// consumer side is implementation specific.
pub trait StreamQueue: Send + Sync {
    /// Wall-clock instant that frame 0 corresponds to.
    ///
    /// May be called repeatedly until the first frame is published; later
    /// calls are ignored.
    fn set_t_zero(&self, t: Instant);

    /// Producer session starts with its first frame at `t`.
    ///
    /// On a queue with no frames this sets time-zero. On a queue that
    /// already carries a previous run, time-zero is kept and the time from
    /// the previous run's last frame to `t` is published as one gap.
    fn begin_session(&self, t: Instant);

    /// Append `n_frames` whole frames from `samples`.
    fn enqueue(&self, samples: &[i16], n_frames: usize) -> AcqResult<()>;

    /// Append a zero-fill gap covering `[gap_start, gap_end)`.
    fn enqueue_zero(&self, gap_start: Instant, gap_end: Instant);

    /// Instant just past the last published frame, if time-zero is set.
    fn end_time(&self) -> Option<Instant>;

    /// Occupancy of the consumer-side buffer, 0..=100.
    fn fill_percent(&self) -> u32;

    /// Samples per frame.
    fn channels(&self) -> usize;

    /// Frames per second.
    fn sample_rate(&self) -> f64;
}

/// One published entry.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEntry {
    /// Real samples; `data.len()` is a multiple of the channel count.
    Samples { first_frame: u64, data: Vec<i16> },
    /// Zero-fill marker standing for `frames` frames of no data.
    Gap { first_frame: u64, frames: u64 },
}

impl QueueEntry {
    /// Index of the entry's first frame since time-zero.
    pub fn first_frame(&self) -> u64 {
        match self {
            QueueEntry::Samples { first_frame, .. } | QueueEntry::Gap { first_frame, .. } => {
                *first_frame
            }
        }
    }
}

/// Running totals for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueTotals {
    /// Frames carried by sample entries.
    pub data_frames: u64,
    /// Frames represented by gap entries.
    pub zero_frames: u64,
    /// Number of gap entries.
    pub gaps: u64,
    pub t_zero: Option<Instant>,
}

impl QueueTotals {
    /// Data and zero-fill frames together: the stream's clock.
    pub fn total_frames(&self) -> u64 {
        self.data_frames + self.zero_frames
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<QueueEntry>,
    retained_frames: usize,
    totals: QueueTotals,
}

/// Bounded in-memory stream queue.
#[derive(Debug)]
pub struct MemoryStreamQueue {
    name: String,
    channels: usize,
    sample_rate: f64,
    capacity_frames: usize,
    inner: Mutex<QueueInner>,
}

impl MemoryStreamQueue {
    /// Create a queue retaining at most `capacity_frames` frames of samples.
    pub fn new(name: impl Into<String>, channels: usize, sample_rate: f64, capacity_frames: usize) -> Self {
        Self {
            name: name.into(),
            channels: channels.max(1),
            sample_rate,
            capacity_frames: capacity_frames.max(1),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Queue sized to hold `seconds` of data.
    pub fn with_duration(name: impl Into<String>, channels: usize, sample_rate: f64, seconds: f64) -> Self {
        let capacity = (seconds * sample_rate).ceil().max(1.0) as usize;
        Self::new(name, channels, sample_rate, capacity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn totals(&self) -> QueueTotals {
        self.inner.lock().totals
    }

    /// Instant of frame 0, once set.
    pub fn t_zero(&self) -> Option<Instant> {
        self.inner.lock().totals.t_zero
    }

    /// Remove and return everything currently retained.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut inner = self.inner.lock();
        inner.retained_frames = 0;
        inner.entries.drain(..).collect()
    }

    /// Copy of the retained entries, oldest first.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner.lock().entries.iter().cloned().collect()
    }

    fn gap_frames(&self, gap_start: Instant, gap_end: Instant) -> u64 {
        let secs = gap_end.saturating_duration_since(gap_start).as_secs_f64();
        (secs * self.sample_rate).round() as u64
    }

    fn push_gap(&self, inner: &mut QueueInner, frames: u64) {
        if frames == 0 {
            return;
        }
        let first_frame = inner.totals.total_frames();
        inner.entries.push_back(QueueEntry::Gap { first_frame, frames });
        inner.totals.zero_frames += frames;
        inner.totals.gaps += 1;
        tracing::debug!(stream = %self.name, frames, "Zero-fill gap");
    }
}

impl StreamQueue for MemoryStreamQueue {
    fn set_t_zero(&self, t: Instant) {
        let mut inner = self.inner.lock();
        if inner.totals.total_frames() == 0 {
            inner.totals.t_zero = Some(t);
        } else {
            tracing::debug!(stream = %self.name, "Ignoring time-zero after data were published");
        }
    }

    fn enqueue(&self, samples: &[i16], n_frames: usize) -> AcqResult<()> {
        if n_frames == 0 {
            return Ok(());
        }
        let n_samples = n_frames * self.channels;
        let Some(src) = samples.get(..n_samples) else {
            return Err(AcqError::Configuration(format!(
                "{}: block of {} samples is shorter than {} frames of {} channels",
                self.name,
                samples.len(),
                n_frames,
                self.channels
            )));
        };

        let mut data = Vec::new();
        data.try_reserve_exact(n_samples)
            .map_err(|_| AcqError::OutOfMemory {
                stream: self.name.clone(),
                frames: n_frames,
            })?;
        data.extend_from_slice(src);

        let mut inner = self.inner.lock();
        let first_frame = inner.totals.total_frames();
        inner.entries.push_back(QueueEntry::Samples { first_frame, data });
        inner.retained_frames += n_frames;
        inner.totals.data_frames += n_frames as u64;

        while inner.retained_frames > self.capacity_frames {
            match inner.entries.pop_front() {
                Some(QueueEntry::Samples { data, .. }) => {
                    inner.retained_frames -= data.len() / self.channels;
                }
                Some(QueueEntry::Gap { .. }) => {}
                None => break,
            }
        }
        Ok(())
    }

    fn begin_session(&self, t: Instant) {
        let mut inner = self.inner.lock();
        let total = inner.totals.total_frames();
        match inner.totals.t_zero {
            Some(t_zero) if total > 0 => {
                let end = t_zero + Duration::from_secs_f64(total as f64 / self.sample_rate);
                let frames = self.gap_frames(end, t);
                tracing::debug!(stream = %self.name, idle_frames = frames, "Resuming stream");
                self.push_gap(&mut inner, frames);
            }
            _ => inner.totals.t_zero = Some(t),
        }
    }

    fn enqueue_zero(&self, gap_start: Instant, gap_end: Instant) {
        let frames = self.gap_frames(gap_start, gap_end);
        let mut inner = self.inner.lock();
        self.push_gap(&mut inner, frames);
    }

    fn end_time(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        let t_zero = inner.totals.t_zero?;
        let secs = inner.totals.total_frames() as f64 / self.sample_rate;
        Some(t_zero + Duration::from_secs_f64(secs))
    }

    fn fill_percent(&self) -> u32 {
        let retained = self.inner.lock().retained_frames;
        ((retained * 100) / self.capacity_frames).min(100) as u32
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_counts_frames() {
        let q = MemoryStreamQueue::new("test", 2, 1000.0, 100);
        q.set_t_zero(Instant::now());
        q.enqueue(&[1, 2, 3, 4, 5, 6], 3).unwrap();
        q.enqueue(&[7, 8, 9, 10], 1).unwrap();

        let totals = q.totals();
        assert_eq!(totals.data_frames, 4);
        assert_eq!(totals.zero_frames, 0);

        let entries = q.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].first_frame(), 3);
        assert_eq!(
            entries[1],
            QueueEntry::Samples {
                first_frame: 3,
                data: vec![7, 8]
            }
        );
    }

    #[test]
    fn test_zero_fill_keeps_count_contiguous() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 1000);
        let t0 = Instant::now();
        q.set_t_zero(t0);
        q.enqueue(&[0; 10], 10).unwrap();
        q.enqueue_zero(t0, t0 + Duration::from_millis(250));
        q.enqueue(&[0; 5], 5).unwrap();

        let totals = q.totals();
        assert_eq!(totals.zero_frames, 250);
        assert_eq!(totals.gaps, 1);
        assert_eq!(totals.total_frames(), 265);
        assert_eq!(q.snapshot()[2].first_frame(), 260);

        let elapsed = q.end_time().unwrap().duration_since(t0).as_secs_f64();
        assert!((elapsed - 0.265).abs() < 1e-6);
    }

    #[test]
    fn test_empty_gap_is_dropped() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 10);
        let t = Instant::now();
        q.enqueue_zero(t, t);
        q.enqueue_zero(t + Duration::from_millis(5), t);
        assert_eq!(q.totals().gaps, 0);
    }

    #[test]
    fn test_t_zero_fixed_after_first_frame() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 10);
        let t0 = Instant::now();
        q.set_t_zero(t0);
        q.set_t_zero(t0 + Duration::from_millis(3));
        q.enqueue(&[1], 1).unwrap();
        q.set_t_zero(t0 + Duration::from_secs(1));
        assert_eq!(q.t_zero(), Some(t0 + Duration::from_millis(3)));
    }

    #[test]
    fn test_paused_stream_ends_with_reference() {
        let rate = 30_000.0;
        let reference = MemoryStreamQueue::new("reference", 1, rate, 100_000);
        let paused = MemoryStreamQueue::new("paused", 1, rate, 100_000);
        let t0 = Instant::now();
        reference.set_t_zero(t0);
        paused.set_t_zero(t0);
        let at = |frames: u64| t0 + Duration::from_secs_f64(frames as f64 / rate);

        // 4000 frames of data, a 1500 frame pause, 2500 more frames
        reference.enqueue(&[1; 8000], 8000).unwrap();
        paused.enqueue(&[1; 4000], 4000).unwrap();
        paused.enqueue_zero(at(4000), at(5500));
        paused.enqueue(&[1; 2500], 2500).unwrap();

        assert_eq!(paused.totals().zero_frames, 1500);
        assert_eq!(paused.totals().total_frames(), reference.totals().total_frames());
        let (a, b) = (reference.end_time().unwrap(), paused.end_time().unwrap());
        let skew = if a > b { a - b } else { b - a };
        assert!(skew.as_secs_f64() < 1.0 / rate, "{skew:?}");
    }

    #[test]
    fn test_begin_session_sets_t_zero_then_fills_idle_time() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 1000);
        let t0 = Instant::now();
        q.begin_session(t0);
        assert_eq!(q.t_zero(), Some(t0));
        q.enqueue(&[0; 40], 40).unwrap();

        // Restart 100 ms after the last frame
        q.begin_session(t0 + Duration::from_millis(140));
        q.enqueue(&[0; 10], 10).unwrap();

        let totals = q.totals();
        assert_eq!(totals.t_zero, Some(t0));
        assert_eq!(totals.gaps, 1);
        assert_eq!(totals.zero_frames, 100);
        assert_eq!(
            q.snapshot()[1],
            QueueEntry::Gap {
                first_frame: 40,
                frames: 100
            }
        );
        assert_eq!(q.snapshot()[2].first_frame(), 140);
    }

    #[test]
    fn test_begin_session_without_frames_moves_t_zero() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 10);
        let t0 = Instant::now();
        q.begin_session(t0);
        q.begin_session(t0 + Duration::from_millis(30));
        assert_eq!(q.t_zero(), Some(t0 + Duration::from_millis(30)));
        assert_eq!(q.totals().gaps, 0);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let q = MemoryStreamQueue::new("test", 1, 1000.0, 10);
        q.enqueue(&[1; 6], 6).unwrap();
        assert_eq!(q.fill_percent(), 60);
        q.enqueue(&[2; 6], 6).unwrap();

        let entries = q.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].first_frame(), 6);
        assert_eq!(q.totals().data_frames, 12);

        q.drain();
        assert_eq!(q.fill_percent(), 0);
    }

    #[test]
    fn test_short_block_rejected() {
        let q = MemoryStreamQueue::new("test", 4, 1000.0, 10);
        assert!(q.enqueue(&[0; 7], 2).is_err());
    }
}
