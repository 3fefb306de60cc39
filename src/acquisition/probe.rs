//! Probe descriptors and per-probe runtime counters.

use std::fmt;
use std::time::{Duration, Instant};

use crate::config::ProbeConfig;
use crate::hardware::packet::PacketLayout;

/// Immutable identity of one probe for the life of a run.
///
/// Frames published for a probe are `n_ap + n_lf + n_sync` samples wide,
/// in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeDescriptor {
    /// Position in the configured probe list.
    pub index: usize,
    pub slot: u8,
    pub port: u8,
    pub n_ap: usize,
    pub n_lf: usize,
    pub n_sync: usize,
}

impl ProbeDescriptor {
    pub fn from_config(index: usize, probe: &ProbeConfig) -> Self {
        Self {
            index,
            slot: probe.slot,
            port: probe.port,
            n_ap: probe.ap_channels,
            n_lf: probe.lf_channels,
            n_sync: probe.sync_channels,
        }
    }

    pub fn frame_width(&self) -> usize {
        self.n_ap + self.n_lf + self.n_sync
    }

    pub fn layout(&self) -> PacketLayout {
        PacketLayout::new(self.n_ap, self.n_lf)
    }

    /// Stream name used in logs and error messages.
    pub fn name(&self) -> String {
        format!("Imec probe {}", self.index)
    }

    /// Hardware unit, as named in hardware errors.
    pub fn target(&self) -> String {
        format!("slot {}, port {}", self.slot, self.port)
    }
}

impl fmt::Display for ProbeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe {} (slot {} port {})", self.index, self.slot, self.port)
    }
}

/// Timing statistics accumulated between profile reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopStats {
    pub iterations: u64,
    sum_loop: Duration,
    peak_loop: Duration,
    sum_get: Duration,
    sum_scale: Duration,
    sum_enqueue: Duration,
}

impl LoopStats {
    /// Count one worker loop of duration `dt`.
    pub fn record_loop(&mut self, dt: Duration) {
        self.iterations += 1;
        self.sum_loop += dt;
        self.peak_loop = self.peak_loop.max(dt);
    }

    /// Add the fetch, scale and enqueue times of one published block.
    pub fn record_stages(&mut self, get: Duration, scale: Duration, enqueue: Duration) {
        self.sum_get += get;
        self.sum_scale += scale;
        self.sum_enqueue += enqueue;
    }

    fn avg_ms(&self, sum: Duration) -> f64 {
        if self.iterations == 0 {
            0.0
        } else {
            1000.0 * sum.as_secs_f64() / self.iterations as f64
        }
    }

    pub fn avg_loop_ms(&self) -> f64 {
        self.avg_ms(self.sum_loop)
    }

    pub fn peak_loop_ms(&self) -> f64 {
        1000.0 * self.peak_loop.as_secs_f64()
    }

    pub fn avg_get_ms(&self) -> f64 {
        self.avg_ms(self.sum_get)
    }

    pub fn avg_scale_ms(&self) -> f64 {
        self.avg_ms(self.sum_scale)
    }

    pub fn avg_enqueue_ms(&self) -> f64 {
        self.avg_ms(self.sum_enqueue)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mutable counters of one probe, owned by the worker servicing it.
#[derive(Debug, Clone)]
pub struct RuntimeProbeState {
    /// Frames published so far.
    pub tot_pts: u64,
    /// Timestamp of the last timepoint fetched.
    pub last_ts: Option<u32>,
    /// Publish a zero-fill gap before the next block.
    pub zero_fill: bool,
    /// When the last block was published.
    pub t_post_enqueue: Option<Instant>,
    pub last_fetch: Option<Instant>,
    /// LF interpolation anchor: the previous packet's LF timepoint.
    pub lf_last: Vec<i16>,
    pub stats: LoopStats,
}

impl RuntimeProbeState {
    pub fn new(desc: &ProbeDescriptor) -> Self {
        Self {
            tot_pts: 0,
            last_ts: None,
            zero_fill: false,
            t_post_enqueue: None,
            last_fetch: None,
            lf_last: vec![0; desc.n_lf],
            stats: LoopStats::default(),
        }
    }
}

/// Split probes into worker groups of at most `per_worker`, keeping order.
pub fn group_probes(probes: &[ProbeDescriptor], per_worker: usize) -> Vec<Vec<ProbeDescriptor>> {
    probes
        .chunks(per_worker.max(1))
        .map(<[ProbeDescriptor]>::to_vec)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(index: usize, slot: u8, port: u8) -> ProbeDescriptor {
        ProbeDescriptor {
            index,
            slot,
            port,
            n_ap: 384,
            n_lf: 384,
            n_sync: 1,
        }
    }

    #[test]
    fn test_descriptor_names() {
        let d = desc(2, 3, 1);
        assert_eq!(d.frame_width(), 769);
        assert_eq!(d.name(), "Imec probe 2");
        assert_eq!(d.target(), "slot 3, port 1");
        assert_eq!(d.layout(), PacketLayout::new(384, 384));
    }

    #[test]
    fn test_grouping_bounds_group_size() {
        let probes: Vec<_> = (0..7).map(|i| desc(i, 2, (i + 1) as u8)).collect();
        let groups = group_probes(&probes, 3);
        assert_eq!(groups.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(groups[2][0].index, 6);
        assert!(group_probes(&[], 3).is_empty());
    }

    #[test]
    fn test_loop_stats() {
        let mut s = LoopStats::default();
        assert_eq!(s.avg_loop_ms(), 0.0);
        s.record_loop(Duration::from_millis(2));
        s.record_loop(Duration::from_millis(4));
        assert!((s.avg_loop_ms() - 3.0).abs() < 1e-9);
        assert!((s.peak_loop_ms() - 4.0).abs() < 1e-9);
        s.reset();
        assert_eq!(s.iterations, 0);
    }
}
