//! Demux/merge engine for the multiplexed DAQ path.
//!
//! The DAQ delivers interleaved *scans*: one sample per physical line per
//! converter clock. Each muxed line carries `kmux` logical channels in
//! turn, so one *timepoint* spans `kmux` consecutive scans. Reads may stop
//! mid-timepoint; the engine keeps the partial tail and slides it to the
//! front of the raw buffers before the next read:
//!
//! ```text
//!  fetch n scans after rem:   [ rem | n ............ ]
//!  whole = (rem + n) / kmux   [ whole * kmux  | rem' ]
//!  next iteration slides rem' to the front
//! ```
//!
//! Per timepoint the merged frame is, in order:
//!
//! | Block | Width | Source |
//! |---|---|---|
//! | muxed neural + muxed aux | `kmux * (mn1 + mn2 + ma1 + ma2)` | transposed: channel = line * kmux + slot |
//! | oversampled aux analog | `xa1 + xa2` | mean of the `kmux` sub-samples |
//! | digital | `ceil((xd1 + xd2) / 2)` words | first scan's word, bytes packed low-first |
//!
//! with lines ordered MN dev1, MN dev2, MA dev1, MA dev2.

use crate::config::{DeviceChannels, MuxDaqConfig};
use crate::error::{AcqError, AcqResult};

/// Channel geometry of the muxed stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxLayout {
    pub kmux: usize,
    pub dev1: DeviceChannels,
    /// All zero for a single-device setup.
    pub dev2: DeviceChannels,
}

impl MuxLayout {
    pub fn new(kmux: usize, dev1: DeviceChannels, dev2: DeviceChannels) -> Self {
        Self {
            kmux: kmux.max(1),
            dev1,
            dev2,
        }
    }

    pub fn from_config(config: &MuxDaqConfig) -> Self {
        let dev2 = if config.dual_device {
            config.dev2
        } else {
            DeviceChannels::default()
        };
        Self::new(config.mux_factor, config.dev1, dev2)
    }

    pub fn is_dual(&self) -> bool {
        !self.dev2.is_empty()
    }

    /// Physical lines carrying muxed channels, both devices.
    pub fn muxed_lines(&self) -> usize {
        self.dev1.mn + self.dev2.mn + self.dev1.ma + self.dev2.ma
    }

    pub fn neural_channels(&self) -> usize {
        self.kmux * (self.dev1.mn + self.dev2.mn)
    }

    pub fn aux_channels(&self) -> usize {
        self.kmux * (self.dev1.ma + self.dev2.ma)
    }

    pub fn xa_channels(&self) -> usize {
        self.dev1.xa + self.dev2.xa
    }

    pub fn digital_words(&self) -> usize {
        (self.dev1.xd_bytes + self.dev2.xd_bytes).div_ceil(2)
    }

    /// Samples per merged timepoint.
    pub fn frame_width(&self) -> usize {
        self.kmux * self.muxed_lines() + self.xa_channels() + self.digital_words()
    }
}

/// Pack the low `bytes` bytes of each word into 16-bit output words.
///
/// Bytes fill each output word low byte first; a device whose byte count
/// is odd leaves a half-filled word that the next device completes.
/// Returns the number of words written.
pub fn pack_digital(dst: &mut [i16], parts: &[(u32, usize)]) -> usize {
    let mut word = 0;
    let mut half = false;
    for &(value, bytes) in parts {
        for b in 0..bytes.min(4) {
            let byte = ((value >> (8 * b)) & 0xFF) as u16;
            let Some(slot) = dst.get_mut(word) else {
                return word;
            };
            if half {
                *slot = (*slot as u16 | (byte << 8)) as i16;
                word += 1;
            } else {
                *slot = byte as i16;
            }
            half = !half;
        }
    }
    word + usize::from(half)
}

/// Writable tails of the raw buffers, after any carried remainder.
#[derive(Debug)]
pub struct FetchSlots<'a> {
    pub ai1: &'a mut [i16],
    pub ai2: &'a mut [i16],
    pub di1: &'a mut [u32],
    pub di2: &'a mut [u32],
}

/// Raw scan buffers plus the remainder bookkeeping and merge stage.
#[derive(Debug)]
pub struct DemuxEngine {
    layout: MuxLayout,
    l1: usize,
    l2: usize,
    capacity: usize,
    ai1: Vec<i16>,
    ai2: Vec<i16>,
    di1: Vec<u32>,
    di2: Vec<u32>,
    filled: usize,
    rem: usize,
    rem_front: bool,
    tmp: Vec<i16>,
    xa_sum: Vec<i64>,
    merged: Vec<i16>,
}

fn zeroed<T: Clone + Default>(len: usize, frames: usize) -> AcqResult<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| AcqError::OutOfMemory {
        stream: "Mux DAQ".to_string(),
        frames,
    })?;
    v.resize(len, T::default());
    Ok(v)
}

impl DemuxEngine {
    /// Engine whose raw buffers hold `capacity_scans` scans per device.
    pub fn new(layout: MuxLayout, capacity_scans: usize) -> AcqResult<Self> {
        let kmux = layout.kmux;
        let capacity = capacity_scans.max(kmux);
        let max_whole = capacity / kmux;
        let l1 = layout.dev1.analog_lines();
        let l2 = layout.dev2.analog_lines();
        let digital = |bytes: usize| if bytes > 0 { capacity } else { 0 };

        Ok(Self {
            layout,
            l1,
            l2,
            capacity,
            ai1: zeroed(capacity * l1, max_whole)?,
            ai2: zeroed(capacity * l2, max_whole)?,
            di1: zeroed(digital(layout.dev1.xd_bytes), max_whole)?,
            di2: zeroed(digital(layout.dev2.xd_bytes), max_whole)?,
            filled: 0,
            rem: 0,
            rem_front: true,
            tmp: zeroed(kmux * layout.muxed_lines(), 1)?,
            xa_sum: zeroed(layout.xa_channels(), 1)?,
            merged: zeroed(max_whole * layout.frame_width(), max_whole)?,
        })
    }

    /// Buffers sized for `latency_secs` of data plus one timepoint.
    pub fn with_latency(layout: MuxLayout, sample_rate: f64, latency_secs: f64) -> AcqResult<Self> {
        let max_muxed = (layout.kmux as f64 * latency_secs * sample_rate) as usize;
        Self::new(layout, max_muxed + layout.kmux)
    }

    pub fn layout(&self) -> &MuxLayout {
        &self.layout
    }

    pub fn capacity_scans(&self) -> usize {
        self.capacity
    }

    /// Scans of an incomplete timepoint carried to the next fetch.
    pub fn remainder(&self) -> usize {
        self.rem
    }

    /// Move the carried partial timepoint to the front of every buffer.
    pub fn slide_remainder(&mut self) {
        if self.rem == 0 || self.rem_front {
            return;
        }
        let (from, to) = (self.filled - self.rem, self.filled);
        self.ai1.copy_within(from * self.l1..to * self.l1, 0);
        self.ai2.copy_within(from * self.l2..to * self.l2, 0);
        if !self.di1.is_empty() {
            self.di1.copy_within(from..to, 0);
        }
        if !self.di2.is_empty() {
            self.di2.copy_within(from..to, 0);
        }
        self.rem_front = true;
    }

    /// Where the next read goes: right after the carried remainder.
    pub fn fetch_slots(&mut self) -> FetchSlots<'_> {
        let rem = self.rem;
        FetchSlots {
            ai1: self.ai1.get_mut(rem * self.l1..).unwrap_or_default(),
            ai2: self.ai2.get_mut(rem * self.l2..).unwrap_or_default(),
            di1: self.di1.get_mut(rem..).unwrap_or_default(),
            di2: self.di2.get_mut(rem..).unwrap_or_default(),
        }
    }

    /// Account for `n` freshly read scans; returns whole timepoints ready.
    pub fn commit(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let total = n + self.rem;
        let whole = total / self.layout.kmux;
        if whole > 0 {
            self.rem = total - self.layout.kmux * whole;
            self.rem_front = false;
            self.filled = total;
        } else {
            self.rem = total;
            self.rem_front = true;
        }
        whole
    }

    /// Merge the first `whole` timepoints into frames.
    pub fn demux_merge(&mut self, whole: usize) -> &[i16] {
        let Self {
            layout,
            l1,
            l2,
            ai1,
            ai2,
            di1,
            di2,
            tmp,
            xa_sum,
            merged,
            ..
        } = self;
        let (l1, l2) = (*l1, *l2);
        let kmux = layout.kmux;
        let lines = layout.muxed_lines();
        let width = layout.frame_width();
        let (d1, d2) = (layout.dev1, layout.dev2);

        merged.clear();
        merged.resize(whole * width, 0);

        for (w, row) in merged.chunks_exact_mut(width).enumerate() {
            xa_sum.fill(0);

            for s in 0..kmux {
                let scan = w * kmux + s;
                let a1 = &ai1[scan * l1..(scan + 1) * l1];
                let a2 = &ai2[scan * l2..(scan + 1) * l2];
                let t = &mut tmp[s * lines..(s + 1) * lines];

                let (mn, ma) = t.split_at_mut(d1.mn + d2.mn);
                mn[..d1.mn].copy_from_slice(&a1[..d1.mn]);
                mn[d1.mn..].copy_from_slice(&a2[..d2.mn]);
                ma[..d1.ma].copy_from_slice(&a1[d1.mn..d1.mn + d1.ma]);
                ma[d1.ma..].copy_from_slice(&a2[d2.mn..d2.mn + d2.ma]);

                let (xs1, xs2) = xa_sum.split_at_mut(d1.xa);
                for (sum, &v) in xs1.iter_mut().zip(&a1[d1.mn + d1.ma..]) {
                    *sum += i64::from(v);
                }
                for (sum, &v) in xs2.iter_mut().zip(&a2[d2.mn + d2.ma..]) {
                    *sum += i64::from(v);
                }
            }

            // Row-major by mux slot -> column-major by logical channel
            for line in 0..lines {
                for s in 0..kmux {
                    row[line * kmux + s] = tmp[s * lines + line];
                }
            }

            let mut at = kmux * lines;
            for &sum in xa_sum.iter() {
                row[at] = (sum / kmux as i64) as i16;
                at += 1;
            }

            let word = |di: &[u32]| di.get(w * kmux).copied().unwrap_or(0);
            pack_digital(
                &mut row[at..],
                &[(word(&di1[..]), d1.xd_bytes), (word(&di2[..]), d2.xd_bytes)],
            );
        }
        &self.merged
    }
}
