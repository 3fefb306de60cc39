//! Streaming second-order IIR (biquad) filter.
//!
//! Coefficients come from the bilinear transform of the analog prototype,
//! with the corner frequency pre-warped through `K = tan(pi * fc)`. `fc` is
//! normalised to the sample rate (`f / fs`, so Nyquist is 0.5).
//!
//! The filter runs in place on interleaved `i16` sample buffers (one frame
//! per timepoint, `n_chans` samples per frame). Samples are normalised by
//! `max_int`, passed through the transposed direct form II
//!
//! ```text
//! out = a0*in + z1
//! z1  = a1*in + z2 - b1*out
//! z2  = a2*in      - b2*out
//! ```
//!
//! and written back truncated and saturated to `[-max_int, max_int - 1]`.
//!
//! Four apply variants differ only in who owns the `(z1, z2)` memory:
//!
//! | Variant | Memory |
//! |---|---|
//! | [`Biquad::apply_blockwise_mem`] | one pair per channel in `c0..c_lim` |
//! | [`Biquad::apply1_blockwise_mem_all`] | one pair per channel of the frame, keyed by channel index |
//! | [`Biquad::apply1_blockwise_mem1`] | one pair, whatever channel is selected |
//! | [`Biquad::apply1_blockwise_no_mem`] | none; starts from zero every call |
//!
//! Memory persists across calls until the coefficients change or the memory
//! shape changes.
//!
//! # Example
//! ```
//! use probe_daq::data::biquad::{Biquad, BiquadType};
//!
//! // 300 Hz high-pass at 30 kHz
//! let mut hp = Biquad::new(BiquadType::HighPass, 300.0 / 30_000.0, 0.0, 0.0);
//! let mut block = vec![1000i16; 4 * 2]; // 4 timepoints, 2 channels
//! hp.apply_blockwise_mem(&mut block, 32768, 2, 0, 2);
//! ```

use num_complex::Complex64;
use std::f64::consts::{PI, SQRT_2};

/// Filter shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiquadType {
    LowPass,
    HighPass,
    /// Constant 0 dB peak gain.
    BandPass,
    Notch,
    /// Peaking EQ; uses the gain.
    Peak,
    /// Uses the gain.
    LowShelf,
    /// Uses the gain.
    HighShelf,
}

/// Normalised transfer-function coefficients.
///
/// `H(z) = (a0 + a1 z^-1 + a2 z^-2) / (1 + b1 z^-1 + b2 z^-2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoefficients {
    pub a0: f64,
    pub a1: f64,
    pub a2: f64,
    pub b1: f64,
    pub b2: f64,
}

impl BiquadCoefficients {
    const IDENTITY: Self = Self {
        a0: 1.0,
        a1: 0.0,
        a2: 0.0,
        b1: 0.0,
        b2: 0.0,
    };

    fn design(kind: BiquadType, fc: f64, q: f64, peak_gain_db: f64) -> Self {
        let k = (PI * fc).tan();
        let kk = k * k;
        let v = 10f64.powf(peak_gain_db.abs() / 20.0);
        let boost = peak_gain_db >= 0.0;

        match kind {
            BiquadType::LowPass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a0 = kk * norm;
                Self {
                    a0,
                    a1: 2.0 * a0,
                    a2: a0,
                    b1: 2.0 * (kk - 1.0) * norm,
                    b2: (1.0 - k / q + kk) * norm,
                }
            }
            BiquadType::HighPass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                Self {
                    a0: norm,
                    a1: -2.0 * norm,
                    a2: norm,
                    b1: 2.0 * (kk - 1.0) * norm,
                    b2: (1.0 - k / q + kk) * norm,
                }
            }
            BiquadType::BandPass => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a0 = k / q * norm;
                Self {
                    a0,
                    a1: 0.0,
                    a2: -a0,
                    b1: 2.0 * (kk - 1.0) * norm,
                    b2: (1.0 - k / q + kk) * norm,
                }
            }
            BiquadType::Notch => {
                let norm = 1.0 / (1.0 + k / q + kk);
                let a1 = 2.0 * (kk - 1.0) * norm;
                Self {
                    a0: (1.0 + kk) * norm,
                    a1,
                    a2: (1.0 + kk) * norm,
                    b1: a1,
                    b2: (1.0 - k / q + kk) * norm,
                }
            }
            BiquadType::Peak => {
                // Cut mirrors boost with V moved to the denominator
                let (num_q, den_q) = if boost { (v / q, 1.0 / q) } else { (1.0 / q, v / q) };
                let norm = 1.0 / (1.0 + den_q * k + kk);
                let a1 = 2.0 * (kk - 1.0) * norm;
                Self {
                    a0: (1.0 + num_q * k + kk) * norm,
                    a1,
                    a2: (1.0 - num_q * k + kk) * norm,
                    b1: a1,
                    b2: (1.0 - den_q * k + kk) * norm,
                }
            }
            BiquadType::LowShelf => {
                let sv = (2.0 * v).sqrt();
                if boost {
                    let norm = 1.0 / (1.0 + SQRT_2 * k + kk);
                    Self {
                        a0: (1.0 + sv * k + v * kk) * norm,
                        a1: 2.0 * (v * kk - 1.0) * norm,
                        a2: (1.0 - sv * k + v * kk) * norm,
                        b1: 2.0 * (kk - 1.0) * norm,
                        b2: (1.0 - SQRT_2 * k + kk) * norm,
                    }
                } else {
                    let norm = 1.0 / (1.0 + sv * k + v * kk);
                    Self {
                        a0: (1.0 + SQRT_2 * k + kk) * norm,
                        a1: 2.0 * (kk - 1.0) * norm,
                        a2: (1.0 - SQRT_2 * k + kk) * norm,
                        b1: 2.0 * (v * kk - 1.0) * norm,
                        b2: (1.0 - sv * k + v * kk) * norm,
                    }
                }
            }
            BiquadType::HighShelf => {
                let sv = (2.0 * v).sqrt();
                if boost {
                    let norm = 1.0 / (1.0 + SQRT_2 * k + kk);
                    Self {
                        a0: (v + sv * k + kk) * norm,
                        a1: 2.0 * (kk - v) * norm,
                        a2: (v - sv * k + kk) * norm,
                        b1: 2.0 * (kk - 1.0) * norm,
                        b2: (1.0 - SQRT_2 * k + kk) * norm,
                    }
                } else {
                    let norm = 1.0 / (v + sv * k + kk);
                    Self {
                        a0: (1.0 + SQRT_2 * k + kk) * norm,
                        a1: 2.0 * (kk - 1.0) * norm,
                        a2: (1.0 - SQRT_2 * k + kk) * norm,
                        b1: 2.0 * (kk - v) * norm,
                        b2: (v - sv * k + kk) * norm,
                    }
                }
            }
        }
    }

    /// Complex frequency response at normalised frequency `fc`.
    pub fn response(&self, fc: f64) -> Complex64 {
        let z1 = Complex64::from_polar(1.0, -2.0 * PI * fc);
        let z2 = z1 * z1;
        let num = self.a0 + z1 * self.a1 + z2 * self.a2;
        let den = 1.0 + z1 * self.b1 + z2 * self.b2;
        num / den
    }

    /// One step of the difference equation.
    #[inline]
    fn step(&self, input: f64, z1: &mut f64, z2: &mut f64) -> f64 {
        let out = input * self.a0 + *z1;
        *z1 = input * self.a1 + *z2 - self.b1 * out;
        *z2 = input * self.a2 - self.b2 * out;
        out
    }
}

/// Second-order IIR filter with per-channel streaming memory.
#[derive(Debug, Clone)]
pub struct Biquad {
    kind: BiquadType,
    fc: f64,
    q: f64,
    peak_gain_db: f64,
    coefs: BiquadCoefficients,
    z1: f64,
    z2: f64,
    vz1: Vec<f64>,
    vz2: Vec<f64>,
}

impl Default for Biquad {
    /// Pass-through low-pass at Nyquist.
    fn default() -> Self {
        Self {
            kind: BiquadType::LowPass,
            fc: 0.5,
            q: 0.5f64.sqrt(),
            peak_gain_db: 0.0,
            coefs: BiquadCoefficients::IDENTITY,
            z1: 0.0,
            z2: 0.0,
            vz1: Vec::new(),
            vz2: Vec::new(),
        }
    }
}

impl Biquad {
    /// Design a filter. A `q` of zero selects the Butterworth value `sqrt(0.5)`.
    pub fn new(kind: BiquadType, fc: f64, q: f64, peak_gain_db: f64) -> Self {
        let mut filter = Self::default();
        filter.set_biquad(kind, fc, q, peak_gain_db);
        filter
    }

    /// Change every parameter at once.
    pub fn set_biquad(&mut self, kind: BiquadType, fc: f64, q: f64, peak_gain_db: f64) {
        self.kind = kind;
        self.fc = fc;
        self.q = if q == 0.0 { 0.5f64.sqrt() } else { q };
        self.peak_gain_db = peak_gain_db;
        self.recalc();
    }

    pub fn set_type(&mut self, kind: BiquadType) {
        if kind != self.kind {
            self.kind = kind;
            self.recalc();
        }
    }

    pub fn set_fc(&mut self, fc: f64) {
        if fc != self.fc {
            self.fc = fc;
            self.recalc();
        }
    }

    pub fn set_q(&mut self, q: f64) {
        if q != self.q {
            self.q = q;
            self.recalc();
        }
    }

    pub fn set_peak_gain(&mut self, peak_gain_db: f64) {
        if peak_gain_db != self.peak_gain_db {
            self.peak_gain_db = peak_gain_db;
            self.recalc();
        }
    }

    pub fn kind(&self) -> BiquadType {
        self.kind
    }

    pub fn coefficients(&self) -> BiquadCoefficients {
        self.coefs
    }

    /// Complex frequency response at normalised frequency `fc`.
    pub fn response(&self, fc: f64) -> Complex64 {
        self.coefs.response(fc)
    }

    /// Recompute coefficients; clears all filter memory.
    fn recalc(&mut self) {
        self.vz1.clear();
        self.vz2.clear();
        self.z1 = 0.0;
        self.z2 = 0.0;
        self.coefs = BiquadCoefficients::design(self.kind, self.fc, self.q, self.peak_gain_db);
    }

    /// Filter a single floating-point sample using the scalar memory pair.
    pub fn process(&mut self, input: f64) -> f64 {
        let (mut z1, mut z2) = (self.z1, self.z2);
        let out = self.coefs.step(input, &mut z1, &mut z2);
        self.z1 = z1;
        self.z2 = z2;
        out
    }

    /// Filter channels `c0..c_lim` of every frame, one memory pair per channel.
    ///
    /// Memory is reset when the channel range width changes.
    pub fn apply_blockwise_mem(
        &mut self,
        data: &mut [i16],
        max_int: i32,
        n_chans: usize,
        c0: usize,
        c_lim: usize,
    ) {
        let width = c_lim.saturating_sub(c0);
        self.ensure_memory(width);
        for c in c0..c_lim.min(n_chans) {
            let (mut z1, mut z2) = (self.vz1[c - c0], self.vz2[c - c0]);
            run_channel(&self.coefs, data, max_int, n_chans, c, &mut z1, &mut z2);
            self.vz1[c - c0] = z1;
            self.vz2[c - c0] = z2;
        }
    }

    /// Filter channel `ichan`, keeping one memory pair for every channel of
    /// the frame so different channels can be filtered on alternate calls.
    pub fn apply1_blockwise_mem_all(
        &mut self,
        data: &mut [i16],
        max_int: i32,
        n_chans: usize,
        ichan: usize,
    ) {
        if ichan >= n_chans {
            return;
        }
        self.ensure_memory(n_chans);
        let (mut z1, mut z2) = (self.vz1[ichan], self.vz2[ichan]);
        run_channel(&self.coefs, data, max_int, n_chans, ichan, &mut z1, &mut z2);
        self.vz1[ichan] = z1;
        self.vz2[ichan] = z2;
    }

    /// Filter channel `ichan` with a single memory pair shared by whichever
    /// channel is selected.
    pub fn apply1_blockwise_mem1(
        &mut self,
        data: &mut [i16],
        max_int: i32,
        n_chans: usize,
        ichan: usize,
    ) {
        if ichan >= n_chans {
            return;
        }
        self.ensure_memory(1);
        let (mut z1, mut z2) = (self.vz1[0], self.vz2[0]);
        run_channel(&self.coefs, data, max_int, n_chans, ichan, &mut z1, &mut z2);
        self.vz1[0] = z1;
        self.vz2[0] = z2;
    }

    /// Filter channel `ichan` starting from zero memory; nothing carries over.
    pub fn apply1_blockwise_no_mem(&self, data: &mut [i16], max_int: i32, n_chans: usize, ichan: usize) {
        if ichan >= n_chans {
            return;
        }
        let (mut z1, mut z2) = (0.0, 0.0);
        run_channel(&self.coefs, data, max_int, n_chans, ichan, &mut z1, &mut z2);
    }

    fn ensure_memory(&mut self, n: usize) {
        if self.vz1.len() != n {
            self.vz1 = vec![0.0; n];
            self.vz2 = vec![0.0; n];
        }
    }
}

fn run_channel(
    coefs: &BiquadCoefficients,
    data: &mut [i16],
    max_int: i32,
    n_chans: usize,
    chan: usize,
    z1: &mut f64,
    z2: &mut f64,
) {
    if n_chans == 0 || max_int <= 0 {
        return;
    }
    let scale = 1.0 / f64::from(max_int);
    for sample in data.iter_mut().skip(chan).step_by(n_chans) {
        let out = coefs.step(f64::from(*sample) * scale, z1, z2);
        *sample = saturate(out * f64::from(max_int), max_int);
    }
}

/// Truncate toward zero, then clamp to `[-max_int, max_int - 1]`.
#[inline]
fn saturate(value: f64, max_int: i32) -> i16 {
    let truncated = value as i64;
    let clamped = truncated.clamp(-i64::from(max_int), i64::from(max_int) - 1);
    clamped.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16
}
