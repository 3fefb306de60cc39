//! Acquisition configuration using Figment.
//!
//! Configuration is an immutable snapshot for the duration of a run. It is
//! loaded from:
//! 1. a TOML file (default `config/probe_daq.toml`)
//! 2. environment variables prefixed with `PROBE_DAQ_`, nested keys split on
//!    `__` (e.g. `PROBE_DAQ_TIMING__STATS_INTERVAL_MS=1000`)
//!
//! Every section has defaults, so an empty file yields a valid (idle)
//! configuration. The timing constants default to the values the production
//! fetch loops were tuned with.
//!
//! # Example
//! ```no_run
//! use probe_daq::config::AcqConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcqConfig::load_from("config/probe_daq.toml")?;
//! config.validate()?;
//! println!("{} probes", config.imec.probes.len());
//! # Ok(())
//! # }
//! ```

use crate::error::{AcqError, AcqResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/probe_daq.toml";

/// Top-level acquisition configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcqConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Loop periods, thresholds and timeouts
    #[serde(default)]
    pub timing: TimingConfig,
    /// Multi-probe front end
    #[serde(default)]
    pub imec: ImecConfig,
    /// Multiplexed analog/digital DAQ device
    #[serde(default)]
    pub mux_daq: MuxDaqConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed with colors (development)
    #[default]
    Pretty,
    /// Single-line, no colors (production)
    Compact,
    /// JSON lines (log aggregation)
    Json,
}

/// Timing constants for the fetch loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Target period of one probe-worker iteration.
    pub imec_loop_period_ms: u64,
    /// Maximum electrode packets requested per fetch.
    pub packets_per_fetch: usize,
    /// Maximum probes serviced by one worker thread.
    pub probes_per_worker: usize,
    /// Interval between FIFO fill checks.
    pub stats_interval_ms: u64,
    /// How long a stream may go without its first sample before the run is failed.
    pub no_data_grace_ms: u64,
    /// FIFO fill percentage that triggers a warning.
    pub fifo_warn_pct: u32,
    /// FIFO fill percentage that aborts the run.
    pub fifo_overflow_pct: u32,
    /// Consecutive fetches further apart than this are logged.
    pub fetch_interval_log_ms: u64,
    /// Teardown: how long to wait for workers before abandoning them.
    pub join_timeout_ms: u64,
    /// Teardown: poll interval while waiting for workers.
    pub join_poll_ms: u64,
    /// Ceiling on one pacing sleep in the probe loop.
    pub pacing_ceiling_us: u64,
    /// Nominal mux DAQ fetch period.
    pub mux_fetch_period_ms: u64,
    /// Ceiling on one pacing sleep in the mux DAQ loop.
    pub mux_pacing_ceiling_us: u64,
    /// Consecutive empty mux DAQ fetches tolerated before the run is failed.
    pub mux_empty_fetch_limit: u32,
    /// Seconds of data the mux DAQ raw buffers must hold.
    pub mux_latency_secs: f64,
    /// Period of the synthetic generators.
    pub sim_loop_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            imec_loop_period_ms: 3,
            packets_per_fetch: 24,
            probes_per_worker: 3,
            stats_interval_ms: 5000,
            no_data_grace_ms: 5000,
            fifo_warn_pct: 5,
            fifo_overflow_pct: 95,
            fetch_interval_log_ms: 10,
            join_timeout_ms: 2000,
            join_poll_ms: 200,
            pacing_ceiling_us: 1000,
            mux_fetch_period_ms: 1,
            mux_pacing_ceiling_us: 500,
            mux_empty_fetch_limit: 1100,
            mux_latency_secs: 2.0,
            sim_loop_ms: 20,
        }
    }
}

impl TimingConfig {
    pub fn imec_loop_period(&self) -> Duration {
        Duration::from_millis(self.imec_loop_period_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn no_data_grace(&self) -> Duration {
        Duration::from_millis(self.no_data_grace_ms)
    }

    pub fn fetch_interval_log(&self) -> Duration {
        Duration::from_millis(self.fetch_interval_log_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn join_poll(&self) -> Duration {
        Duration::from_millis(self.join_poll_ms)
    }

    pub fn pacing_ceiling(&self) -> Duration {
        Duration::from_micros(self.pacing_ceiling_us)
    }

    pub fn mux_pacing_ceiling(&self) -> Duration {
        Duration::from_micros(self.mux_pacing_ceiling_us)
    }

    pub fn sim_loop(&self) -> Duration {
        Duration::from_millis(self.sim_loop_ms)
    }
}

/// How acquisition is started once every slot is armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Software trigger issued by the acquirer on every slot.
    #[default]
    Software,
    /// Wait for an external hardware trigger.
    Hardware,
}

/// What to do with a probe whose calibration data are missing or stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationPolicy {
    /// Refuse to run.
    #[default]
    Required,
    /// Run uncalibrated and log a warning.
    Warn,
    /// Do not apply calibration at all.
    Skip,
}

/// Shared clock-edge sync source for all streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncSource {
    /// No sync signal.
    #[default]
    None,
    /// External pulser wired into the given slot.
    External { slot: u8 },
    /// Generated by the given slot and distributed to the others.
    Imec { slot: u8 },
    /// Generated by the mux DAQ device.
    MuxDaq,
}

/// Multi-probe front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImecConfig {
    /// Whether the probe front end takes part in the run
    #[serde(default)]
    pub enabled: bool,
    /// AP sample rate in Hz; LF is sampled at one twelfth of this
    #[serde(default = "default_imec_rate")]
    pub sample_rate: f64,
    #[serde(default)]
    pub trigger: TriggerSource,
    #[serde(default)]
    pub calibration_policy: CalibrationPolicy,
    #[serde(default)]
    pub sync: SyncSource,
    /// One entry per probe
    #[serde(default)]
    pub probes: Vec<ProbeConfig>,
}

impl Default for ImecConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: default_imec_rate(),
            trigger: TriggerSource::default(),
            calibration_policy: CalibrationPolicy::default(),
            sync: SyncSource::default(),
            probes: Vec::new(),
        }
    }
}

impl ImecConfig {
    /// Distinct slots used by the configured probes, ascending.
    pub fn slots(&self) -> Vec<u8> {
        let mut slots: Vec<u8> = self.probes.iter().map(|p| p.slot).collect();
        slots.sort_unstable();
        slots.dedup();
        slots
    }
}

/// One probe on the front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Chassis slot of the base station
    pub slot: u8,
    /// Headstage port on that base station
    pub port: u8,
    /// Action-potential band channels
    #[serde(default = "default_probe_channels")]
    pub ap_channels: usize,
    /// Low-frequency band channels (0 or equal to `ap_channels`)
    #[serde(default = "default_probe_channels")]
    pub lf_channels: usize,
    /// Sync/status word channels
    #[serde(default = "default_sync_channels")]
    pub sync_channels: usize,
    /// Whether valid ADC and gain calibration exist for this probe
    #[serde(default = "default_true")]
    pub calibrated: bool,
    /// Headstage LED
    #[serde(default)]
    pub led: bool,
    #[serde(default)]
    pub settings: ProbeSettings,
}

/// Channel settings written to a probe at configure time and on live update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Electrode bank selected for every channel
    pub bank: u8,
    /// Reference id
    pub reference: u8,
    /// AP band gain
    pub ap_gain: u32,
    /// LF band gain
    pub lf_gain: u32,
    /// AP band high-pass filter enabled
    pub ap_highpass: bool,
    /// Channels placed in standby
    pub standby: Vec<u16>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            bank: 0,
            reference: 0,
            ap_gain: 500,
            lf_gain: 250,
            ap_highpass: true,
            standby: Vec::new(),
        }
    }
}

/// Channel-class counts on one physical mux DAQ device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceChannels {
    /// Muxed neural lines
    pub mn: usize,
    /// Muxed auxiliary analog lines
    pub ma: usize,
    /// Oversampled auxiliary analog lines
    pub xa: usize,
    /// Digital input bytes (0..=4)
    pub xd_bytes: usize,
}

impl DeviceChannels {
    /// Analog input lines in fetch order (MN, MA, XA).
    pub fn analog_lines(&self) -> usize {
        self.mn + self.ma + self.xa
    }

    pub fn is_empty(&self) -> bool {
        self.analog_lines() == 0 && self.xd_bytes == 0
    }
}

/// Gains applied per channel class, used by the synthetic generator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassGains {
    pub mn: f64,
    pub ma: f64,
    pub xa: f64,
}

impl Default for ClassGains {
    fn default() -> Self {
        Self {
            mn: 200.0,
            ma: 1.0,
            xa: 1.0,
        }
    }
}

/// Multiplexed DAQ device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxDaqConfig {
    pub enabled: bool,
    /// Timepoint rate in Hz; the converters run `mux_factor` times faster
    pub sample_rate: f64,
    /// Logical channels interleaved on each muxed line
    pub mux_factor: usize,
    /// Upper end of the symmetric input range in volts
    pub range_max_volts: f64,
    /// Whether a second physical device shares the clock
    pub dual_device: bool,
    pub dev1: DeviceChannels,
    pub dev2: DeviceChannels,
    pub gains: ClassGains,
    /// Drive a digital "start" line high while running
    pub start_line_enabled: bool,
}

impl Default for MuxDaqConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 25_000.0,
            mux_factor: 32,
            range_max_volts: 2.5,
            dual_device: false,
            dev1: DeviceChannels::default(),
            dev2: DeviceChannels::default(),
            gains: ClassGains::default(),
            start_line_enabled: false,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "probe_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_imec_rate() -> f64 {
    30_000.0
}

fn default_probe_channels() -> usize {
    384
}

fn default_sync_channels() -> usize {
    1
}

fn default_true() -> bool {
    true
}

impl AcqConfig {
    /// Load configuration from the default path and environment variables.
    pub fn load() -> AcqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables override the file with prefix `PROBE_DAQ_`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PROBE_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AcqResult<()> {
        let invalid = |msg: String| Err(AcqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let t = &self.timing;
        if t.fifo_warn_pct == 0 || t.fifo_warn_pct >= t.fifo_overflow_pct || t.fifo_overflow_pct > 100 {
            return invalid(format!(
                "FIFO thresholds must satisfy 0 < warn ({}) < overflow ({}) <= 100",
                t.fifo_warn_pct, t.fifo_overflow_pct
            ));
        }
        if t.imec_loop_period_ms == 0 || t.packets_per_fetch == 0 || t.probes_per_worker == 0 {
            return invalid(
                "imec_loop_period_ms, packets_per_fetch and probes_per_worker must be non-zero"
                    .to_string(),
            );
        }
        if t.join_poll_ms == 0 || t.sim_loop_ms == 0 {
            return invalid("join_poll_ms and sim_loop_ms must be non-zero".to_string());
        }

        if self.imec.enabled {
            self.validate_imec()?;
        }
        if self.mux_daq.enabled {
            self.validate_mux_daq()?;
        }

        Ok(())
    }

    fn validate_imec(&self) -> AcqResult<()> {
        let imec = &self.imec;
        if imec.probes.is_empty() {
            return Err(AcqError::Configuration(
                "imec is enabled but no probes are configured".to_string(),
            ));
        }
        if imec.sample_rate <= 0.0 {
            return Err(AcqError::Configuration(format!(
                "Invalid imec sample_rate {}",
                imec.sample_rate
            )));
        }

        let mut seen = HashSet::new();
        for probe in &imec.probes {
            if !seen.insert((probe.slot, probe.port)) {
                return Err(AcqError::Configuration(format!(
                    "Duplicate probe at slot {} port {}",
                    probe.slot, probe.port
                )));
            }
            if probe.ap_channels == 0 {
                return Err(AcqError::Configuration(format!(
                    "Probe at slot {} port {} has no AP channels",
                    probe.slot, probe.port
                )));
            }
            if probe.lf_channels != 0 && probe.lf_channels != probe.ap_channels {
                return Err(AcqError::Configuration(format!(
                    "Probe at slot {} port {}: lf_channels ({}) must be 0 or equal ap_channels ({})",
                    probe.slot, probe.port, probe.lf_channels, probe.ap_channels
                )));
            }
            if probe.sync_channels != 1 {
                return Err(AcqError::Configuration(format!(
                    "Probe at slot {} port {}: exactly one sync channel is supported",
                    probe.slot, probe.port
                )));
            }
        }

        match imec.sync {
            SyncSource::External { slot } | SyncSource::Imec { slot } => {
                if !imec.slots().contains(&slot) {
                    return Err(AcqError::Configuration(format!(
                        "Sync source slot {slot} has no probes"
                    )));
                }
            }
            SyncSource::None | SyncSource::MuxDaq => {}
        }

        Ok(())
    }

    fn validate_mux_daq(&self) -> AcqResult<()> {
        let mux = &self.mux_daq;
        if mux.mux_factor == 0 {
            return Err(AcqError::Configuration("mux_factor must be >= 1".to_string()));
        }
        if mux.sample_rate <= 0.0 || mux.range_max_volts <= 0.0 {
            return Err(AcqError::Configuration(
                "mux_daq sample_rate and range_max_volts must be positive".to_string(),
            ));
        }
        if mux.dev1.is_empty() {
            return Err(AcqError::Configuration(
                "mux_daq is enabled but dev1 has no channels".to_string(),
            ));
        }
        for (name, dev) in [("dev1", &mux.dev1), ("dev2", &mux.dev2)] {
            if dev.xd_bytes > 4 {
                return Err(AcqError::Configuration(format!(
                    "{name}: xd_bytes {} exceeds the 4 bytes of a digital word",
                    dev.xd_bytes
                )));
            }
        }
        if mux.dual_device == mux.dev2.is_empty() {
            return Err(AcqError::Configuration(
                "dual_device must be set exactly when dev2 has channels".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn probe(slot: u8, port: u8) -> ProbeConfig {
        ProbeConfig {
            slot,
            port,
            ap_channels: 384,
            lf_channels: 384,
            sync_channels: 1,
            calibrated: true,
            led: false,
            settings: ProbeSettings::default(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AcqConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.packets_per_fetch, 24);
        assert_eq!(config.timing.imec_loop_period(), Duration::from_millis(3));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
name = "bench rig"
log_level = "debug"
log_format = "json"

[timing]
stats_interval_ms = 1000

[imec]
enabled = true
sample_rate = 30000.0
sync = {{ kind = "imec", slot = 2 }}

[[imec.probes]]
slot = 2
port = 1

[[imec.probes]]
slot = 2
port = 2
lf_channels = 0
settings = {{ ap_gain = 1000, standby = [191] }}

[mux_daq]
enabled = true
mux_factor = 8
dev1 = {{ mn = 2, ma = 1, xa = 1, xd_bytes = 1 }}
"#
        )
        .unwrap();

        let config = AcqConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "bench rig");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.timing.stats_interval_ms, 1000);
        assert_eq!(config.timing.fifo_overflow_pct, 95);
        assert_eq!(config.imec.probes.len(), 2);
        assert_eq!(config.imec.sync, SyncSource::Imec { slot: 2 });
        assert_eq!(config.imec.probes[1].lf_channels, 0);
        assert_eq!(config.imec.probes[1].settings.ap_gain, 1000);
        assert_eq!(config.imec.probes[1].settings.standby, vec![191]);
        assert_eq!(config.mux_daq.dev1.analog_lines(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_probe_rejected() {
        let mut config = AcqConfig::default();
        config.imec.enabled = true;
        config.imec.probes = vec![probe(3, 1), probe(3, 1)];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate probe"));
    }

    #[test]
    fn test_fifo_thresholds_validated() {
        let mut config = AcqConfig::default();
        config.timing.fifo_warn_pct = 95;
        config.timing.fifo_overflow_pct = 95;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mux_daq_validation() {
        let mut config = AcqConfig::default();
        config.mux_daq.enabled = true;
        assert!(config.validate().is_err(), "dev1 without channels");

        config.mux_daq.dev1 = DeviceChannels {
            mn: 1,
            ma: 0,
            xa: 0,
            xd_bytes: 5,
        };
        assert!(config.validate().is_err(), "too many digital bytes");

        config.mux_daq.dev1.xd_bytes = 2;
        config.mux_daq.dual_device = true;
        assert!(config.validate().is_err(), "dual device without dev2 channels");

        config.mux_daq.dev2.mn = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_slots_are_distinct_and_sorted() {
        let mut config = ImecConfig::default();
        config.probes = vec![probe(4, 1), probe(2, 2), probe(2, 1)];
        assert_eq!(config.slots(), vec![2, 4]);
    }
}
