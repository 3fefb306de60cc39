//! Configuration loading from TOML files and environment overrides.

use probe_daq::config::{AcqConfig, CalibrationPolicy, LogFormat, SyncSource, TriggerSource};
use std::io::Write;
use tempfile::NamedTempFile;

const SESSION: &str = r#"
[application]
log_level = "debug"
log_format = "json"

[timing]
stats_interval_ms = 1000
fifo_overflow_pct = 90

[imec]
enabled = true
sample_rate = 30000.0
trigger = "hardware"
calibration_policy = "warn"
sync = { kind = "imec", slot = 3 }

[[imec.probes]]
slot = 3
port = 1

[[imec.probes]]
slot = 4
port = 2
lf_channels = 0
calibrated = false

[imec.probes.settings]
bank = 2
ap_gain = 1000
standby = [5, 6]

[mux_daq]
enabled = true
mux_factor = 32
dual_device = true

[mux_daq.dev1]
mn = 8
ma = 1
xa = 2
xd_bytes = 1

[mux_daq.dev2]
mn = 8
xd_bytes = 2
"#;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn loads_full_session_file() {
    let file = write_config(SESSION);
    let config = AcqConfig::load_from(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.timing.stats_interval_ms, 1000);
    assert_eq!(config.timing.fifo_overflow_pct, 90);
    // Untouched timing keeps the production defaults
    assert_eq!(config.timing.packets_per_fetch, 24);
    assert_eq!(config.timing.mux_empty_fetch_limit, 1100);

    let imec = &config.imec;
    assert_eq!(imec.trigger, TriggerSource::Hardware);
    assert_eq!(imec.calibration_policy, CalibrationPolicy::Warn);
    assert_eq!(imec.sync, SyncSource::Imec { slot: 3 });
    assert_eq!(imec.slots(), vec![3, 4]);
    assert_eq!(imec.probes[0].ap_channels, 384);
    assert_eq!(imec.probes[0].lf_channels, 384);
    assert!(imec.probes[0].calibrated);
    assert_eq!(imec.probes[1].lf_channels, 0);
    assert_eq!(imec.probes[1].settings.bank, 2);
    assert_eq!(imec.probes[1].settings.ap_gain, 1000);
    assert_eq!(imec.probes[1].settings.lf_gain, 250);
    assert_eq!(imec.probes[1].settings.standby, vec![5, 6]);

    let mux = &config.mux_daq;
    assert_eq!(mux.dev1.analog_lines(), 11);
    assert_eq!(mux.dev2.xd_bytes, 2);
    assert_eq!(mux.sample_rate, 25_000.0);
}

#[test]
fn missing_file_yields_idle_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AcqConfig::load_from(dir.path().join("absent.toml")).unwrap();
    config.validate().unwrap();
    assert!(!config.imec.enabled);
    assert!(!config.mux_daq.enabled);
}

#[test]
fn environment_overrides_file() {
    let file = write_config("[timing]\njoin_timeout_ms = 500\n");
    std::env::set_var("PROBE_DAQ_TIMING__JOIN_TIMEOUT_MS", "1234");
    let config = AcqConfig::load_from(file.path());
    std::env::remove_var("PROBE_DAQ_TIMING__JOIN_TIMEOUT_MS");
    assert_eq!(config.unwrap().timing.join_timeout_ms, 1234);
}

#[test]
fn validation_rejects_inconsistent_sessions() {
    let cases = [
        // Same (slot, port) twice
        "[imec]\nenabled = true\n[[imec.probes]]\nslot = 2\nport = 1\n[[imec.probes]]\nslot = 2\nport = 1\n",
        // Warn threshold above overflow
        "[timing]\nfifo_warn_pct = 96\n",
        // Sync source slot without probes
        "[imec]\nenabled = true\nsync = { kind = \"external\", slot = 9 }\n[[imec.probes]]\nslot = 2\nport = 1\n",
        // Second device named but not enabled
        "[mux_daq]\nenabled = true\n[mux_daq.dev1]\nmn = 1\n[mux_daq.dev2]\nmn = 1\n",
        "[mux_daq]\nenabled = true\nmux_factor = 0\n[mux_daq.dev1]\nmn = 1\n",
        "[mux_daq]\nenabled = true\n[mux_daq.dev1]\nxd_bytes = 5\n",
    ];
    for case in cases {
        let file = write_config(case);
        let config = AcqConfig::load_from(file.path()).unwrap();
        assert!(config.validate().is_err(), "accepted:\n{case}");
    }
}

#[test]
fn malformed_file_is_a_config_error() {
    let file = write_config("[imec]\nsample_rate = \"fast\"\n");
    let err = AcqConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().starts_with("Configuration error:"));
}
