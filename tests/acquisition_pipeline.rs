//! Probe acquisition end to end: worker pool over simulated hardware.
//!
//! Timing-dependent assertions use short configured intervals and margins
//! of a few loop periods; they check ordering and conservation. Exact gap
//! arithmetic is covered by the worker and queue unit tests.

use probe_daq::acquisition::imec::probe_queues;
use probe_daq::acquisition::mux_daq::mux_queue;
use probe_daq::acquisition::{Acquirer, ImecAcquirer, MuxDaqAcquirer, RunController};
use probe_daq::config::{AcqConfig, DeviceChannels, ProbeConfig, ProbeSettings, SyncSource};
use probe_daq::data::stream_queue::{MemoryStreamQueue, QueueEntry, StreamQueue};
use probe_daq::hardware::mock::{calls, SimMuxDaqHardware, SimProbeHardware};
use probe_daq::hardware::DeviceId;
use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

const RATE: f64 = 12_000.0;

fn probe(slot: u8, port: u8) -> ProbeConfig {
    ProbeConfig {
        slot,
        port,
        ap_channels: 8,
        lf_channels: 8,
        sync_channels: 1,
        calibrated: true,
        led: false,
        settings: ProbeSettings::default(),
    }
}

fn config(probes: Vec<ProbeConfig>) -> AcqConfig {
    let mut config = AcqConfig::default();
    config.imec.enabled = true;
    config.imec.sample_rate = RATE;
    config.imec.sync = SyncSource::Imec { slot: 2 };
    config.imec.probes = probes;
    config.timing.imec_loop_period_ms = 3;
    config.timing.probes_per_worker = 1;
    config.timing.stats_interval_ms = 20;
    config.timing.no_data_grace_ms = 150;
    config.timing.join_poll_ms = 10;
    config.validate().unwrap();
    config
}

struct Rig {
    hw: Arc<SimProbeHardware>,
    queues: Vec<Arc<MemoryStreamQueue>>,
}

fn rig(config: &AcqConfig) -> (Rig, Vec<Arc<dyn StreamQueue>>) {
    let hw = Arc::new(SimProbeHardware::from_config(&config.imec));
    let queues = probe_queues(&config.imec, 10.0);
    let dyn_queues = queues.iter().map(|q| q.clone() as Arc<dyn StreamQueue>).collect();
    (Rig { hw, queues }, dyn_queues)
}

#[test]
fn streams_start_together() {
    let config = config(vec![probe(2, 1), probe(2, 2), probe(3, 1), probe(3, 2)]);
    let (rig, queues) = rig(&config);
    let mut ctl = RunController::new();
    ctl.add(ImecAcquirer::new(&config, rig.hw.clone(), queues, ctl.reporter()).unwrap());

    ctl.start().unwrap();
    let start = ctl.acquirers()[0].run_state().start_instant().unwrap();
    sleep(Duration::from_millis(200));
    ctl.stop();

    let t_zeros: Vec<_> = rig.queues.iter().map(|q| q.t_zero().unwrap()).collect();
    let first = *t_zeros.iter().min().unwrap();
    let last = *t_zeros.iter().max().unwrap();
    assert!(first >= start);
    assert!(first - start < Duration::from_millis(100));
    // Every worker publishes its first block within a few loop periods
    assert!(last - first < Duration::from_millis(25), "spread {:?}", last - first);

    for q in &rig.queues {
        assert!(q.totals().data_frames > 0, "{} got nothing", q.name());
        assert_eq!(q.totals().gaps, 0);
    }
}

#[test]
fn live_update_pauses_one_slot_and_conserves_counts() {
    let config = config(vec![probe(2, 1), probe(2, 2), probe(3, 1)]);
    let (rig, queues) = rig(&config);
    let mut acq = ImecAcquirer::new(&config, rig.hw.clone(), queues, Arc::new(probe_daq::error::LogReporter)).unwrap();

    acq.configure().unwrap();
    acq.run().unwrap();
    sleep(Duration::from_millis(150));

    let settings = ProbeSettings {
        bank: 1,
        ap_gain: 2000,
        ..ProbeSettings::default()
    };
    // Slot 2's probes are on different workers; both must acknowledge
    acq.update(0, settings.clone()).unwrap();
    assert!(acq.is_running());
    sleep(Duration::from_millis(150));
    acq.stop();

    assert_eq!(rig.hw.settings(2, 1), Some(settings.clone()));
    assert_eq!(acq.settings(0), Some(&settings));
    assert!(!acq.run_state().has_error());

    let calls = rig.hw.calls();
    let trigger_input = calls
        .iter()
        .rposition(|c| c == "set_trigger_input(2, Software)")
        .unwrap();
    assert_eq!(
        &calls[trigger_input - 2..trigger_input + 3],
        &[
            "arm(2)",
            "write_probe_settings(2, 1)",
            "set_trigger_input(2, Software)",
            "arm(2)",
            "software_trigger(2)",
        ]
    );
    // Slot 3 was armed once at configure and never touched again
    assert_eq!(calls.iter().filter(|c| *c == "arm(3)").count(), 1);

    let totals: Vec<_> = rig.queues.iter().map(|q| q.totals()).collect();
    assert_eq!(totals[0].gaps, 1);
    assert_eq!(totals[1].gaps, 1);
    assert_eq!(totals[2].gaps, 0);

    // The zero-fill keeps paused streams aligned with the one that never
    // paused, to within a few fetch loops of scheduling slack
    let slack = (RATE * 0.025) as i64;
    let reference = totals[2].total_frames() as i64;
    for t in &totals[..2] {
        let diff = (t.total_frames() as i64 - reference).abs();
        assert!(diff <= slack, "{} vs {}", t.total_frames(), reference);
    }

    let published: u64 = acq.published_frames().iter().map(|&(_, n)| n).sum();
    let queued: u64 = totals.iter().map(|t| t.data_frames).sum();
    assert_eq!(published, queued);
}

#[tokio::test]
async fn fifo_overflow_is_fatal_once_and_stops_publishing() {
    let config = config(vec![probe(2, 1)]);
    let (rig, queues) = rig(&config);
    rig.hw.set_fill_profile(2, 1, [0, 10, 50, 96]);

    let mut ctl = RunController::new();
    ctl.add(ImecAcquirer::new(&config, rig.hw.clone(), queues, ctl.reporter()).unwrap());
    ctl.start().unwrap();

    let fatal = ctl.wait_for_fatal(Duration::from_secs(5)).await;
    assert_eq!(fatal.as_deref(), Some("FIFO queue Imec 0 overflow (96%); stopping run."));

    let run = ctl.acquirers()[0].run_state();
    assert!(run.is_stopped());
    assert!(run.has_error());

    // The worker has exited: nothing more reaches the queue
    let frames = rig.queues[0].totals().data_frames;
    sleep(Duration::from_millis(50));
    assert_eq!(rig.queues[0].totals().data_frames, frames);

    ctl.stop();
    assert_eq!(ctl.try_fatal(), None);
}

#[tokio::test]
async fn silent_probe_fails_the_run_by_name() {
    let config = config(vec![probe(2, 1), probe(2, 2)]);
    let (rig, queues) = rig(&config);
    rig.hw.set_silent(2, 2);

    let mut ctl = RunController::new();
    ctl.add(ImecAcquirer::new(&config, rig.hw.clone(), queues, ctl.reporter()).unwrap());
    ctl.start().unwrap();

    let fatal = ctl.wait_for_fatal(Duration::from_secs(5)).await;
    assert_eq!(fatal.as_deref(), Some("Imec probe 1 getting no samples."));
    ctl.stop();

    assert!(rig.queues[0].totals().data_frames > 0);
    assert_eq!(rig.queues[1].totals().data_frames, 0);
}

#[tokio::test]
async fn fatal_imec_error_stops_the_mux_daq_too() {
    let mut config = config(vec![probe(2, 1)]);
    config.mux_daq.enabled = true;
    config.mux_daq.sample_rate = 2000.0;
    config.mux_daq.mux_factor = 4;
    config.mux_daq.dev1 = DeviceChannels { mn: 2, ma: 0, xa: 1, xd_bytes: 1 };
    config.mux_daq.start_line_enabled = true;
    config.timing.mux_latency_secs = 0.5;
    config.validate().unwrap();

    let (rig, queues) = rig(&config);
    rig.hw.set_silent(2, 1);
    let mux_hw = Arc::new(SimMuxDaqHardware::new());
    let mux_q = mux_queue(&config.mux_daq, 5.0);

    let mut ctl = RunController::new();
    ctl.add(ImecAcquirer::new(&config, rig.hw.clone(), queues, ctl.reporter()).unwrap());
    ctl.add(MuxDaqAcquirer::new(&config, mux_hw.clone(), mux_q.clone(), ctl.reporter()).unwrap());
    ctl.start().unwrap();

    let fatal = ctl.wait_for_fatal(Duration::from_secs(5)).await;
    assert_eq!(fatal.as_deref(), Some("Imec probe 0 getting no samples."));
    assert!(!ctl.is_running());

    let mux = &ctl.acquirers()[1];
    assert!(!mux.is_running());
    // Stopped by the session, not by an error of its own
    assert!(!mux.run_state().has_error());
    assert!(!mux_hw.start_line());
    assert!(!mux_hw.has_tasks(DeviceId::Dev1));
    assert!(!rig.hw.is_slot_open(2));

    let frames = mux_q.totals().data_frames;
    assert!(frames > 0, "mux DAQ never streamed");
    sleep(Duration::from_millis(60));
    assert_eq!(mux_q.totals().data_frames, frames);
    assert_eq!(ctl.try_fatal(), None);
}

#[tokio::test]
async fn read_fault_carries_call_target_and_vendor_text() {
    let config = config(vec![probe(2, 1)]);
    let (rig, queues) = rig(&config);

    let mut ctl = RunController::new();
    ctl.add(ImecAcquirer::new(&config, rig.hw.clone(), queues, ctl.reporter()).unwrap());
    ctl.start().unwrap();
    sleep(Duration::from_millis(50));
    rig.hw.fail_next(calls::READ_PACKETS, -5, "headstage link lost");

    let fatal = ctl.wait_for_fatal(Duration::from_secs(5)).await;
    assert_eq!(
        fatal.as_deref(),
        Some("readElectrodeData(slot 2, port 1) error code -5 'headstage link lost'")
    );
    ctl.stop();
    assert!(!rig.hw.is_slot_open(2));
}

#[test]
fn restart_after_stop_resumes_the_stream_clock() {
    let config = config(vec![probe(2, 1)]);
    let (rig, queues) = rig(&config);
    let mut acq = ImecAcquirer::new(&config, rig.hw.clone(), queues, Arc::new(probe_daq::error::LogReporter)).unwrap();

    let (mut starts, mut stops, mut published) = (Vec::new(), Vec::new(), 0u64);
    let mut runs = Vec::new();
    for _ in 0..2 {
        acq.configure().unwrap();
        acq.run().unwrap();
        let run = acq.run_state();
        starts.push(run.start_instant().unwrap());

        sleep(Duration::from_millis(60));
        assert_eq!(run.awake_workers(), 1);
        runs.push(run);
        acq.stop();
        stops.push(Instant::now());
        assert!(!acq.is_running());
        assert!(acq.published_frames()[0].1 > 0);
        published += acq.published_frames()[0].1;
        sleep(Duration::from_millis(40));
    }
    assert!(!rig.hw.is_slot_open(2));
    // A fresh barrier every run
    assert!(!Arc::ptr_eq(&runs[0], &runs[1]));
    assert!(starts[1] > stops[0]);

    let q = &rig.queues[0];
    let totals = q.totals();
    assert_eq!(totals.data_frames, published);

    // Time-zero stays with the first run; the idle stretch is one gap
    let t_zero = totals.t_zero.unwrap();
    assert!(t_zero >= starts[0] && t_zero - starts[0] < Duration::from_millis(50));
    assert_eq!(totals.gaps, 1);
    let gap = q
        .snapshot()
        .into_iter()
        .find_map(|e| match e {
            QueueEntry::Gap { frames, .. } => Some(frames as f64),
            QueueEntry::Samples { .. } => None,
        })
        .unwrap();
    let idle = (starts[1] - stops[0]).as_secs_f64() * RATE;
    assert!(gap >= idle - 0.015 * RATE, "gap {gap} idle {idle}");
    assert!(gap <= idle + 0.05 * RATE, "gap {gap} idle {idle}");

    // The frame clock still tracks the wall clock after the restart
    let end = q.end_time().unwrap();
    let skew = if end > stops[1] { end - stops[1] } else { stops[1] - end };
    assert!(skew < Duration::from_millis(40), "{skew:?}");
}
