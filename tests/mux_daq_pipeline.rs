//! Multiplexed DAQ path: demux engine framing and the acquirer loop over
//! simulated devices.

use probe_daq::acquisition::demux::{pack_digital, DemuxEngine, MuxLayout};
use probe_daq::acquisition::mux_daq::mux_queue;
use probe_daq::acquisition::{Acquirer, MuxDaqAcquirer, RunController};
use probe_daq::config::{AcqConfig, DeviceChannels};
use probe_daq::data::stream_queue::QueueEntry;
use probe_daq::error::LogReporter;
use probe_daq::hardware::mock::{calls, sim_analog_value, sim_digital_value, SimMuxDaqHardware};
use probe_daq::hardware::DeviceId;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

fn dev(mn: usize, ma: usize, xa: usize, xd_bytes: usize) -> DeviceChannels {
    DeviceChannels { mn, ma, xa, xd_bytes }
}

/// Expected merged frame for timepoint `w`, computed straight from the
/// per-scan device values.
fn expected_frame(layout: &MuxLayout, w: u64) -> Vec<i16> {
    let kmux = layout.kmux;
    let (d1, d2) = (layout.dev1, layout.dev2);
    let scan = |s: usize| w * kmux as u64 + s as u64;

    // Muxed lines in frame order: MN dev1, MN dev2, MA dev1, MA dev2
    let mut lines: Vec<(DeviceId, usize)> = Vec::new();
    lines.extend((0..d1.mn).map(|l| (DeviceId::Dev1, l)));
    lines.extend((0..d2.mn).map(|l| (DeviceId::Dev2, l)));
    lines.extend((0..d1.ma).map(|l| (DeviceId::Dev1, d1.mn + l)));
    lines.extend((0..d2.ma).map(|l| (DeviceId::Dev2, d2.mn + l)));

    let mut frame = Vec::new();
    for &(d, line) in &lines {
        frame.extend((0..kmux).map(|s| sim_analog_value(d, line, scan(s))));
    }
    let xa = (0..d1.xa)
        .map(|l| (DeviceId::Dev1, d1.mn + d1.ma + l))
        .chain((0..d2.xa).map(|l| (DeviceId::Dev2, d2.mn + d2.ma + l)));
    for (d, line) in xa {
        let sum: i64 = (0..kmux).map(|s| i64::from(sim_analog_value(d, line, scan(s)))).sum();
        frame.push((sum / kmux as i64) as i16);
    }
    let mut digital = vec![0i16; layout.digital_words()];
    pack_digital(
        &mut digital,
        &[
            (sim_digital_value(DeviceId::Dev1, scan(0), d1.xd_bytes), d1.xd_bytes),
            (sim_digital_value(DeviceId::Dev2, scan(0), d2.xd_bytes), d2.xd_bytes),
        ],
    );
    frame.extend(digital);
    assert_eq!(frame.len(), layout.frame_width());
    frame
}

#[test]
fn demux_round_trip_with_ragged_fetches() {
    for kmux in [1, 2, 8] {
        let layout = MuxLayout::new(kmux, dev(2, 1, 1, 1), dev(1, 0, 1, 2));
        let (l1, l2) = (layout.dev1.analog_lines(), layout.dev2.analog_lines());
        let mut engine = DemuxEngine::new(layout, 64).unwrap();

        let chunks = [1usize, 5, 3, 17, 2, 8, 0, 11];
        let total_scans = 40 * kmux as u64 + 3;
        let (mut next_scan, mut next_w) = (0u64, 0u64);

        for &chunk in chunks.iter().cycle() {
            if next_scan >= total_scans {
                break;
            }
            engine.slide_remainder();
            let slots = engine.fetch_slots();
            let n = chunk.min((total_scans - next_scan) as usize);
            for i in 0..n {
                let s = next_scan + i as u64;
                for line in 0..l1 {
                    slots.ai1[i * l1 + line] = sim_analog_value(DeviceId::Dev1, line, s);
                }
                for line in 0..l2 {
                    slots.ai2[i * l2 + line] = sim_analog_value(DeviceId::Dev2, line, s);
                }
                slots.di1[i] = sim_digital_value(DeviceId::Dev1, s, 1);
                slots.di2[i] = sim_digital_value(DeviceId::Dev2, s, 2);
            }
            next_scan += n as u64;

            let whole = engine.commit(n);
            let width = layout.frame_width();
            let merged = engine.demux_merge(whole).to_vec();
            assert_eq!(merged.len(), whole * width);
            for row in merged.chunks_exact(width) {
                assert_eq!(row, expected_frame(&layout, next_w).as_slice(), "kmux {kmux} timepoint {next_w}");
                next_w += 1;
            }
        }

        assert_eq!(next_w, total_scans / kmux as u64, "kmux {kmux}");
        assert_eq!(engine.remainder() as u64, total_scans % kmux as u64);
    }
}

fn mux_config() -> AcqConfig {
    let mut config = AcqConfig::default();
    config.mux_daq.enabled = true;
    config.mux_daq.sample_rate = 2000.0;
    config.mux_daq.mux_factor = 4;
    config.mux_daq.dual_device = true;
    config.mux_daq.dev1 = dev(2, 0, 1, 1);
    config.mux_daq.dev2 = dev(1, 0, 0, 1);
    config.mux_daq.start_line_enabled = true;
    config.timing.mux_latency_secs = 0.5;
    config.timing.join_poll_ms = 10;
    config.validate().unwrap();
    config
}

#[test]
fn acquirer_streams_demuxed_device_data() {
    let config = mux_config();
    let hw = Arc::new(SimMuxDaqHardware::new());
    let queue = mux_queue(&config.mux_daq, 5.0);
    let mut acq = MuxDaqAcquirer::new(&config, hw.clone(), queue.clone(), Arc::new(LogReporter)).unwrap();
    let layout = *acq.layout();

    acq.configure().unwrap();
    acq.run().unwrap();
    assert!(acq.is_running());
    sleep(Duration::from_millis(200));
    acq.stop();

    assert!(!hw.start_line());
    let calls = hw.calls();
    assert!(calls[0].starts_with("create_tasks(dev1"));
    assert!(calls[1].starts_with("create_tasks(dev2"));
    assert_eq!(
        &calls[2..5],
        &["start_tasks(dev2)", "start_tasks(dev1)", "set_start_line(true)"]
    );
    assert_eq!(
        &calls[calls.len() - 5..],
        &[
            "set_start_line(false)",
            "stop_tasks(dev1)",
            "clear_tasks(dev1)",
            "stop_tasks(dev2)",
            "clear_tasks(dev2)",
        ]
    );
    assert!(!hw.has_tasks(DeviceId::Dev1) && !hw.has_tasks(DeviceId::Dev2));

    let totals = queue.totals();
    assert!(totals.t_zero.is_some());
    // 200 ms at 2000 timepoints/s
    assert!(totals.data_frames >= 100, "{} frames", totals.data_frames);
    assert!(totals.data_frames <= 800, "{} frames", totals.data_frames);
    assert_eq!(acq.published_frames(), totals.data_frames);

    let mut w = 0u64;
    for entry in queue.snapshot() {
        let QueueEntry::Samples { first_frame, data } = entry else {
            panic!("unexpected gap in a mux DAQ stream");
        };
        assert_eq!(first_frame, w);
        for row in data.chunks_exact(layout.frame_width()) {
            assert_eq!(row, expected_frame(&layout, w).as_slice(), "timepoint {w}");
            w += 1;
        }
    }
    assert_eq!(w, totals.data_frames);
}

#[tokio::test]
async fn stalled_device_is_no_data_fatal() {
    let mut config = mux_config();
    config.timing.mux_empty_fetch_limit = 20;
    // Manual clock never advances: every fetch is empty
    let hw = Arc::new(SimMuxDaqHardware::manual());
    let queue = mux_queue(&config.mux_daq, 1.0);

    let mut ctl = RunController::new();
    ctl.add(MuxDaqAcquirer::new(&config, hw.clone(), queue.clone(), ctl.reporter()).unwrap());
    ctl.start().unwrap();

    let fatal = ctl.wait_for_fatal(Duration::from_secs(5)).await;
    assert_eq!(fatal.as_deref(), Some("Mux DAQ getting no samples."));
    ctl.stop();

    assert_eq!(queue.totals().data_frames, 0);
    assert!(!hw.start_line());
}

#[test]
fn task_fault_names_device() {
    let config = mux_config();
    let hw = Arc::new(SimMuxDaqHardware::manual());
    hw.fail_next(calls::CREATE_TASKS, -50_103, "resource reserved");
    let queue = mux_queue(&config.mux_daq, 1.0);
    let mut acq = MuxDaqAcquirer::new(&config, hw, queue, Arc::new(LogReporter)).unwrap();

    let err = acq.configure().unwrap_err();
    assert_eq!(
        err.to_string(),
        "DAQmxCreateTask(dev1) error code -50103 'resource reserved'"
    );
    assert!(acq.run().is_err());
}
