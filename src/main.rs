//! CLI Entry Point for probe_daq
//!
//! Runs a simulated acquisition session end to end:
//! - `run`: configure and start every enabled source, stream for the given
//!   time, print per-stream frame counts
//! - `check-config`: load, validate and print the effective configuration
//!
//! # Usage
//!
//! ```bash
//! probe_daq run --config config/probe_daq.toml --seconds 5
//! probe_daq run --source hardware-sim --json
//! probe_daq check-config
//! ```
//!
//! `generator` feeds the queues straight from the synthetic generators;
//! `hardware-sim` runs the real fetch/demux paths against simulated devices.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;
use probe_daq::acquisition::imec::probe_queues;
use probe_daq::acquisition::mux_daq::mux_queue;
use probe_daq::acquisition::{
    ImecAcquirer, ImecSimAcquirer, MuxDaqAcquirer, MuxDaqSimAcquirer, RunController,
};
use probe_daq::config::{AcqConfig, LogFormat, DEFAULT_CONFIG_PATH};
use probe_daq::data::stream_queue::{MemoryStreamQueue, StreamQueue};
use probe_daq::hardware::{SimMuxDaqHardware, SimProbeHardware};
use probe_daq::logging::{self, parse_log_level, LoggingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "probe_daq")]
#[command(about = "Multi-probe neural acquisition pipeline (simulated devices)", long_about = None)]
struct Cli {
    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire from every enabled source for a fixed time
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Seconds to acquire
        #[arg(long, default_value_t = 5.0)]
        seconds: f64,

        /// Where the data come from
        #[arg(long, value_enum, default_value_t = Source::Generator)]
        source: Source,
    },

    /// Validate and print the effective configuration
    CheckConfig {
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Source {
    /// Synthetic generators write frames directly
    Generator,
    /// Worker pool and demux engine over simulated hardware
    HardwareSim,
}

struct Streams {
    probes: Vec<Arc<MemoryStreamQueue>>,
    mux: Option<Arc<MemoryStreamQueue>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            ref config,
            seconds,
            source,
        } => {
            let config = load_config(config)?;
            init_logging(&cli, &config)?;
            run(config, seconds, source).await
        }
        Commands::CheckConfig { ref config } => {
            let config = load_config(config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: &PathBuf) -> Result<AcqConfig> {
    let config = AcqConfig::load_from(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_logging(cli: &Cli, config: &AcqConfig) -> Result<()> {
    let mut logging = LoggingConfig::from_config(config)?;
    if let Some(level) = &cli.log_level {
        logging.level = parse_log_level(level)?;
    }
    if cli.json {
        logging = logging.with_format(LogFormat::Json);
    }
    logging::init(logging)?;
    Ok(())
}

fn build(config: &AcqConfig, seconds: f64, source: Source, ctl: &mut RunController) -> Result<Streams> {
    // Queues hold the whole session so the counts can be read afterwards
    let hold = seconds + 1.0;
    let mut streams = Streams {
        probes: Vec::new(),
        mux: None,
    };

    if config.imec.enabled {
        let queues = probe_queues(&config.imec, hold);
        let dyn_queues: Vec<Arc<dyn StreamQueue>> =
            queues.iter().map(|q| q.clone() as Arc<dyn StreamQueue>).collect();
        match source {
            Source::Generator => ctl.add(ImecSimAcquirer::new(config, dyn_queues, ctl.reporter())?),
            Source::HardwareSim => {
                let hw = Arc::new(SimProbeHardware::from_config(&config.imec));
                ctl.add(ImecAcquirer::new(config, hw, dyn_queues, ctl.reporter())?);
            }
        }
        streams.probes = queues;
    }

    if config.mux_daq.enabled {
        let queue = mux_queue(&config.mux_daq, hold);
        match source {
            Source::Generator => ctl.add(MuxDaqSimAcquirer::new(config, queue.clone(), ctl.reporter())?),
            Source::HardwareSim => {
                let hw = Arc::new(SimMuxDaqHardware::new());
                ctl.add(MuxDaqAcquirer::new(config, hw, queue.clone(), ctl.reporter())?);
            }
        }
        streams.mux = Some(queue);
    }

    Ok(streams)
}

async fn run(config: AcqConfig, seconds: f64, source: Source) -> Result<()> {
    if !config.imec.enabled && !config.mux_daq.enabled {
        bail!("no acquisition source is enabled in the configuration");
    }

    let mut ctl = RunController::new();
    let streams = build(&config, seconds, source, &mut ctl)?;
    ctl.start()?;

    let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
    let report_every = config.timing.stats_interval().min(Duration::from_secs(1));
    let mut fatal = None;

    while Instant::now() < deadline {
        let wait = report_every.min(deadline.saturating_duration_since(Instant::now()));
        tokio::select! {
            msg = ctl.wait_for_fatal(wait) => {
                if msg.is_some() {
                    fatal = msg;
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
        for status in ctl.fifo_status() {
            tracing::debug!(stream = %status.stream, fill_pct = status.percent, "Buffer fill");
        }
    }
    ctl.stop();

    for q in streams.probes.iter().chain(&streams.mux) {
        let totals = q.totals();
        println!(
            "{:<14} {:>10} frames ({} zero-filled, {} gaps)",
            q.name(),
            totals.total_frames(),
            totals.zero_frames,
            totals.gaps
        );
    }

    if let Some(msg) = fatal {
        bail!("run aborted: {msg}");
    }
    Ok(())
}
