//! # Probe DAQ Core Library
//!
//! Real-time acquisition for multi-probe neural recording rigs. The library
//! drives two device classes, packetized probe front ends and a clocked
//! multiplexed DAQ, and turns their raw output into fixed-width frames on
//! per-stream queues.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: The fetch → scale → enqueue worker pool, the shared
//!   run state with its startup barrier and pause protocol, the demux/merge
//!   engine, the synthetic generators and the `RunController`.
//! - **`config`**: `AcqConfig`, loaded from TOML plus `PROBE_DAQ_`
//!   environment overrides and validated before a run.
//! - **`data`**: The `StreamQueue` producer contract and the streaming
//!   biquad filter.
//! - **`error`**: The `AcqError` taxonomy and the fatal-error reporting seam.
//! - **`hardware`**: Boundary traits for both device classes, the electrode
//!   packet view and simulated hardware.
//! - **`logging`**: tracing-subscriber initialisation.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
