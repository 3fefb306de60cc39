//! Hardware boundary.
//!
//! Vendor calls sit behind the traits in [`capabilities`]; every call
//! returns a `HardwareFault` carrying the vendor code and text. The
//! [`mock`] module implements both device classes in software.

pub mod capabilities;
pub mod mock;
pub mod packet;

pub use capabilities::{
    DeviceId, FifoState, MuxDaqHardware, ProbeHardware, ReadRequest, SyncMode, TaskPlan,
};
pub use mock::{SimMuxDaqHardware, SimProbeHardware};
