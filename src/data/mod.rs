//! Stream queues and signal processing.
pub mod biquad;
pub mod stream_queue;

pub use biquad::{Biquad, BiquadType};
pub use stream_queue::{MemoryStreamQueue, QueueEntry, QueueTotals, StreamQueue};
