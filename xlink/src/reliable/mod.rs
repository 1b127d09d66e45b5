//! Reliability on top of unreliable delivery.
//!
//! - FrameReassembler: validated chunks → complete frames
//! - FrameSlot: latest-frame cell for preview consumers
//! - Backoff: exponential delay with jitter
//! - Supervisor: bounded retry of long-running operations

mod backoff;
mod reassembler;
mod slot;
pub mod supervisor;

pub use backoff::Backoff;
pub use reassembler::{
    Assembly, AssemblyStats, Frame, FrameDetector, FrameReassembler, JpegTrailer,
};
pub use slot::FrameSlot;
pub use supervisor::{
    Escalation, Pause, Progress, RetryPolicy, RetryState, Supervisor, SupervisorConfig, TokioPause,
};
