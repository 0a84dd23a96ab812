//! Dispatch telemetry.
//!
//! The dispatcher emits a structured [`DispatchEvent`] at every decision
//! point: filter rejection, admission denial, drop, attempt, delivery,
//! and terminal failure. Events flow to a [`TelemetrySink`]; sinks must
//! not block.

mod events;
mod sinks;

pub use events::{DispatchEvent, DropReason, FailureKind};
pub use sinks::{BufferSink, NullSink, TelemetrySink, TracingSink};
