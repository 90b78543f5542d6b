//! Test doubles for pipelines.
//!
//! - [`ScriptedProcessor`] returns a fixed sequence of results.
//! - [`RecordingProcessor`] succeeds and records every attempt it sees.
//! - [`TestHarness`] wires an in-memory store, orchestrator and scheduler
//!   with millisecond backoff.

mod harness;
mod processors;

pub use harness::TestHarness;
pub use processors::{RecordingProcessor, ScriptedProcessor};
