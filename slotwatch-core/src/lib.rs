//! Core types, slot matching, notification dispatch, and the polling engine
//! behind slotwatch.

/// One-shot registration code requests.
pub mod code;
/// Persisted contact file handling.
pub mod config;
/// Polling loop, per-run state, and backoff.
pub mod engine;
/// Domain models shared by probes, sinks, and the engine.
pub mod model;
/// Channel settings, dispatcher, and validation handshake.
pub mod notify;
/// Traits describing the appointment service and notification sinks.
pub mod ports;
/// Acceptance windows and slot matching.
pub mod window;

pub use code::*;
pub use config::*;
pub use engine::*;
pub use model::*;
pub use notify::*;
pub use ports::*;
pub use window::*;
