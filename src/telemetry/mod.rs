//! Telemetry for admission decisions.
//!
//! The engine emits a [`LimiterEvent`] per decision (and per contended or failed store
//! update) into a [`TelemetrySink`]. Sinks are `tower::Service<LimiterEvent>`s, so they
//! compose with ordinary tower combinators. Emission is best-effort and never affects the
//! decision returned to the caller.

pub mod events;
pub mod sinks;

pub use events::LimiterEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
