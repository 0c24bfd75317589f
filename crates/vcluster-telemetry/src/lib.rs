//! Tracing subscribers for the virtual cluster components.
//!
//! To get started, see [`Tracing`].
pub mod tracing;

pub use tracing::{TelemetryOptions, Tracing};
