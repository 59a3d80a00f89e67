//! Process plumbing for the proxy binary.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`sig_down`] | SIGINT/SIGTERM handling for graceful shutdown |
//! | [`telemetry`] | Log subscriber, plus OTLP span export with the `telemetry` feature |

pub mod sig_down;
pub mod telemetry;

pub use sig_down::*;
pub use telemetry::*;
