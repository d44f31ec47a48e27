//! # CQS Telemetry
//!
//! Installs the global `tracing` subscriber for applications built on the
//! CQS buses. The bus crates only emit events and spans; which of them are
//! printed, and how, is decided here.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cqs_telemetry::{init_logging, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&TelemetryConfig::from_env())?;
//!     // ...
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `cqs` | Service name attached to the root span |
//! | `CQS_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter directives |
//! | `CQS_JSON_LOGS` | `false` (`true` in containers) | One JSON object per line |
//! | `CQS_CONSOLE_OUTPUT` | `true` | Write logs to stdout at all |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::{init_logging, service_span};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to install the global subscriber: {0}")]
    SubscriberInit(String),
}
