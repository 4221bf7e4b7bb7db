// src/observability.rs
//! Side log channel
//!
//! The interposer lives inside somebody else's process, so its diagnostics must
//! never land on the application's stdout. Structured `tracing` lines go to
//! stderr by default, or to the file named by `SOCKVEIL_LOG_FILE`. Initialized
//! exactly once by the runtime singleton; a second init attempt is a no-op.

use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::utils::config::ShimConfig;

/// Install the global tracing subscriber for the side log channel.
///
/// Quiet by default: with no `SOCKVEIL_LOG` filter only warnings and errors are
/// emitted, so a host process that never touches the overlay sees nothing.
pub fn init_logging(config: &ShimConfig) {
    let filter = match &config.log_filter {
        Some(directive) => EnvFilter::try_new(directive)
            .unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::new("warn"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(false);

    let result = match &config.log_file {
        Some(path) => {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => builder
                    .with_writer(Mutex::new(file))
                    .try_init(),
                // Unwritable log file must not break the host process.
                Err(_) => builder.with_writer(io::stderr).try_init(),
            }
        }
        None => builder.with_writer(io::stderr).try_init(),
    };

    // Err means a subscriber is already installed (host process or a previous
    // init); either way the side channel is live.
    let _ = result;
}
