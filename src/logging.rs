//! Logging setup
//!
//! Everything logs through `tracing`; the binary installs one global
//! subscriber writing to stderr. `RUST_LOG` takes precedence over the
//! level given on the command line.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::domain::error::DispatchError;

/// `RUST_LOG` if set, else `default`
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(default_level: &str) -> Result<(), DispatchError> {
    tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| DispatchError::Configuration(format!("failed to install logger: {}", e)))
}
