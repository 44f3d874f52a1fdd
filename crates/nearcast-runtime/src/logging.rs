//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

use nearcast_core::{NearcastError, NearcastResult};

use crate::config::{LogConfig, LogFormat};

/// Install a global fmt subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. If a subscriber is
/// already installed it is kept.
pub fn init_logging(config: &LogConfig) -> NearcastResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| NearcastError::InvalidConfig(format!("log filter: {}", e)))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = installed {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
    Ok(())
}
