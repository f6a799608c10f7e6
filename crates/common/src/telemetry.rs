//! Tracing subscriber setup

use crate::config::ObservabilityConfig;
use crate::error::{Result, ShardChatError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Fails if a global subscriber
/// is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| ShardChatError::config(format!("Invalid log level {}: {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let installed = if config.structured_logging {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    installed.map_err(|e| ShardChatError::config(format!("Failed to install tracing subscriber: {}", e)))?;

    tracing::info!("Tracing initialized at level {}", config.log_level);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails() {
        let config = ObservabilityConfig::default();

        // the first call may already lose to another test
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
