//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize tracing for the servient process.
///
/// There is no ambient singleton: the caller builds the configuration once
/// and passes it in. Calling this twice returns an error from the
/// subscriber registry, which is surfaced as a no-op.
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.servient.log_level.clone();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("Tracing already initialized; keeping existing subscriber");
        return Ok(());
    }

    tracing::info!("Tracing initialized for servient: {}", config.servient.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_reentrant() {
        let config = Config::default();
        init_tracing(&config).unwrap();
        // A second call must not panic or fail
        init_tracing(&config).unwrap();
    }
}
