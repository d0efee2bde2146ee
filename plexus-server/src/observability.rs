//! Tracing initialization

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize tracing for the server process
///
/// The filter comes from the `PLEXUS_LOG` environment variable when set,
/// falling back to `config.service.log_level`. Safe to call once per
/// process; later calls are ignored.
pub fn init_tracing(config: &Config) -> Result<()> {
    let filter = std::env::var("PLEXUS_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_new(&config.service.log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = Config::default();
        let _ = init_tracing(&config);
        // second call must not panic on the already-installed subscriber
        let _ = init_tracing(&config);
    }
}
