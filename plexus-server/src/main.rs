//! Server process entry point
//!
//! Directories come from the environment: `PLEXUS_BASE` points at the
//! installation (read-only plug-ins), `PLEXUS_LOCAL` at the writable data
//! directory. An optional `PLEXUS_PROPERTIES` file preloads key=value
//! configuration pairs.

use std::path::PathBuf;

use plexus_server::prelude::*;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("PLEXUS_PROPERTIES") {
        Ok(file) => Config::load_with_properties(PathBuf::from(file).as_path())?,
        Err(_) => Config::load()?,
    };
    init_tracing(&config)?;

    let base_dir = std::env::var("PLEXUS_BASE").unwrap_or_else(|_| ".".to_string());
    let local_dir = std::env::var("PLEXUS_LOCAL").unwrap_or_else(|_| "./data".to_string());

    let context = AppContext::init(config, base_dir, local_dir, true).await?;
    Server::new(context).serve().await?;
    Ok(())
}
