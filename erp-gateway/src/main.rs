//! ERP Gateway - Main entry point.

use anyhow::{Context, Result};
use erp_common::config::Config;
use erp_common::logging::init_logging;
use erp_common::Validate;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env().context("failed to load gateway configuration")?;

    // Initialize logging
    init_logging(&config.observability.log_level, &config.observability.log_format);

    tracing::info!("ERP Gateway v{}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration must never serve traffic
    config
        .validate()
        .context("gateway configuration is invalid")?;

    // Start the gateway server
    erp_gateway::start_server(&config).await
}
