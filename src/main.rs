//! SaleStream - sale event ingestion and analytics service
//!
//! Accepts sale events over HTTP, buffers them into a durable segment log and
//! serves cached aggregate analytics over everything committed.

use std::sync::Arc;

use salestream::{config::Config, logging, Pipeline, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;
    config.validate()?;

    logging::init_tracing(&config.server.log_level, &config.server.environment)?;
    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting SaleStream");

    let pipeline = Arc::new(Pipeline::open(Arc::new(config)).await?);
    salestream::create_server(pipeline).await?;

    tracing::info!("SaleStream shutdown complete");
    Ok(())
}
