pub mod adapter;
pub mod backend;
pub mod config;
pub mod error;
pub mod escape;
pub mod frame;
pub mod models;
pub mod server;
pub mod state;
pub mod substitute;
pub mod telemetry;
pub mod templating;
pub mod variable;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the datasource service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config)?.run().await
}
