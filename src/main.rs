use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use redis_replicated::{Config, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::parse();
    let port = config.port;
    let server = Server::bind(config)
        .await
        .with_context(|| format!("server on port {port} failed to start"))?;
    server.run().await.context("server stopped")?;
    Ok(())
}
