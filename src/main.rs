mod config;
mod dispatcher;
mod error;
mod executor;
mod protocol;
mod registry;
mod request;
mod rest;
mod security;
mod server;
mod session;
mod tools;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Args;
use executor::ProcessRunner;
use server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = args.server_settings();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(filter)
        .init();

    let loader = args.loader();
    let runner = ProcessRunner::new(settings.dry_run, settings.max_concurrent);
    let state = AppState::load(loader, runner)
        .await
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    let state = Arc::new(state);

    {
        let registry = state.registry.snapshot().await;
        info!(
            version = env!("CARGO_PKG_VERSION"),
            dry_run = settings.dry_run,
            max_concurrent = settings.max_concurrent,
            tools = registry.descriptors().len(),
            cli_tools = registry.catalog().names().len(),
            "starting ai-sre-mcp-server"
        );
    }

    if settings.stdio {
        return server::serve_stdio(state).await.context("stdio transport failed");
    }

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    server::serve(listener, state).await.context("server error")
}
