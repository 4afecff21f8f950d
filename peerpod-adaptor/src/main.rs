use anyhow::{bail, Context, Result};
use clap::Parser;
use peerpod_adaptor::{router, shutdown_signal, AppState, Cli};
use peerpod_providers::ProviderRegistry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let registry = ProviderRegistry::global();
    if cli.list_providers {
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }
    if cli.provider.is_empty() {
        bail!(
            "--provider (or CLOUD_PROVIDER) is required, one of: {}",
            registry.names().join(", ")
        );
    }

    let shutdown = CancellationToken::new();
    let provider = registry
        .create(&shutdown, &cli.provider, &cli.provider_args)
        .await
        .with_context(|| format!("starting provider {}", cli.provider))?;

    let app = router(AppState {
        provider: provider.clone(),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!("peerpod adaptor ({}) listening on {}", provider.name(), cli.listen);

    let signalled = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signalled.cancel();
        })
        .await;

    shutdown.cancel();
    if let Err(e) = provider.teardown().await {
        error!("teardown of {} failed: {:#}", provider.name(), e);
    }
    info!("peerpod adaptor stopped");
    served.context("serving HTTP")
}
