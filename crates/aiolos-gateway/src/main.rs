//! aiolos-gateway: CoAP-to-HTTP telemetry gateway for Aiolos weather stations.

mod admin;
mod coap;
mod config;
mod endpoints;
mod exchanges;
mod pipeline;
mod proxy;
mod routing;
mod server;
mod stats;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use config::GatewayConfig;
use pipeline::RequestPipeline;
use proxy::HttpForwarder;
use server::CoapServer;
use stats::GatewayStats;

fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| {
        args.iter()
            .position(|a| a == name)
            .and_then(|i| args.get(i + 1).cloned())
    };

    let config_path = flag("--config")
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("AIOLOS_GATEWAY_CONFIG").ok())
        .unwrap_or_else(|| "aiolos-gateway.toml".to_string());

    // Load configuration
    let mut config = GatewayConfig::load(&config_path)?;

    // Apply CLI overrides (take precedence over TOML and env vars)
    if let Some(url) = flag("--backend-url") {
        config.backend.base_url = Some(url);
    }
    if let Some(listen) = flag("--listen") {
        config.server.listen_address = listen;
    }
    if let Some(port) = flag("--port") {
        config.set_port(port.parse()?)?;
    }
    config.validate()?;

    // The tonic exporter needs a reactor, so the runtime comes before tracing
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let tracing_guard = aiolos_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            admin_address = ?config.server.admin_address,
            backend_url = ?config.backend.base_url,
            otlp_export = tracing_guard.is_exporting(),
            "Starting aiolos-gateway"
        );

        run(config).await
    })
}

async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let registry = endpoints::build_registry()?;
    if registry.is_empty() {
        anyhow::bail!("no endpoints registered");
    }
    for route in registry.routes() {
        tracing::debug!(
            route = %route.template(),
            target = %route.target(),
            params = ?route.param_names(),
            "Registered route"
        );
    }

    let forwarder = HttpForwarder::new(
        config.backend_url()?,
        Duration::from_secs(config.backend.timeout_secs),
    )?;
    let stats = Arc::new(GatewayStats::new());
    let pipeline = Arc::new(RequestPipeline::new(registry, forwarder, stats.clone()));

    let server = CoapServer::bind(&config.server, pipeline).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let admin = match &config.server.admin_address {
        Some(address) => {
            let listener = tokio::net::TcpListener::bind(address).await?;
            tracing::info!(address = %listener.local_addr()?, "Admin endpoint listening");
            let stopped = wait_for(shutdown_rx.clone());
            Some(tokio::spawn(admin::serve(listener, stats, stopped)))
        }
        None => None,
    };

    server.run(wait_for(shutdown_rx)).await?;

    if let Some(admin) = admin {
        admin.await??;
    }
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait for SIGINT (Ctrl+C) for graceful shutdown.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining requests...");
}
