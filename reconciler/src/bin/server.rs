//! Reconciler HTTP Server
//!
//! Serves the reconciliation API on top of a local deposit ledger.

use anyhow::Context;
use deposit_ledger::Ledger;
use reconciler::{api, Config, Erc20BalanceOracle, ReconciliationService};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("RECONCILER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config
        }
        Err(_) => Config::from_env()?,
    };

    reconciler::init_tracing(config.log_json);
    info!("Starting deposit reconciler");

    info!(data_dir = ?config.ledger.data_dir, "Opening ledger");
    let ledger = Arc::new(Ledger::open(config.ledger.clone()).await?);

    let oracle = Arc::new(Erc20BalanceOracle::new(&config.oracle)?);
    info!(
        rpc_url = %config.oracle.rpc_url,
        fallbacks = config.oracle.fallback_urls.len(),
        token = %config.oracle.token_address,
        policy = ?config.oracle.failure_policy,
        "Balance oracle configured"
    );

    let service = Arc::new(ReconciliationService::new(
        ledger.clone(),
        oracle,
        config.oracle.failure_policy,
    )?);
    let app = api::router(service);

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Reconciler listening on {}", addr);
    info!("   POST /api/reconcile - Reconcile deposits with the on-chain balance");
    info!("   GET  /api/deposits/:owner - List deposits");
    info!("   GET  /health - Health check");
    info!("   GET  /metrics - Prometheus metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // The router (and its service) is gone, so this is the last ledger handle
    match Arc::try_unwrap(ledger) {
        Ok(ledger) => ledger.shutdown().await?,
        Err(_) => tracing::warn!("Ledger still shared at shutdown, skipping actor stop"),
    }

    info!("Reconciler stopped");
    Ok(())
}
