mod cache;
mod config;
mod error;
mod function;
mod model;
mod oidmap;
mod orchestrator;
mod rpc;
mod rpn;
mod scan;
mod tree;
mod value;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cache::HttpCacheClient;
use rpc::AppState;

/// Composite data worker — synthesizes higher-level measurements out of raw
/// cache samples per a composite-definitions XML document (spec.md §6).
#[derive(Parser)]
#[command(name = "composite-data-worker", about = "Composite data worker")]
struct Args {
    /// HTTP bind address for the inbound RPC surface.
    #[arg(long, env = "CDW_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: String,

    /// Path to the composite definitions XML document.
    #[arg(long, env = "CDW_COMPOSITES", default_value = "composites.xml")]
    composites: std::path::PathBuf,

    /// Base URL of the upstream cache service.
    #[arg(long, env = "CDW_CACHE_URL", default_value = "http://127.0.0.1:9000")]
    cache_url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "composite_data_worker=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Config load failure is a startup-time error, not a per-request one
    // (spec.md §3 "Lifecycles", SPEC_FULL.md §10.3).
    let registry = config::load_composites(&args.composites)?;
    info!(composites = registry.len(), path = %args.composites.display(), "loaded composite definitions");

    let state = Arc::new(AppState {
        registry,
        cache: Arc::new(HttpCacheClient::new(args.cache_url.clone())),
    });

    // Outer retry loop: on any unhandled failure during event-loop startup,
    // sleep 2s and reinitialize (spec.md §6 "Exit behavior").
    loop {
        let state = state.clone();
        let http_addr = args.http_addr.clone();
        let serve = tokio::spawn(async move { rpc::serve(state, &http_addr).await });

        tokio::select! {
            result = serve => {
                match result {
                    Ok(Ok(())) => break,
                    Ok(Err(e)) => error!(error = %e, "HTTP server exited with an error, reinitializing"),
                    Err(e) => error!(error = %e, "HTTP server task panicked, reinitializing"),
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received termination signal, shutting down");
                break;
            }
        }
    }

    Ok(())
}
