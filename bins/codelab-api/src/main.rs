mod handlers;
mod metrics;
mod routes;

use axum::Router;
use codelab_common::config::SandboxConfig;
use codelab_common::store::{MemoryStore, ProgressStore, RedisStore};
use codelab_sandbox::{worker, Harness, WorkerCommand};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub harness: Harness,
    pub store: Arc<dyn ProgressStore>,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match std::env::var("CODELAB_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().init(),
        _ => builder.init(),
    }
}

fn open_store() -> anyhow::Result<Arc<dyn ProgressStore>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let store = RedisStore::open(&url)?;
            info!("Progress store: Redis at {}", url);
            Ok(Arc::new(store))
        }
        Err(_) => {
            warn!("REDIS_URL not set; progress is kept in memory and lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    warn!("Received shutdown signal, finishing in-flight requests...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Realm worker children exit here, before logging can touch stdout
    worker::run_if_requested();

    init_tracing();

    info!("Codelab API booting...");

    let config = SandboxConfig::load_default().map_err(|e| {
        error!("Failed to load sandbox configuration: {:#}", e);
        e
    })?;
    info!(
        default_timeout_ms = config.default_timeout_ms,
        max_concurrent_executions = config.max_concurrent_executions,
        "Sandbox configured"
    );

    metrics::init()?;

    let state = Arc::new(AppState {
        harness: Harness::new(config).with_worker(WorkerCommand::current_exe()?),
        store: open_store()?,
    });
    info!("Snippets run in realm worker processes");

    // Build router
    let app = Router::new()
        .merge(routes::routes())
        .with_state(state);

    // Start server
    let addr = std::env::var("CODELAB_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Codelab API shut down");
    Ok(())
}
