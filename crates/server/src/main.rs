use std::sync::Arc;

use anyhow::Context;

use jobweave_infra::storage::InMemoryStorageProvider;
use jobweave_infra::{BackgroundJobServer, BackgroundJobServerConfig, JobScheduler};
use jobweave_server::demo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobweave_observability::init();

    let config = BackgroundJobServerConfig::from_env()
        .context("invalid JOBWEAVE_* configuration")?;
    let store = Arc::new(InMemoryStorageProvider::new());

    demo::seed(&JobScheduler::new(store.clone())).await?;

    let server = BackgroundJobServer::builder(store)
        .config(config)
        .registry(demo::registry())
        .build()?;
    server.start()?;
    tracing::info!(
        server_id = %server.server_id(),
        name = %server.config().name,
        "jobweave server running; Ctrl-C to stop"
    );

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for Ctrl-C")?;
            tracing::info!("shutdown requested");
        }
        _ = server.stopped() => {}
    }

    server.stop().await?;
    tracing::info!(stats = ?server.worker_stats(), "bye");
    Ok(())
}
