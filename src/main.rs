use anyhow::Result;
use axum::Router;
use doc_store::{
    config::AppConfig, db, routes::routes::routes, services::chunk_spool::ChunkSpool,
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting doc-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Chunks from a previous process can never complete ---
    let spool = ChunkSpool::new(&cfg.spool_dir);
    spool.purge().await?;
    tracing::info!("Chunk spool ready at {}", cfg.spool_dir);

    // --- Initialize services ---
    let state = AppState::new(db.clone(), &cfg.storage_dir, spool, cfg.limits.clone());

    // --- Expire abandoned chunked uploads ---
    let uploads = state.uploads.clone();
    let interval = cfg.sweep_interval;
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Upload expiry sweeper enabled"
        );
        loop {
            tokio::time::sleep(interval).await;
            let expired = uploads.sweep_expired().await;
            tracing::debug!(expired, active = uploads.active_sessions(), "Upload sweep finished");
        }
    });

    // --- Build router ---
    let app: Router = routes(&cfg.limits).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
