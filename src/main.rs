use visimatch::{create_router, init, AppState, Catalog, Config, Result};

use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the application
    init()?;

    let config = Config::from_env()?;
    let catalog = Catalog::load(&config.catalog_path)?;

    // Initialize application state
    let state = AppState::new(config, catalog)?;
    let sweeper = state.cache().spawn_sweeper(state.config.cache.sweep_interval);

    // Load the model in the background so the first search doesn't pay for it
    let warm = Arc::clone(&state);
    tokio::spawn(async move {
        if let Err(e) = warm.orchestrator.provider().warm_up().await {
            log::warn!("Model not ready, searches will retry loading it: {}", e);
        }
    });

    // Data URIs inflate images by a third; leave headroom for the JSON around them
    let app = create_router(state.config.max_image_bytes * 2).with_state(Arc::clone(&state));

    // Set up the server
    let addr = state.config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    sweeper.abort();
    log::info!("Server stopped");
    Ok(())
}
