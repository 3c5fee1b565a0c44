use std::sync::Arc;

use campo_api::{app_router, AppConfig, AppState, ServerStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Only load .env in development; production uses platform-native env injection.
    #[cfg(debug_assertions)]
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("campo_api=info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(AppConfig::from_env()?);
    tracing::info!("Starting campo-api with config: {:?}", config);

    let store = ServerStore::open(&config.db_path)?;
    let state = AppState::new(config.clone(), store);
    let router = app_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("campo-api listening on {}", config.bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}
