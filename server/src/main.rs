use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use voucher_server::config::Config;
use voucher_server::mail::create_mail_client;
use voucher_server::rate_limit::{CounterStore, MemoryCounterStore, RedisCounterStore};
use voucher_server::routes::create_routes;
use voucher_server::state::AppState;
use voucher_server::store::{PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env();

    let pg = PgStore::connect(&config.database_url, 5).await?;
    tracing::info!("Successfully connected to database");

    pg.migrate().await?;

    let counters: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => match RedisCounterStore::connect(url).await {
            Ok(redis) => {
                tracing::info!("Rate limiting backed by redis");
                Arc::new(redis)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Redis unavailable, rate limiting in memory");
                Arc::new(MemoryCounterStore::new())
            }
        },
        None => Arc::new(MemoryCounterStore::new()),
    };

    let mail = create_mail_client(&config)?;
    let store: Arc<dyn Store> = Arc::new(pg);
    let port = config.port;
    let state = AppState::new(config, store, mail, counters)?;

    let app = create_routes(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("🚀 Server running at http://{}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down");
}
