// Metrobus live vehicle API.
// Polls the upstream vehicle-location feed every 30 seconds, keeps the latest
// snapshot in memory, persists a 10 minute trail to SQLite and serves both
// over HTTP.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use clap::Parser;

mod cache;
mod config;
mod error;
mod handlers;
mod models;
mod normalize;
mod orchestrator;
mod store;
mod upstream;

use config::Config;
use handlers::AppState;
use orchestrator::RefreshOrchestrator;
use store::RetentionStore;
use upstream::MetrobusClient;

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: Config) -> std::io::Result<()> {
    log::info!("📂 Opening position store at {}", config.database_path.display());
    let store = RetentionStore::open(&config.database_path).map_err(std::io::Error::other)?;

    if let Some(seed_path) = &config.seed_path {
        match store.load_seed(seed_path) {
            Ok((routes, stops)) => {
                log::info!("✓ Loaded {routes} routes and {stops} stops from {}", seed_path.display());
            }
            Err(e) => log::warn!("⚠️  Could not load reference seed {}: {e}", seed_path.display()),
        }
    }

    let client = MetrobusClient::new(config.upstream_url.clone(), upstream::FETCH_TIMEOUT)
        .map_err(std::io::Error::other)?;

    let refresher = RefreshOrchestrator::new(
        Arc::new(client),
        config.shape_profiles(),
        Arc::new(store),
    );

    // First tick fires immediately, so this also performs the startup fetch.
    refresher.spawn_periodic_refresh();

    let app_state = AppState {
        orchestrator: refresher,
        display_tz: models::parse_display_tz(&config.display_tz),
    };

    log::info!("🌐 Server running on http://{}:{}", config.bind_addr, config.port);
    log::info!("📡 Upstream feed: {}", config.upstream_url);
    log::info!(
        "🔄 Auto-refresh every {}s, fetch timeout {}s",
        orchestrator::REFRESH_PERIOD.as_secs(),
        upstream::FETCH_TIMEOUT.as_secs()
    );

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(handlers::configure)
    })
    .bind((config.bind_addr.as_str(), config.port))?
    .run()
    .await
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();

    let config = Config::parse();
    log::info!(
        "🚀 {} v{} starting",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    actix_web::rt::System::new().block_on(run_server(config))
}
