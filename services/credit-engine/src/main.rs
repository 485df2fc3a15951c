use actix_web::{middleware, web, App, HttpServer};
use anyhow::{anyhow, Context};
use credit_engine::{
    cache::RedisCache,
    config::Config,
    handlers,
    ledger::PgLedger,
    BalanceCoordinator,
};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

    info!("Starting Credit Engine on port {}", config.server.port);

    let ledger = PgLedger::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.min_connections,
    )
    .await
    .context("Failed to connect to ledger database")?;
    ledger.migrate().await.context("Failed to migrate ledger schema")?;

    let cache = RedisCache::connect(&config.redis.url)
        .await
        .context("Failed to connect to Redis")?;

    let (coordinator, background) =
        BalanceCoordinator::spawn(Arc::new(ledger), Arc::new(cache), &config.credit);

    let coordinator = web::Data::new(coordinator);

    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(coordinator.clone())
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run()
    .await?;

    info!("HTTP server stopped, draining background tasks");
    background.shutdown().await;

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false);

    if std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}
