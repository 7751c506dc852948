use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use db_pool::{create_pool, DbConfig};
use stats_service::http::{configure, AppState};
use stats_service::ingest::IngestService;
use stats_service::kafka::{KafkaStatPublisher, PublisherSettings};
use stats_service::repository::PgStatsRepository;
use stats_service::services::StatsQuery;
use stats_service::Config;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    stats_service::init_tracing();

    tracing::info!("Starting stats-api");

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_config = DbConfig::for_service("stats-api", config.database_url.clone());
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations completed successfully");

    let publisher = KafkaStatPublisher::connect(PublisherSettings::from(&config))
        .await
        .context("Failed to connect Kafka producer")?;

    let store = Arc::new(PgStatsRepository::new(pool, config.upsert_mode()));
    let state = web::Data::new(AppState {
        query: StatsQuery::new(store),
        ingest: IngestService::new(Arc::new(publisher)),
    });

    tracing::info!("Starting HTTP server on {}", config.http_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .configure(configure)
    })
    .bind(config.http_addr.as_str())
    .context("Failed to bind HTTP server")?
    .run()
    .await
    .context("HTTP server error")
}
