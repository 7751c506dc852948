use anyhow::{Context, Result};
use db_pool::{create_pool, DbConfig};
use stats_service::handler::AggregationHandler;
use stats_service::kafka::{
    ConsumerGroupRunner, GroupClientSettings, KafkaGroupClient, TokioClock,
};
use stats_service::rate_limit::RateLimiter;
use stats_service::repository::PgStatsRepository;
use stats_service::Config;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    stats_service::init_tracing();

    tracing::info!("Starting stats-consumer");

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_config = DbConfig::for_service("stats-consumer", config.database_url.clone());
    db_config.log_config();
    let pool = create_pool(db_config)
        .await
        .context("Failed to create database pool")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PgStatsRepository::new(pool, config.upsert_mode()));
    let handler = Arc::new(AggregationHandler::new(store));

    let client = KafkaGroupClient::connect(GroupClientSettings::from(&config))
        .await
        .context("Failed to connect Kafka consumer group")?;

    let limiter = RateLimiter::per_second(config.rate_limit_per_sec)
        .context("Invalid handler rate limit")?;
    tracing::info!(per_second = limiter.per_second_limit(), "Handler rate limit configured");

    let runner = ConsumerGroupRunner::new(
        Arc::new(client),
        handler,
        Arc::new(limiter),
        config.runner_settings(),
        Arc::new(TokioClock),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let report = runner.run(shutdown).await;
    if report.drained {
        tracing::info!("stats-consumer stopped cleanly");
    } else {
        tracing::warn!(
            abandoned = report.abandoned,
            "stats-consumer stopped with abandoned partition work"
        );
    }

    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
