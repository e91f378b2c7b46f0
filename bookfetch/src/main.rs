use bookfetch::config::AppConfig;
use bookfetch::database;
use bookfetch::database::repositories::SqlxSettingsRepository;
use bookfetch::logging;
use bookfetch::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;

    // Keep the guard alive so buffered file output is flushed on exit
    let (logging_config, _log_guard) = logging::init_logging(&config.log_dir)?;

    // Initialize database
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    logging_config
        .apply_persisted_filter(&SqlxSettingsRepository::new(pool.clone()))
        .await;

    let container = ServiceContainer::new(pool, &config);
    container.initialize().await?;
    logging_config.start_retention_cleanup(container.cancellation_token());

    tracing::info!("bookfetch started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    container.shutdown().await?;
    Ok(())
}
