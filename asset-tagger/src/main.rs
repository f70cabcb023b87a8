use asset_tagger::api::{ApiServer, ApiServerConfig};
use asset_tagger::config::ProcessConfig;
use asset_tagger::services::ServiceContainer;
use asset_tagger::utils::http_client::install_rustls_provider;
use asset_tagger::{database, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    install_rustls_provider();

    let config = ProcessConfig::from_env()?;
    let logging_config = logging::init_logging(&config.log_dir)?;

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let container = ServiceContainer::new(pool, &config).await?;
    logging_config
        .apply_persisted_filter(&container.settings)
        .await;
    logging_config.start_retention_cleanup(container.cancellation_token());
    container.initialize().await?;

    let server = ApiServer::new(
        ApiServerConfig::from_env_or_default(),
        container.app_state(Some(logging_config.clone())),
        container.cancellation_token().child_token(),
    );
    let server_token = server.cancel_token();
    let server_task = tokio::spawn(async move { server.run().await });

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "asset-tagger started");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        }
        _ = server_token.cancelled() => {}
    }

    server_token.cancel();
    match server_task.await {
        Ok(Err(e)) => tracing::error!(error = %e, "API server exited with error"),
        Err(e) => tracing::error!(error = %e, "API server task panicked"),
        Ok(Ok(())) => {}
    }
    container.shutdown().await?;
    Ok(())
}
