use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inflow_observability::init();

    let config = inflow_api::config::Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    let services = Arc::new(inflow_api::app::services::build_services(&config, pool)?);
    let workers = inflow_api::app::services::spawn_workers(&config, &services);

    let app = inflow_api::app::build_app(services);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    for worker in workers {
        worker.shutdown().await;
    }
    Ok(())
}
