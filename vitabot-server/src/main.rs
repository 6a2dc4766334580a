use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vitabot_server::{
    Config, GitHubClient, InstallationRepositories, Orchestrator, Scheduler, SchedulerConfig,
    StaticConfigSource, SERVICE_NAME,
};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting vita-bot");

    let config = Config::from_env().context("Failed to load configuration from environment variables")?;

    let projects = StaticConfigSource::from_file(&config.projects_file)?;
    info!(
        "Loaded configuration for {} repositories from {}",
        projects.len(),
        config.projects_file.display()
    );

    let github = Arc::new(GitHubClient::new(
        config.github_app_id,
        config.github_private_key.clone(),
    )?);

    let orchestrator = Orchestrator::new(
        github.clone(),
        Arc::new(projects),
        config.bot.clone(),
        &config.working_copy_root,
    )
    .with_git_timeout(config.git_timeout);

    let scheduler = Scheduler::new(
        SchedulerConfig::new(
            config.check_interval,
            config.requests_per_interval,
            config.rate_interval,
        ),
        Arc::new(InstallationRepositories::new(github)),
        Arc::new(orchestrator),
    );

    if config.check_interval.is_zero() {
        scheduler.tick().await;
        info!("Single check finished");
        return Ok(());
    }

    scheduler.start()?;

    let app = Router::new()
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    scheduler.stop();
    Ok(())
}
