use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod aggregate;
mod auth;
mod aws_clients;
mod config;
mod db;
mod domain;
mod errors;
mod feed;
mod handlers;
mod memory;
mod models;
mod repositories;
mod routes;
mod service;
mod startup;
mod storage;
mod validation;

use crate::config::Config;
use crate::domain::IdentityResolver;
use crate::errors::AppError;
use crate::service::MemeService;

/// AppState holds shared resources for the web server.
pub struct AppState {
    pub service: MemeService,
    pub identity: Arc<dyn IdentityResolver>,
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "meme_board=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!(backend = ?config.backend, flag_policy = ?config.flag_policy, "Configuration loaded");

    let state = startup::build_state(&config).await?;
    let app = routes::create_router(state, config.max_upload_bytes);

    tracing::info!("Server listening on http://{}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
