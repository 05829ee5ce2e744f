//! HTTP surface: one callback endpoint per configured account plus a health
//! probe.

mod wechat;

use crate::config::GatewayConfig;
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

async fn handle_health() -> &'static str {
    "ok"
}

pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/{account}",
            get(wechat::handle_verify).post(wechat::handle_message),
        )
        .route(
            "/{account}/",
            get(wechat::handle_verify).post(wechat::handle_message),
        )
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .with_state(state)
}

pub async fn run_gateway<F>(config: &GatewayConfig, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local = listener.local_addr()?;

    let accounts: Vec<String> = state
        .pipeline
        .accounts()
        .map(|account| account.name.clone())
        .collect();
    tracing::info!(%local, ?accounts, "gateway listening");

    axum::serve(listener, router(state, config))
        .with_graceful_shutdown(shutdown)
        .await
        .context("gateway server failed")?;
    tracing::info!("gateway stopped");
    Ok(())
}
