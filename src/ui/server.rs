//! Axum server exposing the controller over HTTP

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::lifecycle::ControllerHandle;
use crate::ui::handlers;

/// Shared state of the HTTP handlers
pub struct AppState {
    pub controller: ControllerHandle,
}

/// Control surface for one controller
pub struct WebServer {
    config: UiConfig,
    pub(crate) state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, controller: ControllerHandle) -> Self {
        Self {
            config,
            state: Arc::new(AppState { controller }),
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let api_routes = Router::new()
            .route("/status", get(handlers::get_status))
            .route("/start", post(handlers::start_stream))
            .route("/stop", post(handlers::stop_stream))
            .with_state(self.state.clone());

        Router::new().nest("/api", api_routes).layer(cors)
    }

    /// Bind and serve until the task is aborted
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.http_port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Control API listening on http://{}", addr);
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Serve on a background task, logging any failure
    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Control API stopped: {}", e);
            }
        })
    }
}
