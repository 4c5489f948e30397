use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use payflux_core::config::GatewayConfig;
use payflux_core::event::EventBus;
use payflux_engine::{ControlPlane, RecoveryManager};

use crate::routes;
use crate::state::AppState;

/// WebSocket + HTTP gateway server built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    control: Arc<ControlPlane>,
    recovery: Arc<RecoveryManager>,
    event_bus: Arc<EventBus>,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        control: Arc<ControlPlane>,
        recovery: Arc<RecoveryManager>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            control,
            recovery,
            event_bus,
        }
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let state = Arc::new(AppState {
            control: self.control.clone(),
            recovery: self.recovery.clone(),
            event_bus: self.event_bus.clone(),
        });

        let app = Self::router(state);

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "Gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Gateway shut down");
        Ok(())
    }

    fn router(state: Arc<AppState>) -> Router {
        Router::new()
            // WebSocket
            .route("/ws", get(routes::ws_handler))
            // REST API
            .route("/api/health", get(routes::health))
            .route("/api/flows", get(routes::list_flows))
            .route("/api/flows/{id}", get(routes::flow_detail))
            .route("/api/flows/{id}/timeline", get(routes::flow_timeline))
            .route("/api/statistics", get(routes::statistics))
            .route("/api/flows/{id}/pause", post(routes::pause_flow))
            .route("/api/flows/{id}/resume", post(routes::resume_flow))
            .route("/api/flows/{id}/cancel", post(routes::cancel_flow))
            .route("/api/flows/{id}/resolve", post(routes::resolve_flow))
            .route("/api/flows/{id}/retry", post(routes::retry_flow))
            .route("/api/flows/batch/{operation}", post(routes::batch))
            // Recovery
            .route("/api/recovery/crashed", post(routes::recover_crashed))
            .route(
                "/api/recovery/restore-runtime",
                post(routes::restore_runtime),
            )
            .layer(CorsLayer::permissive())
            .with_state(state)
    }
}
