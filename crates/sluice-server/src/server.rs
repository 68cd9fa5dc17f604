//! `SluiceServer`: axum router, listener, and shutdown wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use sluice_settings::TransportMode;
use sluice_transport::{ConnectionFactory, StatefulManager, StatelessManager};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::binding::{self, Transport};
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// The manager wired behind the endpoint.
    pub transport: Arc<Transport>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle, if a recorder was installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The sluice HTTP server.
pub struct SluiceServer {
    config: ServerConfig,
    transport: Arc<Transport>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics: Option<PrometheusHandle>,
    start_time: Instant,
}

impl SluiceServer {
    /// Create a server whose manager draws connections from `factory`.
    ///
    /// Must be called inside a Tokio runtime: stateful mode starts its
    /// stale-session sweep immediately.
    pub fn new(config: ServerConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let transport = match config.mode {
            TransportMode::Stateful => Transport::Stateful(Arc::new(StatefulManager::new(
                factory,
                config.sessions.clone(),
            ))),
            TransportMode::Stateless => Transport::Stateless(Arc::new(
                StatelessManager::with_endpoint_path(factory, config.endpoint_path.clone()),
            )),
        };
        Self {
            config,
            transport: Arc::new(transport),
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics: None,
            start_time: Instant::now(),
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            transport: self.transport.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(
                &self.config.endpoint_path,
                post(binding::handle_post)
                    .get(binding::handle_get)
                    .delete(binding::handle_delete),
            )
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the listener and serve until the shutdown token fires.
    ///
    /// On shutdown the wired manager is shut down before the listener
    /// drains, so open event streams end and connections can close.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        info!(
            %addr,
            mode = %self.transport.mode(),
            endpoint = %self.config.endpoint_path,
            "sluice listening"
        );

        let app = self.router();
        let token = self.shutdown.token();
        let transport = self.transport.clone();
        let handle = tokio::spawn(async move {
            let signal = async move {
                token.cancelled().await;
                info!("shutdown requested, releasing transport");
                transport.shutdown().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                error!(error = %e, "server error");
            }
            info!("listener stopped");
        });
        Ok((addr, handle))
    }

    /// The wired manager.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let transport = &state.transport;
    Json(health::health_check(
        state.start_time,
        &transport.mode().to_string(),
        transport.active_sessions(),
        transport.inflight(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoFactory;
    use axum::body::Body;
    use axum::http::Request;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    fn make_server(mode: TransportMode) -> SluiceServer {
        let config = ServerConfig {
            port: 0,
            mode,
            ..ServerConfig::default()
        };
        SluiceServer::new(config, Arc::new(EchoFactory))
    }

    #[tokio::test]
    async fn mode_follows_config() {
        assert_eq!(
            make_server(TransportMode::Stateful).transport().mode(),
            TransportMode::Stateful
        );
        assert_eq!(
            make_server(TransportMode::Stateless).transport().mode(),
            TransportMode::Stateless
        );
    }

    #[tokio::test]
    async fn shutdown_coordinator_accessible() {
        let server = make_server(TransportMode::Stateful);
        assert!(!server.shutdown().is_shutting_down());
        server.shutdown().shutdown();
        assert!(server.shutdown().is_shutting_down());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let app = make_server(TransportMode::Stateful).router();
        let req = Request::builder()
            .uri("/nonexistent")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_unavailable() {
        let app = make_server(TransportMode::Stateful).router();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn metrics_with_handle_serves_text() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let app = make_server(TransportMode::Stateless)
            .with_metrics(handle)
            .router();
        let req = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let config = ServerConfig {
            max_body_bytes: 16,
            ..ServerConfig::default()
        };
        let app = SluiceServer::new(config, Arc::new(EchoFactory)).router();
        let req = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn listen_binds_and_stops_on_shutdown() {
        let server = make_server(TransportMode::Stateful);
        let (addr, handle) = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        server.shutdown().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
