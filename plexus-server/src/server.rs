//! HTTP server with graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::{context::AppContext, error::Result};

/// Server instance
pub struct Server {
    context: Arc<AppContext>,
}

impl Server {
    /// Create a new server over a running application context
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Run the server until a shutdown signal arrives
    ///
    /// Every request funnels through the application context's
    /// dispatcher; there are no fixed routes besides the matcher table.
    pub async fn serve(self) -> Result<()> {
        let config = self.context.config().clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

        tracing::info!("Starting {} on {}", config.service.name, addr);

        let context = self.context.clone();
        let app = Router::new()
            .fallback(move |request: Request<Body>| {
                let context = context.clone();
                async move { context.handle(request).await }
            })
            .layer(CompressionLayer::new())
            .layer(TimeoutLayer::with_status_code(
                http::StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(config.service.timeout_secs),
            ))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;

        tracing::info!("Server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.context.stop().await;
        tracing::info!("Server shutdown complete");

        Ok(())
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }

    tracing::info!("Shutdown signal received, draining requests...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_server_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let context = AppContext::init(
            Config::default(),
            tmp.path().join("base"),
            tmp.path().join("local"),
            false,
        )
        .await
        .unwrap();
        let server = Server::new(context.clone());
        assert_eq!(server.context.config().service.port, 8080);
        context.stop().await;
    }
}
