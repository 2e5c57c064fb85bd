//! HTTP server hosting a downstream router behind the admission gate.

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::layer::AdmissionLayer;
use crate::error::{Result, TollgateError};
use crate::ratelimit::AdmissionGate;

/// HTTP server that runs every request through an [`AdmissionGate`].
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The gate shared by all connections
    gate: Arc<AdmissionGate>,
    /// Downstream application
    router: Router,
}

impl GateServer {
    /// Create a new server forwarding admitted requests to `router`.
    pub fn new(addr: SocketAddr, gate: Arc<AdmissionGate>, router: Router) -> Self {
        Self { addr, gate, router }
    }

    /// The router with the admission layer applied.
    pub fn app(&self) -> Router {
        self.router
            .clone()
            .layer(AdmissionLayer::new(self.gate.clone()))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.app();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TollgateError::Io(e)
        })?;

        info!(
            addr = %self.addr,
            capacity = self.gate.bucket().capacity(),
            policy = ?self.gate.bucket().policy(),
            "Starting gated HTTP server"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TollgateError::Io(e)
            })
    }
}
