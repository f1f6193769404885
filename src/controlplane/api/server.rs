//! API Server
//!
//! Serves the REST transport of the dock until shutdown is requested.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::controlplane::dispatch::Dock;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Max request body size
    pub max_body_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    dock: Arc<Dock>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, dock: Arc<Dock>) -> Self {
        Self {
            config,
            dock,
            shutdown: CancellationToken::new(),
        }
    }

    /// Run the API server until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server on {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();
        match rest_handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("REST server task failed: {}", e);
                Err(Error::Internal(format!("REST server task failed: {}", e)))
            }
        }
    }

    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let router = RestRouter::new(self.dock.clone(), self.config.max_body_size);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move { run_rest_server(addr, router, shutdown).await })
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    router: RestRouter,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router.build();

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        Error::Internal(format!("Failed to bind REST server: {}", e))
    })?;
    info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockConfig;
    use crate::controlplane::registry::init_registry;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert_eq!(config.max_body_size, 10 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let dock = Dock::new(DockConfig::default(), Arc::new(init_registry())).unwrap();
        let config = ApiServerConfig {
            rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        };
        let server = Arc::new(ApiServer::new(config, dock));

        let running = server.clone();
        let handle = tokio::spawn(async move { running.run().await });
        server.shutdown();

        handle.await.unwrap().unwrap();
    }
}
