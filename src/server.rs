//! The main server, combining the HTTP server, the store and the metrics service.

use std::{
    sync::{Arc, RwLock},
    time::SystemTime,
};

use anyhow::Result;
use iroh_metrics::Registry;
use tracing::{info, warn};

use crate::{
    config::Config,
    http::HttpServer,
    metrics::ServerMetrics,
    state::{AppState, Secret},
    store::Store,
};

/// Spawn the server and run until the `Ctrl-C` signal is received, then shutdown.
pub async fn run_with_config_until_ctrl_c(config: Config) -> Result<()> {
    let store = config.store.open().await?;
    let server = Server::spawn(config, store).await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown");
    server.shutdown().await?;
    Ok(())
}

/// The docstore server.
pub struct Server {
    http_server: HttpServer,
    store: Arc<dyn Store>,
    metrics_task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl Server {
    /// Spawn the server.
    ///
    /// This will spawn several background tasks:
    /// * A HTTP server task
    /// * A metrics server task, unless disabled in `config.metrics`
    pub async fn spawn(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let metrics = ServerMetrics::default();
        let state = AppState {
            store: store.clone(),
            secret: Secret::new(config.secret.as_str()),
            metrics: metrics.docs.clone(),
            started_at: SystemTime::now(),
        };

        let metrics_addr = config.metrics_addr();
        let metrics_task = tokio::task::spawn(async move {
            if let Some(addr) = metrics_addr {
                let mut registry = Registry::default();
                registry.register_all(&metrics);
                iroh_metrics::service::start_metrics_server(addr, Arc::new(RwLock::new(registry)))
                    .await?;
            }
            Ok(())
        });
        let http_server = HttpServer::spawn(config.http, state).await?;
        info!(?store, "docstore ready");
        Ok(Self {
            http_server,
            store,
            metrics_task,
        })
    }

    /// Get the bound address of the HTTP server.
    pub fn http_addr(&self) -> std::net::SocketAddr {
        self.http_server.http_addr()
    }

    /// Cancel the server tasks, wait for them to complete and close the store.
    pub async fn shutdown(self) -> Result<()> {
        self.metrics_task.abort();
        let res = self.http_server.shutdown().await;
        if let Err(err) = self.store.quit().await {
            warn!(?err, "failed to close store");
        }
        res
    }

    /// Wait for all tasks to complete.
    ///
    /// This will run forever unless the HTTP server fails.
    pub async fn run_until_error(self) -> Result<()> {
        let res = self.http_server.run_until_done().await;
        self.metrics_task.abort();
        self.store.quit().await?;
        res
    }

    /// Spawn a server suitable for testing.
    ///
    /// It serves an in-memory store on a random local port with metrics disabled, and
    /// returns the server together with the base URL of the document routes.
    #[cfg(test)]
    pub async fn spawn_for_tests() -> Result<(Self, String)> {
        use std::net::{IpAddr, Ipv4Addr};

        use crate::{config::MetricsConfig, store::MemoryStore};

        let mut config = Config::default();
        config.secret = TEST_SECRET.to_string();
        config.http.port = 0;
        config.http.bind_addr = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        config.metrics = Some(MetricsConfig::disabled());
        let prefix = config.http.prefix.clone();

        let server = Self::spawn(config, Arc::new(MemoryStore::new())).await?;
        let base_url = format!("http://{}{}", server.http_addr(), prefix);
        Ok((server, base_url))
    }
}

/// Secret of the server started by [`Server::spawn_for_tests`].
#[cfg(test)]
pub(crate) const TEST_SECRET: &str = "test-secret";
