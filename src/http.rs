//! HTTP server part of docstore

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Instant,
};

use anyhow::{Result, ensure};
use axum::{
    Router,
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::{self, Next},
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, task::JoinSet};
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{Level, info, span, warn};

mod about;
mod docs;
mod error;

use crate::{metrics::Metrics, state::AppState};

/// Config for the HTTP server
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,
    /// Optionally set a custom bind address (will use 127.0.0.1 if unset)
    pub bind_addr: Option<IpAddr>,
    /// Path prefix for the document, about and ping routes, e.g. `/v1`
    pub prefix: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            bind_addr: None,
            prefix: "/v1".to_string(),
        }
    }
}

impl HttpConfig {
    /// The prefix without trailing slashes, checked to be empty or start with `/`.
    fn normalized_prefix(&self) -> Result<&str> {
        let prefix = self.prefix.trim_end_matches('/');
        ensure!(
            prefix.is_empty() || prefix.starts_with('/'),
            "http prefix must start with '/', got {:?}",
            self.prefix
        );
        Ok(prefix)
    }
}

/// The HTTP server part of docstore
pub struct HttpServer {
    tasks: JoinSet<std::io::Result<()>>,
    http_addr: SocketAddr,
}

impl HttpServer {
    /// Spawn the server
    pub async fn spawn(config: HttpConfig, state: AppState) -> Result<HttpServer> {
        let app = create_app(state, config.normalized_prefix()?);

        let mut tasks = JoinSet::new();

        let bind_addr = SocketAddr::new(
            config.bind_addr.unwrap_or(Ipv4Addr::LOCALHOST.into()),
            config.port,
        );
        let listener = TcpListener::bind(bind_addr).await?.into_std()?;
        let http_addr = listener.local_addr()?;
        let fut = axum_server::from_tcp(listener)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>());
        info!("HTTP server listening on {http_addr}");
        tasks.spawn(fut);

        Ok(HttpServer { tasks, http_addr })
    }

    /// Get the bound address of the HTTP socket.
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Shutdown the server and wait for all tasks to complete.
    pub async fn shutdown(mut self) -> Result<()> {
        self.tasks.abort_all();
        self.run_until_done().await?;
        Ok(())
    }

    /// Wait for all tasks to complete.
    ///
    /// Runs forever unless tasks fail.
    pub async fn run_until_done(mut self) -> Result<()> {
        let mut final_res: anyhow::Result<()> = Ok(());
        while let Some(res) = self.tasks.join_next().await {
            match res {
                Ok(Ok(())) => {}
                Err(err) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    warn!(?err, "task failed");
                    final_res = Err(anyhow::Error::from(err));
                }
                Err(err) => {
                    warn!(?err, "task panicked");
                    final_res = Err(err.into());
                }
            }
        }
        final_res
    }
}

pub(crate) fn create_app(state: AppState, prefix: &str) -> Router {
    // configure cors middleware
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(cors::Any);

    // configure tracing middleware
    let trace = TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
        let src = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|conn_info| conn_info.0.to_string())
            .unwrap_or_default();
        span!(
            Level::DEBUG,
            "http_request",
            method = ?request.method(),
            uri = ?request.uri(),
            %src,
        )
    });

    let metrics = state.metrics.clone();

    // `_bulk_upsert` is a static segment and takes precedence over `{id}`
    let api_routes = Router::new()
        .route("/about", get(about::about))
        .route("/ping/{token}", get(about::ping))
        .route("/docs", get(docs::search).post(docs::create))
        .route("/docs/_bulk_upsert", post(docs::bulk_upsert))
        .route(
            "/docs/{id}",
            get(docs::get).post(docs::replace).delete(docs::delete),
        )
        .with_state(state);

    let router = if prefix.is_empty() {
        api_routes
    } else {
        Router::new().nest(prefix, api_routes)
    };

    router
        .route("/healthcheck", get(|| async { "OK" }))
        .layer(cors)
        .layer(trace)
        .route_layer(middleware::from_fn_with_state(metrics, metrics_middleware))
}

/// Record request metrics.
async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> impl IntoResponse {
    let start = Instant::now();
    let response = next.run(req).await;
    let latency = start.elapsed().as_millis();
    let status = response.status();
    metrics.http_requests_duration_ms.inc_by(latency as u64);
    metrics.http_requests.inc();
    if status.is_success() {
        metrics.http_requests_success.inc();
    } else {
        metrics.http_requests_error.inc();
    }
    response
}
