//! Service information and liveness routes.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;

use crate::state::AppState;

/// Body of `GET /about`.
#[derive(Debug, Serialize)]
pub struct About {
    name: &'static str,
    version: &'static str,
    /// Start time of the server, RFC 3339 in UTC.
    started_at: String,
}

/// `GET /about`: name and version of the service and when it was started.
pub async fn about(State(state): State<AppState>) -> Json<About> {
    Json(About {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        started_at: humantime::format_rfc3339_seconds(state.started_at).to_string(),
    })
}

/// `GET /ping/{token}`: echoes the token back as `pong/{token}`.
///
/// HEAD requests are answered by the same route with an empty body.
pub async fn ping(Path(token): Path<String>) -> String {
    format!("pong/{token}")
}
