//! Handlers for the `/docs` routes.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, StatusCode,
    header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, VARY},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use super::error::{AppError, AppResult};
use crate::{state::AppState, store::DocId};

/// Query string of `GET /docs`.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: Option<String>,
}

/// `POST /docs`: create a document, optionally under a caller-chosen ID.
pub async fn create(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let mut body = WriteBody::parse(&body)?;
    body.authorize(&state)?;
    let document = body.document()?;
    let id = body.id()?;
    let id = state.store.create(id, &document).await?;
    state.metrics.docs_created.inc();
    debug!(%id, "document created");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

/// `POST /docs/_bulk_upsert`: create or overwrite many documents at once.
pub async fn bulk_upsert(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let mut body = WriteBody::parse(&body)?;
    body.authorize(&state)?;
    let documents = body.documents()?;
    state.store.bulk_upsert(&documents).await?;
    state.metrics.docs_upserted.inc_by(documents.len() as u64);
    debug!(count = documents.len(), "documents upserted");
    let ids: Vec<DocId> = documents.into_keys().collect();
    Ok((StatusCode::CREATED, Json(ids)).into_response())
}

/// `GET /docs?q=pattern`: list document IDs.
pub async fn search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> AppResult<Json<Vec<DocId>>> {
    let Query(params) = params?;
    let query = params.q.as_deref().filter(|q| !q.is_empty());
    let ids = state.store.search(query).await?;
    state.metrics.searches.inc();
    Ok(Json(ids))
}

/// `GET /docs/{id}`: fetch a document.
///
/// Clients accepting gzip get the stored envelope as is.
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let id = path_id(id)?;
    let response = if accepts_gzip(&headers) {
        let Some(envelope) = state.store.fetch_raw(&id).await? else {
            return Err(not_found(&state));
        };
        state.metrics.docs_fetched_raw.inc();
        (
            [
                (CONTENT_TYPE, HeaderValue::from_static("application/json")),
                (CONTENT_ENCODING, HeaderValue::from_static("gzip")),
                (VARY, HeaderValue::from_static("accept-encoding")),
            ],
            envelope.into_bytes(),
        )
            .into_response()
    } else {
        let Some(document) = state.store.fetch(&id).await? else {
            return Err(not_found(&state));
        };
        state.metrics.docs_fetched.inc();
        (
            [(VARY, HeaderValue::from_static("accept-encoding"))],
            Json(document),
        )
            .into_response()
    };
    Ok(response)
}

/// `POST /docs/{id}`: replace an existing document.
pub async fn replace(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<StatusCode> {
    let id = path_id(id)?;
    let mut body = WriteBody::parse(&body)?;
    body.authorize(&state)?;
    let document = body.document()?;
    match state.store.replace(&id, &document).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return Err(not_found(&state)),
        Err(err) => return Err(err.into()),
    }
    state.metrics.docs_replaced.inc();
    debug!(%id, "document replaced");
    Ok(StatusCode::OK)
}

/// `DELETE /docs/{id}`: delete a document. Succeeds whether or not it exists.
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> AppResult<StatusCode> {
    let id = path_id(id)?;
    let body = WriteBody::parse(&body)?;
    if !matches!(body.0.get("secret"), Some(Value::String(_))) {
        return Err(AppError::bad_request("`secret` must be a string"));
    }
    body.authorize(&state)?;
    state.store.delete(&id).await?;
    state.metrics.docs_deleted.inc();
    debug!(%id, "document deleted");
    Ok(StatusCode::OK)
}

fn not_found(state: &AppState) -> AppError {
    state.metrics.not_found.inc();
    AppError::not_found()
}

fn path_id(id: String) -> AppResult<DocId> {
    DocId::new(id).map_err(AppError::bad_request)
}

/// The JSON object body of a write request.
#[derive(Debug)]
struct WriteBody(Map<String, Value>);

impl WriteBody {
    fn parse(body: &[u8]) -> AppResult<Self> {
        match serde_json::from_slice(body) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(_) => Err(AppError::bad_request("request body must be a JSON object")),
            Err(err) => Err(AppError::bad_request(format!("invalid JSON body: {err}"))),
        }
    }

    /// Requires the body's `secret` to match the configured one.
    fn authorize(&self, state: &AppState) -> AppResult<()> {
        match self.0.get("secret") {
            Some(Value::String(secret)) if state.secret.matches(secret) => Ok(()),
            _ => {
                state.metrics.forbidden.inc();
                Err(AppError::forbidden())
            }
        }
    }

    fn document(&mut self) -> AppResult<Value> {
        match self.0.remove("document") {
            Some(doc) if is_structured(&doc) => Ok(doc),
            Some(_) => Err(AppError::bad_request(
                "`document` must be a JSON object or array",
            )),
            None => Err(AppError::bad_request("`document` is required")),
        }
    }

    fn id(&mut self) -> AppResult<Option<DocId>> {
        match self.0.remove("id") {
            None => Ok(None),
            Some(Value::String(id)) => DocId::new(id).map(Some).map_err(AppError::bad_request),
            Some(_) => Err(AppError::bad_request("`id` must be a string")),
        }
    }

    fn documents(&mut self) -> AppResult<BTreeMap<DocId, Value>> {
        let Some(Value::Object(documents)) = self.0.remove("documents") else {
            return Err(AppError::bad_request(
                "`documents` must be an object mapping ids to documents",
            ));
        };
        documents
            .into_iter()
            .map(|(id, doc)| {
                let id = DocId::new(id).map_err(AppError::bad_request)?;
                if !is_structured(&doc) {
                    return Err(AppError::bad_request(format!(
                        "document {id} must be a JSON object or array"
                    )));
                }
                Ok((id, doc))
            })
            .collect()
    }
}

fn is_structured(doc: &Value) -> bool {
    matches!(doc, Value::Object(_) | Value::Array(_))
}

/// Whether the `Accept-Encoding` headers allow a gzip response.
///
/// An explicit `gzip` entry takes precedence over `*`.
fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip = None;
    let mut wildcard = None;
    let codings = headers
        .get_all(ACCEPT_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','));
    for coding in codings {
        let mut parts = coding.split(';').map(str::trim);
        let name = parts.next().unwrap_or_default();
        let quality = parts
            .find_map(|param| param.strip_prefix("q="))
            .and_then(|q| q.parse::<f32>().ok())
            .unwrap_or(1.0);
        if name.eq_ignore_ascii_case("gzip") {
            gzip = Some(quality);
        } else if name == "*" {
            wildcard = Some(quality);
        }
    }
    gzip.or(wildcard).is_some_and(|quality| quality > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(values: &[&'static str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(ACCEPT_ENCODING, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn gzip_negotiation() {
        assert!(accepts_gzip(&headers(&["gzip"])));
        assert!(accepts_gzip(&headers(&["deflate, gzip;q=0.5"])));
        assert!(accepts_gzip(&headers(&["br", "GZIP"])));
        assert!(accepts_gzip(&headers(&["*"])));
        assert!(!accepts_gzip(&headers(&[])));
        assert!(!accepts_gzip(&headers(&["identity"])));
        assert!(!accepts_gzip(&headers(&["gzip;q=0"])));
        assert!(!accepts_gzip(&headers(&["x-gzip-ish"])));
        assert!(!accepts_gzip(&headers(&["gzip;q=0, *"])));
        assert!(!accepts_gzip(&headers(&["*", "gzip; q=0"])));
        assert!(accepts_gzip(&headers(&["*;q=0, gzip"])));
        assert!(!accepts_gzip(&headers(&["identity, *;q=0"])));
    }

    #[test]
    fn write_body_validation() {
        assert!(WriteBody::parse(b"").is_err());
        assert!(WriteBody::parse(b"[1, 2]").is_err());

        let mut body = WriteBody::parse(br#"{"document": null, "id": 7}"#).unwrap();
        assert_eq!(body.document().unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(body.id().unwrap_err().status(), StatusCode::BAD_REQUEST);

        let mut body = WriteBody::parse(br#"{"document": {"a": 1}, "id": ""}"#).unwrap();
        assert_eq!(body.document().unwrap(), json!({"a": 1}));
        assert!(body.id().is_err());

        let mut body = WriteBody::parse(br#"{"documents": {"a": {}, "b": "scalar"}}"#).unwrap();
        assert!(body.documents().is_err());

        let mut body = WriteBody::parse(br#"{"documents": {"a": {}, "b": [1]}}"#).unwrap();
        let docs = body.documents().unwrap();
        assert_eq!(docs.len(), 2);
    }
}
