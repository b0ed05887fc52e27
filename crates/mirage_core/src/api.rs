use std::sync::Arc;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use hyper::Body;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error};

use mirage_net::fingerprint;
use mirage_traits::{BatchRequest, FetchRequest, Fetcher, FingerprintInfo, FingerprintList, MAX_BATCH};

use crate::state::AppState;
use crate::worker::read_capped;

pub const PREFIX: &str = "/api/mirage";
const SERVICE: &str = "mirage";
/// Largest JSON body the API will read.
const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Serves the REST surface for requests with a relative URL.
pub async fn handle(state: Arc<AppState>, req: Request<Body>) -> Response<Body> {
    let path = req
        .uri()
        .path()
        .strip_prefix(PREFIX)
        .map(|p| p.trim_end_matches('/').to_string());

    let Some(path) = path else {
        return error_json(StatusCode::NOT_FOUND, "not found");
    };

    let method = req.method().clone();
    match (method, path.as_str()) {
        (Method::GET, "/health") => health(&state),
        (Method::POST, "/fetch" | "/v1/fetch") => fetch(&state, req).await,
        (Method::POST, "/v1/batch") => batch(&state, req).await,
        (Method::GET, "/v1/fingerprints") => fingerprints(),
        (_, "/health" | "/fetch" | "/v1/fetch" | "/v1/batch" | "/v1/fingerprints") => {
            error_json(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => error_json(StatusCode::NOT_FOUND, "not found"),
    }
}

fn health(state: &AppState) -> Response<Body> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            "service": SERVICE,
            "proxy_enabled": state.upstream.is_some(),
            "auth_enabled": state.auth_enabled(),
        }),
    )
}

async fn fetch(state: &AppState, req: Request<Body>) -> Response<Body> {
    let request: FetchRequest = match read_json(req).await {
        Ok(r) => r,
        Err(response) => return response,
    };
    if request.url.trim().is_empty() {
        return error_json(StatusCode::BAD_REQUEST, "url is required");
    }

    debug!(url = %request.url, fingerprint = ?request.fingerprint, "api fetch");
    let result = state.scraper.fetch(request).await;
    json_response(StatusCode::OK, &result)
}

async fn batch(state: &AppState, req: Request<Body>) -> Response<Body> {
    let batch: BatchRequest = match read_json(req).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    if batch.requests.is_empty() {
        return error_json(
            StatusCode::BAD_REQUEST,
            "requests array is required and cannot be empty",
        );
    }
    if batch.requests.len() > MAX_BATCH {
        return error_json(
            StatusCode::BAD_REQUEST,
            &format!("maximum {MAX_BATCH} requests per batch"),
        );
    }

    debug!(count = batch.requests.len(), "api batch");
    let result = state.scraper.fetch_batch(batch.requests).await;
    json_response(StatusCode::OK, &result)
}

fn fingerprints() -> Response<Body> {
    let list = FingerprintList {
        fingerprints: fingerprint::list_profiles()
            .iter()
            .map(|p| FingerprintInfo {
                name: p.name.to_string(),
                user_agent: p.user_agent.to_string(),
            })
            .collect(),
    };
    json_response(StatusCode::OK, &list)
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, Response<Body>> {
    let bytes = read_capped(req.into_body(), MAX_REQUEST_BODY)
        .await
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| error_json(StatusCode::BAD_REQUEST, &format!("invalid request body: {e}")))
}

fn error_json(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    let (status, body) = match serde_json::to_vec(value) {
        Ok(body) => (status, body),
        Err(e) => {
            error!(error = %e, "failed to serialize response");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                br#"{"error":"internal error"}"#.to_vec(),
            )
        }
    };
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
