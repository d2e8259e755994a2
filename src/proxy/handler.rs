use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::Response;
use serde_json::Value;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::token::mask;
use crate::proxy::model_router::{DeliveryMode, RequestIntent};
use crate::proxy::stream::ChunkCollector;
use crate::proxy::stream_bridge::fold_sse_stream;
use crate::proxy::transform::{
    relay_response_headers, rewrite_url, upstream_path, upstream_request_headers, ReplyBody,
};
use crate::AppState;

/// The handler for every proxied completion-API path.
#[tracing::instrument(skip(state, headers, body), fields(req_id = %Uuid::new_v4()))]
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();

    // -- 1. Caller credential --
    let credential = extract_bearer_token(&headers)?;

    // -- 2. Copilot token (cache, or issue on a miss) --
    let token = state
        .resolver
        .resolve(&credential)
        .await
        .map_err(|e| {
            tracing::warn!(credential = %mask(&credential), "token resolution failed: {}", e);
            AppError::from_issuance(e)
        })?;

    // -- 3. Route --
    let intent = RequestIntent::from_body(&body);
    let mode = state.delivery.classify(&intent);
    let url = rewrite_url(&state.config.upstream_url, &upstream_path(&uri));
    let request_id = Uuid::new_v4();
    let upstream_headers = upstream_request_headers(&headers, &token.token, request_id, mode)?;

    tracing::debug!(
        %method,
        %url,
        upstream_request_id = %request_id,
        model = intent.model.as_deref().unwrap_or("-"),
        ?mode,
        "forwarding"
    );

    // -- 4. Forward --
    let response = match mode {
        DeliveryMode::PassThrough => {
            pass_through(&state, method, &url, upstream_headers, body).await
        }
        DeliveryMode::Buffered => buffered(&state, method, &url, upstream_headers, body).await,
    };

    match &response {
        Ok(resp) => tracing::info!(
            status = resp.status().as_u16(),
            ?mode,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "proxied"
        ),
        Err(e) => tracing::error!(
            ?mode,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "proxy failed: {}",
            e
        ),
    }
    response
}

/// Relays the upstream reply as it arrives. Dropping the returned body (the
/// caller went away) drops the upstream stream with it.
async fn pass_through(
    state: &AppState,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let upstream_resp = match tokio::time::timeout(
        state.config.upstream_timeout,
        state.upstream_client.forward(method, url, headers, body),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Err(AppError::UpstreamTimeout),
    };

    let status = upstream_resp.status();
    let headers = relay_response_headers(upstream_resp.headers(), ReplyBody::Relayed);
    Ok(build_response(
        status,
        headers,
        Body::from_stream(upstream_resp.bytes_stream()),
    ))
}

/// Forces upstream streaming, folds the fragments and replies once.
/// The whole exchange is bounded by the upstream timeout.
async fn buffered(
    state: &AppState,
    method: Method,
    url: &str,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let mut payload: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("request body is not valid JSON: {}", e)))?;
    payload
        .as_object_mut()
        .ok_or_else(|| AppError::BadRequest("request body must be a JSON object".to_string()))?
        .insert("stream".to_string(), Value::Bool(true));
    let body = Bytes::from(
        serde_json::to_vec(&payload).map_err(|e| AppError::Internal(e.into()))?,
    );

    let deadline = tokio::time::Instant::now() + state.config.upstream_timeout;

    let upstream_resp = tokio::time::timeout_at(
        deadline,
        state.upstream_client.forward(method, url, headers, body),
    )
    .await
    .map_err(|_| AppError::UpstreamTimeout)??;

    let status = upstream_resp.status();

    // An error, or a model that answered with plain JSON anyway: nothing to fold.
    if !status.is_success() || is_json(upstream_resp.headers()) {
        let headers = relay_response_headers(upstream_resp.headers(), ReplyBody::Relayed);
        let bytes = tokio::time::timeout_at(deadline, upstream_resp.bytes())
            .await
            .map_err(|_| AppError::UpstreamTimeout)?
            .map_err(|e| AppError::Upstream(format!("upstream body read failed: {}", e)))?;
        return Ok(build_response(status, headers, Body::from(bytes)));
    }

    let headers = relay_response_headers(upstream_resp.headers(), ReplyBody::Materialized);
    let mut collector = ChunkCollector::new();
    let summary = tokio::time::timeout_at(
        deadline,
        fold_sse_stream(Box::pin(upstream_resp.bytes_stream()), &mut collector),
    )
    .await
    .map_err(|_| AppError::UpstreamTimeout)?
    .map_err(|e| AppError::Upstream(format!("upstream stream failed: {}", e)))?;

    tracing::debug!(
        fragments = summary.fragments,
        skipped = summary.skipped,
        saw_done = summary.saw_done,
        "stream folded"
    );

    let completion = collector.build_response();
    let json = serde_json::to_vec(&completion).map_err(|e| AppError::Internal(e.into()))?;
    Ok(build_response(status, headers, Body::from(json)))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::MissingCredential)?;

    let (scheme, token) = auth.split_once(' ').ok_or(AppError::MissingCredential)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::MissingCredential);
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::MissingCredential);
    }
    Ok(token.to_string())
}
