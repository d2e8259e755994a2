//! Device-code login over HTTP and websocket.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::device::await_authorization;
use crate::auth::DeviceCode;
use crate::errors::AppError;
use crate::models::token::mask;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub device_code: String,
    /// Seconds between polls; falls back to the interval GitHub handed out.
    #[serde(default)]
    pub interval: Option<u64>,
}

/// GET|POST /login
#[tracing::instrument(skip(state))]
pub async fn login(State(state): State<Arc<AppState>>) -> Result<Json<DeviceCode>, AppError> {
    let code = state.issuer.request_device_code().await?;
    state.logins.register(&code);
    Ok(Json(code))
}

/// POST /login/poll
#[tracing::instrument(skip(state, body))]
pub async fn login_poll(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let req = parse_poll_request(&body)?;
    let credential = complete_login(&state, &req).await?;
    Ok(Json(json!({ "access_token": credential })))
}

/// GET /ws/poll
pub async fn ws_poll(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| poll_over_socket(socket, state))
}

async fn poll_over_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(text) = next_text(&mut socket).await else {
        return;
    };

    let outcome = match parse_poll_request(text.as_bytes()) {
        Ok(req) => {
            tokio::select! {
                result = complete_login(&state, &req) => result,
                _ = closed(&mut socket) => {
                    tracing::debug!("websocket closed while polling; abandoning");
                    return;
                }
            }
        }
        Err(e) => Err(e),
    };

    let reply = match outcome {
        Ok(credential) => json!({ "access_token": credential }),
        Err(AppError::DeviceFlowTimeout) => json!({ "error": "timeout" }),
        Err(e) => json!({ "error": e.to_string() }),
    };

    if socket.send(Message::Text(reply.to_string())).await.is_ok() {
        let _ = socket.send(Message::Close(None)).await;
    }
}

/// First text frame from the client, skipping control frames.
async fn next_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

/// Resolves once the client goes away.
async fn closed(socket: &mut WebSocket) {
    while let Some(msg) = socket.recv().await {
        if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
            return;
        }
    }
}

fn parse_poll_request(body: &[u8]) -> Result<PollRequest, AppError> {
    let req: PollRequest = serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("invalid poll request: {}", e)))?;
    if req.device_code.is_empty() {
        return Err(AppError::BadRequest("device_code is required".to_string()));
    }
    Ok(req)
}

/// Waits for the user to approve, then warms the cache for the new
/// credential so its first proxied request does not have to issue.
async fn complete_login(state: &AppState, req: &PollRequest) -> Result<String, AppError> {
    let credential = await_authorization(
        state.issuer.as_ref(),
        &state.logins,
        &req.device_code,
        req.interval,
        state.config.device_poll_timeout,
    )
    .await?;

    // The credential is still good; the next proxied request retries issuance.
    if let Err(e) = state.resolver.issue(&credential).await {
        tracing::warn!(credential = %mask(&credential), "copilot token issuance after login failed: {}", e);
    }
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_poll_request() {
        let req = parse_poll_request(br#"{"device_code":"dc_1","interval":7}"#).unwrap();
        assert_eq!(req.device_code, "dc_1");
        assert_eq!(req.interval, Some(7));

        let req = parse_poll_request(br#"{"device_code":"dc_1"}"#).unwrap();
        assert_eq!(req.interval, None);
    }

    #[test]
    fn test_parse_poll_request_rejects_bad_payloads() {
        assert!(matches!(
            parse_poll_request(b"not json"),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse_poll_request(br#"{"interval":5}"#),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            parse_poll_request(br#"{"device_code":""}"#),
            Err(AppError::BadRequest(_))
        ));
    }
}
