//! URL rewriting and header transformation for upstream requests.
//!
//! The forwarding contract is a table: every inbound header name maps to one
//! [`HeaderAction`]. Names not in the table are copied through.

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::Uri;
use uuid::Uuid;

use crate::errors::AppError;
use crate::proxy::model_router::DeliveryMode;

pub const EDITOR_VERSION: &str = "vscode/1.85.1";
pub const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.12.2023120701";
pub const COPILOT_USER_AGENT: &str = "GitHubCopilotChat/0.12.2023120701";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderAction {
    /// Never forwarded.
    Strip,
    /// Replaced by `Bearer <copilot token>`.
    Authorize,
    /// Replaced by a fresh UUID per upstream call.
    FreshRequestId,
    /// Forwarded as sent by the caller (session identifiers Copilot expects).
    CopyFromCaller,
    /// Always set to this value, whatever the caller sent.
    Fixed(&'static str),
    /// Forwarded on pass-through, dropped when the reply must be parsed.
    StripWhenBuffered,
    Copy,
}

const OUTBOUND_RULES: &[(&str, HeaderAction)] = &[
    ("host", HeaderAction::Strip),
    ("content-length", HeaderAction::Strip),
    ("connection", HeaderAction::Strip),
    ("keep-alive", HeaderAction::Strip),
    ("proxy-connection", HeaderAction::Strip),
    ("proxy-authorization", HeaderAction::Strip),
    ("te", HeaderAction::Strip),
    ("trailer", HeaderAction::Strip),
    ("transfer-encoding", HeaderAction::Strip),
    ("upgrade", HeaderAction::Strip),
    ("authorization", HeaderAction::Authorize),
    ("x-request-id", HeaderAction::FreshRequestId),
    ("vscode-sessionid", HeaderAction::CopyFromCaller),
    ("machineid", HeaderAction::CopyFromCaller),
    ("editor-version", HeaderAction::Fixed(EDITOR_VERSION)),
    ("editor-plugin-version", HeaderAction::Fixed(EDITOR_PLUGIN_VERSION)),
    ("openai-organization", HeaderAction::Fixed("github-copilot")),
    ("openai-intent", HeaderAction::Fixed("conversation-panel")),
    ("content-type", HeaderAction::Fixed("application/json")),
    ("user-agent", HeaderAction::Fixed(COPILOT_USER_AGENT)),
    ("accept-encoding", HeaderAction::StripWhenBuffered),
];

/// Hop-by-hop response headers; the server layer frames its own reply.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "trailer",
    "upgrade",
];

pub fn outbound_action(name: &str) -> HeaderAction {
    OUTBOUND_RULES
        .iter()
        .find(|(rule, _)| name.eq_ignore_ascii_case(rule))
        .map(|(_, action)| *action)
        .unwrap_or(HeaderAction::Copy)
}

/// Builds the header set for an upstream call from the caller's headers.
pub fn upstream_request_headers(
    inbound: &HeaderMap,
    copilot_token: &str,
    request_id: Uuid,
    mode: DeliveryMode,
) -> Result<HeaderMap, AppError> {
    let mut out = HeaderMap::new();

    for (name, value) in inbound {
        let forward = match outbound_action(name.as_str()) {
            HeaderAction::Copy | HeaderAction::CopyFromCaller => true,
            HeaderAction::StripWhenBuffered => mode == DeliveryMode::PassThrough,
            HeaderAction::Strip
            | HeaderAction::Authorize
            | HeaderAction::FreshRequestId
            | HeaderAction::Fixed(_) => false,
        };
        if forward {
            out.append(name.clone(), value.clone());
        }
    }

    for (name, action) in OUTBOUND_RULES {
        let value = match action {
            HeaderAction::Authorize => HeaderValue::from_str(&format!("Bearer {}", copilot_token))
                .map_err(|_| AppError::Internal(anyhow::anyhow!("copilot token is not a valid header value")))?,
            HeaderAction::FreshRequestId => HeaderValue::from_str(&request_id.to_string())
                .map_err(|e| AppError::Internal(anyhow::anyhow!("invalid request id: {}", e)))?,
            HeaderAction::Fixed(v) => HeaderValue::from_static(*v),
            _ => continue,
        };
        out.insert(HeaderName::from_static(*name), value);
    }

    Ok(out)
}

/// How the caller's reply body relates to the upstream one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyBody {
    /// Upstream bytes, unchanged.
    Relayed,
    /// A JSON document produced by the gateway.
    Materialized,
}

pub fn relay_response_headers(upstream: &HeaderMap, body: ReplyBody) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n) {
            continue;
        }
        if body == ReplyBody::Materialized
            && (name == header::CONTENT_LENGTH
                || name == header::CONTENT_ENCODING
                || name == header::CONTENT_TYPE)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    if body == ReplyBody::Materialized {
        out.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    out
}

/// Path and query to forward. A leading `/v1` segment is dropped because
/// Copilot serves `/chat/completions` and `/models` at its root.
pub fn upstream_path(uri: &Uri) -> String {
    let path = uri.path();
    let path = match path.strip_prefix("/v1") {
        Some(rest) if rest.is_empty() => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    match uri.query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.to_string(),
    }
}

pub fn rewrite_url(upstream_base: &str, original_path: &str) -> String {
    format!("{}{}", upstream_base.trim_end_matches('/'), original_path)
}
