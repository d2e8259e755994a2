use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Where issued Copilot tokens are persisted between restarts.
    pub token_file: PathBuf,
    /// Base URL of the chat completion API.
    pub upstream_url: String,
    /// Base URL for `copilot_internal/v2/token`.
    pub github_api_url: String,
    /// Base URL for the device-code OAuth endpoints.
    pub github_url: String,
    pub client_id: String,
    /// Model-name prefixes whose non-streaming requests are served by forcing
    /// upstream streaming and folding the fragments.
    /// Set via COPILOT_GATEWAY_BUFFERED_MODELS (comma-separated). Default: gpt-4.1.
    pub buffered_model_prefixes: Vec<String>,
    /// Tokens are treated as expired this long before their stated expiry.
    pub token_margin: Duration,
    /// Bound on waiting for upstream response headers and on the whole
    /// buffered (emulated non-streaming) exchange.
    pub upstream_timeout: Duration,
    pub connect_timeout: Duration,
    /// How long `/login/poll` and `/ws/poll` wait for the user to authorize.
    pub device_poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            token_file: PathBuf::from("copilot_tokens.json"),
            upstream_url: "https://api.githubcopilot.com".into(),
            github_api_url: "https://api.github.com".into(),
            github_url: "https://github.com".into(),
            client_id: "Iv1.b507a08c87ecfe98".into(),
            buffered_model_prefixes: vec!["gpt-4.1".into()],
            token_margin: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            device_poll_timeout: Duration::from_secs(30),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    let defaults = Config::default();

    let cfg = Config {
        listen_addr: match std::env::var("COPILOT_GATEWAY_LISTEN") {
            Ok(v) => v
                .parse()
                .with_context(|| format!("invalid COPILOT_GATEWAY_LISTEN: {}", v))?,
            Err(_) => defaults.listen_addr,
        },
        token_file: std::env::var("COPILOT_GATEWAY_TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or(defaults.token_file),
        upstream_url: base_url("COPILOT_GATEWAY_UPSTREAM_URL", defaults.upstream_url)?,
        github_api_url: base_url("COPILOT_GATEWAY_GITHUB_API_URL", defaults.github_api_url)?,
        github_url: base_url("COPILOT_GATEWAY_GITHUB_URL", defaults.github_url)?,
        client_id: std::env::var("COPILOT_GATEWAY_CLIENT_ID").unwrap_or(defaults.client_id),
        buffered_model_prefixes: match std::env::var("COPILOT_GATEWAY_BUFFERED_MODELS") {
            Ok(v) => split_list(&v),
            Err(_) => defaults.buffered_model_prefixes,
        },
        token_margin: secs("COPILOT_GATEWAY_TOKEN_MARGIN_SECS", defaults.token_margin),
        upstream_timeout: secs("COPILOT_GATEWAY_UPSTREAM_TIMEOUT_SECS", defaults.upstream_timeout),
        connect_timeout: secs("COPILOT_GATEWAY_CONNECT_TIMEOUT_SECS", defaults.connect_timeout),
        device_poll_timeout: secs(
            "COPILOT_GATEWAY_DEVICE_POLL_TIMEOUT_SECS",
            defaults.device_poll_timeout,
        ),
    };

    Ok(cfg)
}

fn secs(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Reads a base URL, validates it and strips any trailing slash.
fn base_url(var: &str, default: String) -> anyhow::Result<String> {
    let raw = std::env::var(var).unwrap_or(default);
    let parsed = url::Url::parse(&raw).with_context(|| format!("invalid {}: {}", var, raw))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL, got {}", var, raw);
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
