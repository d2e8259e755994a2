//! Device codes handed out by `/login` that are still waiting for the user.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::{AuthError, DeviceCode, PollOutcome, TokenIssuer};
use crate::errors::AppError;

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
/// GitHub's documented device-code lifetime, used when the response omits it.
const DEFAULT_CODE_LIFETIME: Duration = Duration::from_secs(900);
/// No poll is worth waiting longer than a code lives.
const MAX_INTERVAL: Duration = DEFAULT_CODE_LIFETIME;

#[derive(Debug, Clone)]
struct PendingLogin {
    interval: Duration,
    expires_at: Instant,
}

#[derive(Clone, Default)]
pub struct PendingLogins {
    codes: Arc<DashMap<String, PendingLogin>>,
}

impl PendingLogins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remembers `code` so a later poll for it is accepted.
    pub fn register(&self, code: &DeviceCode) {
        let now = Instant::now();
        self.codes.retain(|_, login| login.expires_at > now);

        let lifetime = code
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CODE_LIFETIME);
        let expires_at = now
            .checked_add(lifetime)
            .unwrap_or(now + DEFAULT_CODE_LIFETIME);
        self.codes.insert(
            code.device_code.clone(),
            PendingLogin {
                interval: clamp_interval(Duration::from_secs(code.interval)),
                expires_at,
            },
        );
    }

    /// Poll interval for a live code, or `None` if the code is unknown or
    /// has expired.
    pub fn interval(&self, device_code: &str) -> Option<Duration> {
        let login = self.codes.get(device_code)?;
        if login.expires_at <= Instant::now() {
            drop(login);
            self.codes.remove(device_code);
            return None;
        }
        Some(login.interval)
    }

    pub fn remove(&self, device_code: &str) {
        self.codes.remove(device_code);
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
}

/// Polls GitHub until the user approves `device_code`, returning the GitHub
/// credential. Gives up after `timeout`; the code stays registered so the
/// caller may poll again.
pub async fn await_authorization(
    issuer: &dyn TokenIssuer,
    logins: &PendingLogins,
    device_code: &str,
    interval_hint: Option<u64>,
    timeout: Duration,
) -> Result<String, AppError> {
    let registered = logins
        .interval(device_code)
        .ok_or(AppError::UnknownDeviceCode)?;
    let mut interval = clamp_interval(
        interval_hint
            .map(Duration::from_secs)
            .unwrap_or(registered),
    );

    let polling = async {
        loop {
            match issuer.poll_access_token(device_code).await {
                Ok(PollOutcome::Authorized(credential)) => {
                    logins.remove(device_code);
                    return Ok(credential);
                }
                Ok(PollOutcome::Pending) => {}
                Ok(PollOutcome::SlowDown) => {
                    interval = clamp_interval(interval.saturating_add(SLOW_DOWN_STEP));
                    tracing::debug!(interval_secs = interval.as_secs(), "github asked to slow down");
                }
                Ok(PollOutcome::Denied(reason)) => {
                    logins.remove(device_code);
                    return Err(AppError::DeviceFlowDenied(reason));
                }
                Err(AuthError::Expired) => {
                    logins.remove(device_code);
                    return Err(AppError::from(AuthError::Expired));
                }
                Err(e) => return Err(AppError::from(e)),
            }
            tokio::time::sleep(interval).await;
        }
    };

    match tokio::time::timeout(timeout, polling).await {
        Ok(result) => result,
        Err(_) => {
            tracing::info!("device authorization still pending after {:?}", timeout);
            Err(AppError::DeviceFlowTimeout)
        }
    }
}
