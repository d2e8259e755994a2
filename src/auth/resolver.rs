//! Credential -> Copilot token, through the cache.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{AuthError, TokenIssuer};
use crate::cache::TokenCache;
use crate::models::token::{mask, CopilotToken};

/// Resolves a caller's GitHub credential to a usable Copilot token.
///
/// A cache hit never touches GitHub. On a miss, concurrent requests for the
/// same credential queue behind one per-credential gate, so only the first
/// one issues; the rest find the fresh token in the cache. Different
/// credentials never wait on each other.
#[derive(Clone)]
pub struct TokenResolver {
    cache: TokenCache,
    issuer: Arc<dyn TokenIssuer>,
    gates: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TokenResolver {
    pub fn new(cache: TokenCache, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            cache,
            issuer,
            gates: Arc::new(DashMap::new()),
        }
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub async fn resolve(&self, credential: &str) -> Result<CopilotToken, AuthError> {
        if let Some(token) = self.cache.get(credential) {
            return Ok(token);
        }

        let lease = GateLease {
            gate: self
                .gates
                .entry(credential.to_string())
                .or_default()
                .clone(),
            gates: &self.gates,
            credential,
        };
        let _turn = lease.gate.lock().await;
        match self.cache.get(credential) {
            Some(token) => {
                tracing::debug!(credential = %mask(credential), "copilot token issued by a concurrent request");
                Ok(token)
            }
            None => self.issue(credential).await,
        }
    }

    /// Issues a fresh token and caches it, bypassing any cached copy.
    pub async fn issue(&self, credential: &str) -> Result<CopilotToken, AuthError> {
        let token = self.issuer.issue_token(credential).await?;
        self.cache.set(credential, token.clone());
        Ok(token)
    }
}

/// One waiter's hold on a credential's gate. Dropping it, on completion or
/// when the request is abandoned mid-wait, removes the gate once nobody else
/// holds it.
struct GateLease<'a> {
    gate: Arc<Mutex<()>>,
    gates: &'a DashMap<String, Arc<Mutex<()>>>,
    credential: &'a str,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        // The map's copy plus ours: nobody else is queued on this gate.
        self.gates
            .remove_if(self.credential, |_, g| Arc::strong_count(g) <= 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DeviceCode, PollOutcome};
    use crate::clock::{Clock, MockClock};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingIssuer {
        clock: MockClock,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl crate::auth::TokenIssuer for CountingIssuer {
        async fn request_device_code(&self) -> Result<DeviceCode, AuthError> {
            unreachable!()
        }

        async fn poll_access_token(&self, _device_code: &str) -> Result<PollOutcome, AuthError> {
            unreachable!()
        }

        async fn issue_token(&self, credential: &str) -> Result<CopilotToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail {
                return Err(AuthError::Rejected {
                    status: 401,
                    message: "Bad credentials".into(),
                });
            }
            Ok(CopilotToken::new(
                format!("tid={};n={}", credential, n),
                self.clock.now() + chrono::Duration::minutes(30),
            ))
        }
    }

    fn setup(fail: bool) -> (TokenResolver, Arc<CountingIssuer>, MockClock) {
        let clock = MockClock::new();
        let issuer = Arc::new(CountingIssuer {
            clock: clock.clone(),
            calls: AtomicUsize::new(0),
            fail,
        });
        let cache = TokenCache::in_memory(Arc::new(clock.clone()), Duration::from_secs(10));
        (TokenResolver::new(cache, issuer.clone()), issuer, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_issues_and_caches() {
        let (resolver, issuer, _) = setup(false);

        let first = resolver.resolve("ghu_a").await.unwrap();
        let second = resolver.resolve("ghu_a").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolver.cache().get("ghu_a"), Some(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_issuance() {
        let (resolver, issuer, _) = setup(false);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve("ghu_a").await.unwrap() })
            })
            .collect();

        let mut tokens = Vec::new();
        for t in tasks {
            tokens.push(t.await.unwrap());
        }

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.windows(2).all(|w| w[0] == w[1]));
        assert!(resolver.gates.is_empty(), "gates are released after use");
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_resolve_releases_gate() {
        let (resolver, issuer, _) = setup(false);

        let mut issuing = tokio_test::task::spawn(resolver.resolve("ghu_gone"));
        tokio_test::assert_pending!(issuing.poll());
        let mut queued = tokio_test::task::spawn(resolver.resolve("ghu_gone"));
        tokio_test::assert_pending!(queued.poll());
        assert_eq!(resolver.gates.len(), 1);

        drop(queued);
        assert_eq!(resolver.gates.len(), 1, "still held by the issuing request");
        drop(issuing);
        assert!(resolver.gates.is_empty());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
        assert!(resolver.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_abandoned_resolves_leave_no_gates() {
        let (resolver, _, _) = setup(false);

        let tasks: Vec<_> = (0..100)
            .map(|i| {
                let resolver = resolver.clone();
                tokio::spawn(async move { resolver.resolve(&format!("bogus_{}", i)).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for t in &tasks {
            t.abort();
        }
        for t in tasks {
            assert!(t.await.unwrap_err().is_cancelled());
        }
        assert!(resolver.gates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_credentials_issue_independently() {
        let (resolver, issuer, _) = setup(false);

        let (a, b) = tokio::join!(resolver.resolve("ghu_a"), resolver.resolve("ghu_b"));
        assert_ne!(a.unwrap(), b.unwrap());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_reissued() {
        let (resolver, issuer, clock) = setup(false);

        resolver.resolve("ghu_a").await.unwrap();
        clock.advance(Duration::from_secs(30 * 60 - 10));
        let fresh = resolver.resolve("ghu_a").await.unwrap();

        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
        assert!(fresh.token.ends_with("n=2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_not_cached() {
        let (resolver, issuer, _) = setup(true);

        assert!(resolver.resolve("ghu_bad").await.is_err());
        assert!(resolver.resolve("ghu_bad").await.is_err());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 2);
        assert!(resolver.cache().is_empty());
    }
}
