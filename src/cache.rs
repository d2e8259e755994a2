use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::jobs::persist::{self, PersistHandle};
use crate::models::token::{mask, CopilotToken};
use crate::store::TokenStore;

/// Self-expiring map from a caller's GitHub credential to its current Copilot
/// token.
///
/// A token is never handed out once `now >= expires_at - margin`. Expired
/// entries are dropped lazily on read and by a single sweep timer that is
/// always armed for the earliest margin-adjusted expiry in the map (or not at
/// all when the map is empty). Every mutation happens under one lock that is
/// never held across I/O; disk writes are queued to a background writer.
///
/// Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
    margin: chrono::Duration,
    persist: Option<PersistHandle>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CopilotToken>,
    sweep: Option<ArmedSweep>,
    /// Bumped every time the timer is re-armed; a waking timer whose
    /// generation no longer matches has been superseded.
    generation: u64,
    /// Bumped for every snapshot handed to the writer.
    revision: u64,
}

struct ArmedSweep {
    generation: u64,
    due: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl TokenCache {
    /// Opens a cache backed by `store`, warm-started from whatever it holds.
    /// An unreadable file is logged and treated as empty.
    pub async fn open(store: TokenStore, clock: Arc<dyn Clock>, margin: Duration) -> Self {
        let entries = match store.load(clock.now()).await {
            Ok(entries) => {
                tracing::info!(
                    path = %store.path().display(),
                    count = entries.len(),
                    "loaded persisted copilot tokens"
                );
                entries
            }
            Err(e) => {
                tracing::warn!(
                    path = %store.path().display(),
                    "ignoring unreadable token file: {:#}",
                    e
                );
                HashMap::new()
            }
        };

        let persist = persist::spawn(store, clock.clone());
        let cache = Self::build(clock, margin, Some(persist));
        {
            let mut state = cache.lock();
            state.entries = entries;
            cache.inner.rearm(&mut state);
        }
        cache
    }

    /// A cache with no disk backing.
    pub fn in_memory(clock: Arc<dyn Clock>, margin: Duration) -> Self {
        Self::build(clock, margin, None)
    }

    fn build(clock: Arc<dyn Clock>, margin: Duration, persist: Option<PersistHandle>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState::default()),
                clock,
                margin: chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero()),
                persist,
            }),
        }
    }

    /// Returns the token for `credential` if it is still outside the safety
    /// margin. A token inside the margin is removed and `None` returned.
    pub fn get(&self, credential: &str) -> Option<CopilotToken> {
        let now = self.inner.clock.now();
        let mut state = self.lock();

        let usable = match state.entries.get(credential) {
            None => return None,
            Some(token) => token.is_usable_at(now, self.inner.margin),
        };
        if usable {
            return state.entries.get(credential).cloned();
        }

        state.entries.remove(credential);
        self.inner.rearm(&mut state);
        tracing::debug!(credential = %mask(credential), "evicted copilot token on read");
        None
    }

    /// Inserts or replaces the token for `credential`, re-arms the sweep and
    /// queues a disk write.
    pub fn set(&self, credential: &str, token: CopilotToken) {
        let snapshot = {
            let mut state = self.lock();
            tracing::debug!(
                credential = %mask(credential),
                expires_at = token.expires_at,
                "caching copilot token"
            );
            state.entries.insert(credential.to_string(), token);
            self.inner.rearm(&mut state);
            self.inner.snapshot(&mut state)
        };
        self.inner.submit(snapshot);
    }

    /// Number of entries currently held, including any the sweep has not
    /// reached yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the sweep timer will next fire, if armed.
    pub fn next_sweep_at(&self) -> Option<DateTime<Utc>> {
        self.lock().sweep.as_ref().map(|s| s.due)
    }

    /// Credentials whose tokens are still usable, sorted for stable output.
    pub fn usable_entries(&self) -> Vec<(String, CopilotToken)> {
        let now = self.inner.clock.now();
        let state = self.lock();
        let mut out: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, token)| token.is_usable_at(now, self.inner.margin))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Waits for every queued disk write to finish.
    pub async fn flush(&self) {
        if let Some(persist) = &self.inner.persist {
            persist.flush().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner.lock()
    }
}

type Snapshot = Option<(u64, HashMap<String, CopilotToken>)>;

impl Inner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every critical section leaves the map consistent, so a panic
        // elsewhere does not invalidate it.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces any pending timer with one due at the earliest eviction
    /// instant, or leaves the cache disarmed when it is empty.
    fn rearm(self: &Arc<Self>, state: &mut CacheState) {
        if let Some(previous) = state.sweep.take() {
            previous.handle.abort();
        }

        let Some(due) = state
            .entries
            .values()
            .map(|token| token.evict_at(self.margin))
            .min()
        else {
            return;
        };

        state.generation += 1;
        let generation = state.generation;
        let delay = (due - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
        // Fixed now, not when the task is first polled.
        let deadline = tokio::time::Instant::now() + delay;
        let weak: Weak<Inner> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(generation);
            }
        });

        state.sweep = Some(ArmedSweep {
            generation,
            due,
            handle,
        });
    }

    fn fire(self: &Arc<Self>, generation: u64) {
        let snapshot = {
            let mut state = self.lock();
            match &state.sweep {
                Some(armed) if armed.generation == generation => {}
                _ => return,
            }
            // This task is the one running; let it finish instead of aborting it.
            state.sweep = None;

            let now = self.clock.now();
            let before = state.entries.len();
            state
                .entries
                .retain(|_, token| token.is_usable_at(now, self.margin));
            let evicted = before - state.entries.len();

            self.rearm(&mut state);

            if evicted > 0 {
                tracing::debug!(evicted, remaining = state.entries.len(), "token sweep");
                self.snapshot(&mut state)
            } else {
                None
            }
        };
        self.submit(snapshot);
    }

    fn snapshot(&self, state: &mut CacheState) -> Snapshot {
        self.persist.as_ref()?;
        state.revision += 1;
        Some((state.revision, state.entries.clone()))
    }

    fn submit(&self, snapshot: Snapshot) {
        if let (Some(persist), Some((revision, tokens))) = (&self.persist, snapshot) {
            persist.submit(revision, tokens);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(armed) = state.sweep.take() {
            armed.handle.abort();
        }
    }
}
