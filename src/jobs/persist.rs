//! Background job: write token-cache snapshots to disk.
//!
//! The cache hands over a revisioned snapshot and returns immediately. A single
//! writer task owns the file, so writes never interleave, and a snapshot older
//! than the one already queued is dropped instead of overwriting newer state.
//! Failures are logged and otherwise invisible to the request path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use crate::clock::Clock;
use crate::models::token::CopilotToken;
use crate::store::TokenStore;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    revision: u64,
    tokens: HashMap<String, CopilotToken>,
}

/// Cheap handle onto the writer task. The task exits once every handle is gone.
#[derive(Clone)]
pub struct PersistHandle {
    queued: Arc<watch::Sender<Snapshot>>,
    written: watch::Receiver<u64>,
}

impl PersistHandle {
    /// Queues `tokens` as revision `revision`. Never blocks on I/O.
    pub fn submit(&self, revision: u64, tokens: HashMap<String, CopilotToken>) {
        self.queued.send_if_modified(|current| {
            if revision <= current.revision {
                return false;
            }
            *current = Snapshot { revision, tokens };
            true
        });
    }

    /// Resolves once the latest queued snapshot has been written (or failed to).
    pub async fn flush(&self) {
        let target = self.queued.borrow().revision;
        let mut written = self.written.clone();
        // Err only if the writer is gone, and then there is nothing to wait for.
        let _ = written.wait_for(|done| *done >= target).await;
    }
}

/// Spawn the writer task for `store`. Call once per cache.
pub fn spawn(store: TokenStore, clock: Arc<dyn Clock>) -> PersistHandle {
    let (queued_tx, mut queued_rx) = watch::channel(Snapshot::default());
    let (written_tx, written_rx) = watch::channel(0u64);

    tokio::spawn(async move {
        while queued_rx.changed().await.is_ok() {
            let snapshot = queued_rx.borrow_and_update().clone();
            match store.save(&snapshot.tokens, clock.now()).await {
                Ok(()) => tracing::debug!(
                    revision = snapshot.revision,
                    path = %store.path().display(),
                    "token cache persisted"
                ),
                Err(e) => tracing::warn!(
                    revision = snapshot.revision,
                    path = %store.path().display(),
                    "failed to persist token cache: {:#}",
                    e
                ),
            }
            let _ = written_tx.send(snapshot.revision);
        }
        tracing::debug!(path = %store.path().display(), "token writer stopped");
    });

    PersistHandle {
        queued: Arc::new(queued_tx),
        written: written_rx,
    }
}
