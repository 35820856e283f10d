//! Reactive entity cache
//!
//! One [`ScopeSnapshot`] per scope, published through a `tokio::sync::watch`
//! channel. Writers mutate the snapshot in place under the channel's lock;
//! observers only ever see whole snapshots and several writes landing
//! between two polls collapse into a single notification.

use crate::patch::Patch;
use crate::snapshot::ScopeSnapshot;
use dashmap::DashMap;
use smartpin_model::ScopeId;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type ScopeSender = Arc<watch::Sender<ScopeSnapshot>>;

/// Normalized store of markers, child issues and layers keyed by scope
#[derive(Debug, Default)]
pub struct EntityCache {
    scopes: DashMap<ScopeId, ScopeSender>,
}

impl EntityCache {
    /// Create empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot of `scope`, empty if nothing was ever written
    #[must_use]
    pub fn get(&self, scope: &ScopeId) -> ScopeSnapshot {
        self.scopes
            .get(scope)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    /// Run `f` against the current snapshot without cloning it
    ///
    /// Reading a scope never written runs `f` on an empty snapshot and
    /// leaves the cache untouched.
    pub fn read<R>(&self, scope: &ScopeId, f: impl FnOnce(&ScopeSnapshot) -> R) -> R {
        let Some(tx) = self.scopes.get(scope).map(|entry| Arc::clone(entry.value())) else {
            return f(&ScopeSnapshot::default());
        };
        let snapshot = tx.borrow();
        f(&snapshot)
    }

    /// Apply one patch
    pub fn apply(&self, scope: &ScopeId, patch: &Patch) -> bool {
        self.update(scope, |snapshot| snapshot.apply(patch))
    }

    /// Apply patches as one step; observers see either none or all of them
    pub fn apply_all(&self, scope: &ScopeId, patches: &[Patch]) -> bool {
        if patches.is_empty() {
            return false;
        }
        let changed = self.update(scope, |snapshot| snapshot.apply_all(patches));
        trace!(scope = %scope, patches = patches.len(), changed, "Applied patches");
        changed
    }

    /// Mutate the snapshot atomically
    ///
    /// `f` returns whether it changed anything; observers are only woken when
    /// it did. `f` runs under the scope's write lock and must not call back
    /// into the cache.
    pub fn update(&self, scope: &ScopeId, f: impl FnOnce(&mut ScopeSnapshot) -> bool) -> bool {
        self.sender(scope).send_if_modified(f)
    }

    /// Replace the whole snapshot, notifying only if it differs
    pub fn replace(&self, scope: &ScopeId, snapshot: ScopeSnapshot) -> bool {
        let changed = self.update(scope, |current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
        debug!(scope = %scope, changed, "Replaced scope snapshot");
        changed
    }

    /// Watch `scope` for changes
    #[must_use]
    pub fn subscribe(&self, scope: &ScopeId) -> SnapshotWatcher {
        SnapshotWatcher {
            rx: self.sender(scope).subscribe(),
        }
    }

    /// Invoke `callback` with the latest snapshot after each coalesced change
    ///
    /// Must be called within a Tokio runtime. Dropping the returned handle
    /// unsubscribes.
    pub fn subscribe_with<F>(&self, scope: &ScopeId, mut callback: F) -> CallbackSubscription
    where
        F: FnMut(&ScopeSnapshot) + Send + 'static,
    {
        let mut watcher = self.subscribe(scope);
        let handle = tokio::spawn(async move {
            while watcher.changed().await {
                let snapshot = watcher.latest();
                callback(&snapshot);
            }
        });
        CallbackSubscription { handle }
    }

    /// Forget a scope; live watchers observe the end of the stream
    pub fn drop_scope(&self, scope: &ScopeId) {
        if self.scopes.remove(scope).is_some() {
            debug!(scope = %scope, "Dropped scope from cache");
        }
    }

    /// Scopes currently held
    #[must_use]
    pub fn scopes(&self) -> Vec<ScopeId> {
        self.scopes.iter().map(|e| e.key().clone()).collect()
    }

    fn sender(&self, scope: &ScopeId) -> ScopeSender {
        if let Some(tx) = self.scopes.get(scope) {
            return Arc::clone(tx.value());
        }
        let entry = self
            .scopes
            .entry(scope.clone())
            .or_insert_with(|| Arc::new(watch::channel(ScopeSnapshot::new()).0));
        Arc::clone(entry.value())
    }
}

/// Receiver side of a scope subscription
#[derive(Debug, Clone)]
pub struct SnapshotWatcher {
    rx: watch::Receiver<ScopeSnapshot>,
}

impl SnapshotWatcher {
    /// Wait for a change not yet seen; `false` once the scope is gone
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Latest snapshot, marking it seen
    #[must_use]
    pub fn latest(&mut self) -> ScopeSnapshot {
        self.rx.borrow_and_update().clone()
    }

    /// Latest snapshot without marking it seen
    #[must_use]
    pub fn current(&self) -> ScopeSnapshot {
        self.rx.borrow().clone()
    }
}

/// Callback subscription; dropping it unsubscribes
#[derive(Debug)]
pub struct CallbackSubscription {
    handle: JoinHandle<()>,
}

impl CallbackSubscription {
    /// Stop delivering notifications
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for CallbackSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
