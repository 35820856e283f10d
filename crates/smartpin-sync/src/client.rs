//! Client facade
//!
//! Wires one cache, ledger, merger, pipeline and realtime hub together for
//! a single signed-in user.

use crate::backend::{AttachedPhotos, ClosureEvidence, CommitBackend, PushChannel};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::intent::{Actor, BatchItem, Intent};
use crate::ledger::PendingLedger;
use crate::merge::Merger;
use crate::pipeline::{MutationPipeline, PendingMutation};
use crate::realtime::{RealtimeHub, SubscriptionHandle};
use smartpin_cache::{EntityCache, ScopeSnapshot};
use smartpin_model::ScopeId;
use std::sync::Arc;

/// Collaboration client for one user
#[derive(Debug)]
pub struct SyncClient {
    actor: Actor,
    cache: Arc<EntityCache>,
    pipeline: MutationPipeline,
    hub: RealtimeHub,
}

impl SyncClient {
    /// Create client whose closure check inspects attached photos
    ///
    /// # Arguments
    /// * `actor` - User and role every mutation is issued as
    /// * `backend` - Persistence backend for commits
    /// * `channel` - Push channel for change and broadcast events
    /// * `config` - Timeouts, throttle and backoff settings
    #[must_use]
    pub fn new(
        actor: Actor,
        backend: Arc<dyn CommitBackend>,
        channel: Arc<dyn PushChannel>,
        config: SyncConfig,
    ) -> Self {
        Self::with_evidence(actor, backend, channel, Arc::new(AttachedPhotos), config)
    }

    /// Create client with a custom closure-photo check
    #[must_use]
    pub fn with_evidence(
        actor: Actor,
        backend: Arc<dyn CommitBackend>,
        channel: Arc<dyn PushChannel>,
        evidence: Arc<dyn ClosureEvidence>,
        config: SyncConfig,
    ) -> Self {
        let cache = Arc::new(EntityCache::new());
        let merger = Arc::new(Merger::new(Arc::clone(&cache), Arc::new(PendingLedger::new())));
        let pipeline = MutationPipeline::new(Arc::clone(&merger), backend, evidence, config.clone());
        let hub = RealtimeHub::new(merger, channel, actor.user.clone(), config);
        Self {
            actor,
            cache,
            pipeline,
            hub,
        }
    }

    /// Identity mutations are issued as
    #[inline]
    #[must_use]
    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// Shared entity cache
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Mutation pipeline
    #[inline]
    #[must_use]
    pub fn pipeline(&self) -> &MutationPipeline {
        &self.pipeline
    }

    /// Realtime hub
    #[inline]
    #[must_use]
    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    /// Current snapshot of a scope
    #[must_use]
    pub fn snapshot(&self, scope: &ScopeId) -> ScopeSnapshot {
        self.cache.get(scope)
    }

    /// Make `scope` the active realtime scope
    pub async fn open_scope(&self, scope: &ScopeId) -> SubscriptionHandle {
        self.hub.switch_scope(scope).await
    }

    /// Apply an intent optimistically and commit it
    ///
    /// # Errors
    /// `Validation` if a precondition fails; the cache is untouched
    pub fn mutate(&self, scope: &ScopeId, intent: Intent) -> Result<PendingMutation, SyncError> {
        self.pipeline.mutate(scope, &self.actor, intent)
    }

    /// Apply and commit several changes as one all-or-nothing operation
    ///
    /// # Errors
    /// `Validation` if the batch is empty or any item fails a precondition
    pub fn mutate_batch(&self, scope: &ScopeId, items: Vec<BatchItem>) -> Result<PendingMutation, SyncError> {
        self.pipeline.mutate_batch(scope, &self.actor, items)
    }

    /// Network availability signal
    pub fn set_online(&self, online: bool) {
        self.hub.set_online(online);
    }

    /// Wait until every issued mutation has committed or rolled back
    pub async fn settle(&self) {
        self.pipeline.wait_idle().await;
    }

    /// Close the realtime subscription
    pub async fn shutdown(&self) {
        self.hub.close().await;
    }
}
