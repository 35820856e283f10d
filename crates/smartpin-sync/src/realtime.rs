//! Realtime reconciliation layer
//!
//! One [`ScopeSubscription`] per collaboration scope. Its pump task:
//! - attaches to the push channel, then fetches the whole scope and resyncs
//!   the cache, so nothing committed between the two steps is missed
//! - merges change events through the [`Merger`]
//! - feeds broadcast events into the [`PresenceStore`]
//! - on disconnect or an offline signal, marks itself degraded, clears
//!   presence and starts over with a full resync
//!
//! [`RealtimeHub`] keeps at most one subscription open and fully closes the
//! previous one before opening another.

use crate::backend::{BroadcastEvent, ChannelMessage, ChannelStatus, PushChannel};
use crate::config::SyncConfig;
use crate::error::{ChannelError, SyncError};
use crate::merge::Merger;
use crate::presence::PresenceStore;
use crate::throttle::{CursorPublisher, Flusher};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{ScopeId, UserId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection state of a scope subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    /// Subscribing and fetching
    Connecting,
    /// Merging events as they arrive
    Live,
    /// Not merging; local optimistic state stands until the next resync
    Degraded,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Live => "live",
            ChannelState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

struct HandleInner {
    scope: ScopeId,
    user: UserId,
    state: watch::Sender<ChannelState>,
    presence: PresenceStore,
    cursor: CursorPublisher,
    channel: Arc<dyn PushChannel>,
}

/// Shared view of an open subscription
///
/// Cheap to clone. Outlives the subscription harmlessly: once it is closed
/// the state stays `Degraded` and publishing fails.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("scope", &self.inner.scope)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// Scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &ScopeId {
        &self.inner.scope
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Wait until the subscription reaches `state`
    pub async fn wait_for_state(&self, state: ChannelState) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, so the channel cannot close here
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Presence of other users in this scope
    #[inline]
    #[must_use]
    pub fn presence(&self) -> &PresenceStore {
        &self.inner.presence
    }

    /// Throttled cursor publisher
    #[must_use]
    pub fn cursor(&self) -> CursorPublisher {
        self.inner.cursor.clone()
    }

    /// Broadcast an in-progress drawing; an empty list clears it
    ///
    /// # Errors
    /// `ChannelDegraded` while not live, `Channel` if the channel refuses
    pub async fn publish_preview(&self, points: Vec<NormalizedPoint>) -> Result<(), SyncError> {
        self.publish(BroadcastEvent::DrawingPreview {
            user: self.inner.user.clone(),
            points,
        })
        .await
    }

    /// Announce the active tool to other users
    ///
    /// # Errors
    /// `ChannelDegraded` while not live, `Channel` if the channel refuses
    pub async fn announce(&self, tool: Option<String>) -> Result<(), SyncError> {
        self.publish(BroadcastEvent::Presence {
            user: self.inner.user.clone(),
            tool,
        })
        .await
    }

    async fn publish(&self, event: BroadcastEvent) -> Result<(), SyncError> {
        if self.state() != ChannelState::Live {
            return Err(SyncError::ChannelDegraded);
        }
        self.inner.channel.publish(&self.inner.scope, event).await?;
        Ok(())
    }
}

/// Open subscription to one scope; dropping it aborts its tasks
#[derive(Debug)]
pub struct ScopeSubscription {
    handle: SubscriptionHandle,
    online: Arc<watch::Sender<bool>>,
    pump: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

impl ScopeSubscription {
    /// Subscribe to `scope` and start reconciling it into the merger's cache
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn open(
        scope: ScopeId,
        merger: Arc<Merger>,
        channel: Arc<dyn PushChannel>,
        user: UserId,
        config: &SyncConfig,
    ) -> Self {
        Self::open_with(scope, merger, channel, user, config, Arc::new(watch::Sender::new(true)))
    }

    pub(crate) fn open_with(
        scope: ScopeId,
        merger: Arc<Merger>,
        channel: Arc<dyn PushChannel>,
        user: UserId,
        config: &SyncConfig,
        online: Arc<watch::Sender<bool>>,
    ) -> Self {
        let (state, state_rx) = watch::channel(ChannelState::Connecting);
        let (cursor, flusher) = Flusher {
            channel: Arc::clone(&channel),
            scope: scope.clone(),
            user: user.clone(),
            interval: config.cursor_interval(),
            state: state_rx,
        }
        .spawn();

        let handle = SubscriptionHandle {
            inner: Arc::new(HandleInner {
                scope,
                user,
                state,
                presence: PresenceStore::new(config.presence_ttl()),
                cursor,
                channel: Arc::clone(&channel),
            }),
        };
        let pump = Pump {
            handle: handle.clone(),
            merger,
            channel,
            online: online.subscribe(),
            config: config.clone(),
        };
        info!(scope = %handle.scope(), "Opening scope subscription");

        Self {
            handle,
            online,
            pump: Some(tokio::spawn(pump.run())),
            flusher: Some(flusher),
        }
    }

    /// Shared view for readers and publishers
    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Scope
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &ScopeId {
        self.handle.scope()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.handle.state()
    }

    /// Presence of other users in this scope
    #[inline]
    #[must_use]
    pub fn presence(&self) -> &PresenceStore {
        self.handle.presence()
    }

    /// Throttled cursor publisher
    #[must_use]
    pub fn cursor(&self) -> CursorPublisher {
        self.handle.cursor()
    }

    /// Network availability signal; going offline degrades, coming back resyncs
    pub fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Stop reconciling and wait until no further cache write can happen
    pub async fn close(mut self) {
        self.shutdown().await;
        info!(scope = %self.handle.scope(), "Closed scope subscription");
    }

    async fn shutdown(&mut self) {
        for task in [self.pump.take(), self.flusher.take()].into_iter().flatten() {
            task.abort();
            // Cancellation is the expected outcome
            let _ = task.await;
        }
        self.handle.inner.state.send_replace(ChannelState::Degraded);
        self.handle.inner.presence.clear();
    }
}

impl Drop for ScopeSubscription {
    fn drop(&mut self) {
        for task in [self.pump.take(), self.flusher.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

/// Why a live session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Offline,
    Disconnected,
    ChannelError,
    StreamClosed,
}

struct Pump {
    handle: SubscriptionHandle,
    merger: Arc<Merger>,
    channel: Arc<dyn PushChannel>,
    online: watch::Receiver<bool>,
    config: SyncConfig,
}

impl Pump {
    async fn run(mut self) {
        let scope = self.handle.scope().clone();
        let mut attempt: u32 = 0;
        loop {
            if self.online.wait_for(|online| *online).await.is_err() {
                return;
            }
            self.set_state(ChannelState::Connecting);

            match self.connect(&scope).await {
                Ok(mut stream) => {
                    attempt = 0;
                    self.set_state(ChannelState::Live);
                    info!(scope = %scope, "Subscription live");
                    let ended = self.live(&scope, &mut stream).await;
                    warn!(scope = %scope, ?ended, "Subscription degraded");
                    self.degrade();
                    if ended == Ended::Offline {
                        continue;
                    }
                }
                Err(err) => {
                    warn!(scope = %scope, %err, attempt, "Resync failed");
                    self.degrade();
                }
            }

            let delay = self.config.resync_delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self, scope: &ScopeId) -> Result<BoxStream<'static, ChannelMessage>, ChannelError> {
        let stream = self.channel.subscribe(scope).await?;
        let records = self.channel.fetch_scope(scope).await?;
        self.merger.resync(scope, records);
        Ok(stream)
    }

    async fn live(&mut self, scope: &ScopeId, stream: &mut BoxStream<'static, ChannelMessage>) -> Ended {
        let presence = self.handle.presence();
        let local = self.handle.inner.user.clone();
        let mut prune = tokio::time::interval((self.config.presence_ttl() / 2).max(Duration::from_millis(10)));

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(ChannelMessage::Change(event)) => {
                        let outcome = self.merger.ingest(scope, &event);
                        debug!(scope = %scope, key = ?event.key(), ?outcome, "Change event");
                    }
                    Some(ChannelMessage::Broadcast(event)) => {
                        if *event.user() != local {
                            presence.apply(&event);
                        }
                    }
                    Some(ChannelMessage::Status(ChannelStatus::Disconnected)) => return Ended::Disconnected,
                    Some(ChannelMessage::Status(ChannelStatus::Error(reason))) => {
                        warn!(scope = %scope, %reason, "Channel error");
                        return Ended::ChannelError;
                    }
                    None => return Ended::StreamClosed,
                },
                changed = self.online.changed() => {
                    if changed.is_err() || !*self.online.borrow() {
                        return Ended::Offline;
                    }
                }
                _ = prune.tick() => {
                    presence.prune();
                }
            }
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.handle.inner.state.send_replace(state);
    }

    fn degrade(&self) {
        self.set_state(ChannelState::Degraded);
        self.handle.presence().clear();
    }
}

/// Owner of the single active scope subscription
pub struct RealtimeHub {
    merger: Arc<Merger>,
    channel: Arc<dyn PushChannel>,
    user: UserId,
    config: SyncConfig,
    online: Arc<watch::Sender<bool>>,
    current: Mutex<Option<ScopeSubscription>>,
}

impl fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("user", &self.user)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl RealtimeHub {
    /// Create hub with no open subscription
    #[must_use]
    pub fn new(merger: Arc<Merger>, channel: Arc<dyn PushChannel>, user: UserId, config: SyncConfig) -> Self {
        Self {
            merger,
            channel,
            user,
            config,
            online: Arc::new(watch::Sender::new(true)),
            current: Mutex::new(None),
        }
    }

    /// Make `scope` the active scope
    ///
    /// The previous subscription is closed and settled before the new one
    /// starts, so no event for the old scope is merged afterwards. Switching
    /// to the already active scope returns its handle unchanged.
    pub async fn switch_scope(&self, scope: &ScopeId) -> SubscriptionHandle {
        let mut current = self.current.lock().await;
        if let Some(open) = current.as_ref() {
            if open.scope() == scope {
                return open.handle();
            }
        }
        if let Some(previous) = current.take() {
            previous.close().await;
        }
        let opened = ScopeSubscription::open_with(
            scope.clone(),
            Arc::clone(&self.merger),
            Arc::clone(&self.channel),
            self.user.clone(),
            &self.config,
            Arc::clone(&self.online),
        );
        let handle = opened.handle();
        *current = Some(opened);
        handle
    }

    /// Handle of the active subscription
    pub async fn current(&self) -> Option<SubscriptionHandle> {
        self.current.lock().await.as_ref().map(ScopeSubscription::handle)
    }

    /// Close the active subscription, if any
    pub async fn close(&self) {
        if let Some(open) = self.current.lock().await.take() {
            open.close().await;
        }
    }

    /// Network availability signal shared by every subscription of this hub
    pub fn set_online(&self, online: bool) {
        self.online.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    /// Last network availability signal
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }
}
