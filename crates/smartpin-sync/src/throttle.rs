//! Outbound cursor throttle
//!
//! Cursor moves are written into a single slot; a flusher task publishes
//! the slot's latest value at most once per interval. Intermediate
//! positions are overwritten, so a burst of moves costs one broadcast.

use crate::backend::{BroadcastEvent, PushChannel};
use crate::error::SyncError;
use crate::realtime::ChannelState;
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{ScopeId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CursorSample {
    at: NormalizedPoint,
    tool: Option<String>,
}

/// Throttled publisher of the local user's cursor
#[derive(Debug, Clone)]
pub struct CursorPublisher {
    slot: Arc<watch::Sender<Option<CursorSample>>>,
    state: watch::Receiver<ChannelState>,
}

impl CursorPublisher {
    /// Queue a cursor position for broadcast
    ///
    /// # Errors
    /// `ChannelDegraded` while the subscription is not live
    pub fn move_to(&self, at: NormalizedPoint, tool: Option<String>) -> Result<(), SyncError> {
        if *self.state.borrow() != ChannelState::Live {
            return Err(SyncError::ChannelDegraded);
        }
        self.slot.send_replace(Some(CursorSample { at, tool }));
        Ok(())
    }
}

/// Everything the flusher needs to publish
pub(crate) struct Flusher {
    pub(crate) channel: Arc<dyn PushChannel>,
    pub(crate) scope: ScopeId,
    pub(crate) user: UserId,
    pub(crate) interval: Duration,
    pub(crate) state: watch::Receiver<ChannelState>,
}

impl Flusher {
    /// Start the flusher and return the publisher feeding it
    pub(crate) fn spawn(self) -> (CursorPublisher, JoinHandle<()>) {
        let (slot, mut latest) = watch::channel(None);
        let publisher = CursorPublisher {
            slot: Arc::new(slot),
            state: self.state.clone(),
        };
        let handle = tokio::spawn(async move {
            while latest.changed().await.is_ok() {
                let sample = latest.borrow_and_update().clone();
                if let Some(CursorSample { at, tool }) = sample {
                    if *self.state.borrow() == ChannelState::Live {
                        let event = BroadcastEvent::Cursor {
                            user: self.user.clone(),
                            at,
                            tool,
                        };
                        if let Err(err) = self.channel.publish(&self.scope, event).await {
                            debug!(scope = %self.scope, %err, "Cursor broadcast dropped");
                        }
                    }
                }
                tokio::time::sleep(self.interval).await;
            }
        });
        (publisher, handle)
    }
}
