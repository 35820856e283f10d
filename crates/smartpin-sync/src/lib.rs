//! SmartPin Sync
//!
//! Keeps a client's entity cache in step with the server:
//! - [`MutationPipeline`]: optimistic apply, ordered commit, promotion or rollback
//! - [`Merger`]: revision-guarded merge of remote records, parked behind pending mutations
//! - [`RealtimeHub`] / [`ScopeSubscription`]: push-channel pump, full resync on reconnect
//! - [`PresenceStore`] and [`CursorPublisher`]: ephemeral collaboration state
//! - [`SyncClient`]: all of the above wired for one user
//!
//! # Example
//!
//! ```rust,ignore
//! let client = SyncClient::new(actor, backend, channel, SyncConfig::default());
//! let scope = ScopeId::new("roof-1");
//! client.open_scope(&scope).await;
//!
//! let pending = client.mutate(&scope, Intent::create_marker(layer, NormalizedPoint::new(0.5, 0.5)))?;
//! // The placeholder is already in the cache
//! let outcome = pending.outcome().await?;
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod intent;
mod lanes;
pub mod ledger;
pub mod merge;
pub mod pipeline;
pub mod presence;
pub mod realtime;
pub mod state;
pub mod throttle;

pub use backend::{
    AttachedPhotos, BroadcastEvent, ChannelMessage, ChannelStatus, ClosureEvidence, CommitAck, CommitBackend,
    CommitOp, CommitRequest, PushChannel,
};
pub use client::SyncClient;
pub use config::SyncConfig;
pub use error::{ChannelError, CommitFailure, SyncError, ValidationFailure};
pub use intent::{Actor, BatchItem, ChildChanges, ChildDraft, Draft, Edit, Intent, MarkerChanges, MarkerDraft, Target};
pub use ledger::PendingLedger;
pub use merge::{MergeOutcome, Merger};
pub use pipeline::{MutationOutcome, MutationPipeline, PendingMutation};
pub use presence::{PresenceRecord, PresenceStore};
pub use realtime::{ChannelState, RealtimeHub, ScopeSubscription, SubscriptionHandle};
pub use state::{MutationId, MutationState};
pub use throttle::CursorPublisher;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
