//! Testing utilities for the SmartPin workspace
//!
//! Shared fixtures, an in-memory backend and snapshot assertions.

#![allow(missing_docs)]

pub mod memory;

pub use memory::{MemoryClient, MemoryServer};

use smartpin_cache::ScopeSnapshot;
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{Layer, LocalId, PhotoRef, ScopeId};
use smartpin_sync::{Actor, Intent, SyncClient, SyncConfig};
use std::sync::Arc;
use std::time::Duration;

pub fn scope() -> ScopeId {
    ScopeId::new("roof-1")
}

pub fn base_layer() -> Layer {
    Layer::new("base", "Base")
}

pub fn inspector(user: &str) -> Actor {
    Actor::new(user, "inspector")
}

pub fn closure_photo() -> PhotoRef {
    PhotoRef::closure(format!("photo-{}", LocalId::new()))
}

pub fn marker_at(x: f64, y: f64) -> Intent {
    Intent::create_marker("base", NormalizedPoint::new(x, y))
}

/// Short timings so tests settle in milliseconds
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
        .with_commit_timeout_ms(2_000)
        .with_cursor_interval_ms(10)
        .with_presence_ttl_ms(5_000)
        .with_resync_backoff_ms(5, 40)
}

/// Server seeded with the base layer of [`scope`]
pub fn seeded_server() -> Arc<MemoryServer> {
    let server = MemoryServer::new();
    server.put_layer(&scope(), base_layer());
    server
}

/// Client for `user` plus its connection, for fault injection
pub fn client_for(server: &Arc<MemoryServer>, user: &str) -> (SyncClient, MemoryClient) {
    let connection = server.connect();
    let client = SyncClient::new(
        inspector(user),
        Arc::new(connection.clone()),
        Arc::new(connection.clone()),
        test_config(),
    );
    (client, connection)
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn assert_rollups_consistent(snapshot: &ScopeSnapshot) {
    for marker in snapshot.markers() {
        assert!(marker.rollup.is_consistent(), "inconsistent rollup on {}", marker.id);
        assert_eq!(
            marker.rollup,
            snapshot.rollup_for(&marker.id.local),
            "stale rollup on {}",
            marker.id
        );
    }
}

pub fn assert_no_placeholders(snapshot: &ScopeSnapshot) {
    for marker in snapshot.markers() {
        assert!(!marker.id.is_placeholder(), "placeholder marker {} survived", marker.id);
    }
    for child in snapshot.children() {
        assert!(!child.id.is_placeholder(), "placeholder child {} survived", child.id);
    }
}
