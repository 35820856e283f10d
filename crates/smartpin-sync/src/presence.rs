//! Ephemeral presence store
//!
//! Holds what other users are doing right now: cursor position, active tool
//! and in-progress drawing previews. Fed only from broadcast events, never
//! written into the entity cache, and emptied whenever the channel degrades.

use crate::backend::BroadcastEvent;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use smartpin_geometry::NormalizedPoint;
use smartpin_model::UserId;
use std::time::Duration;

/// Last known activity of one remote user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    /// User
    pub user: UserId,
    /// Time of the most recent broadcast from this user
    pub last_seen: DateTime<Utc>,
    /// Cursor position, if the user has moved it
    pub cursor: Option<NormalizedPoint>,
    /// Tool the user announced
    pub tool: Option<String>,
}

impl PresenceRecord {
    fn new(user: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user,
            last_seen: now,
            cursor: None,
            tool: None,
        }
    }
}

/// Per-scope presence of remote users
#[derive(Debug)]
pub struct PresenceStore {
    users: DashMap<UserId, PresenceRecord>,
    previews: DashMap<UserId, Vec<NormalizedPoint>>,
    ttl: Duration,
}

impl PresenceStore {
    /// Create empty store whose records expire after `ttl` of silence
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            users: DashMap::new(),
            previews: DashMap::new(),
            ttl,
        }
    }

    /// Record a broadcast event received now
    pub fn apply(&self, event: &BroadcastEvent) {
        self.apply_at(event, Utc::now());
    }

    /// Record a broadcast event received at `now`
    pub fn apply_at(&self, event: &BroadcastEvent, now: DateTime<Utc>) {
        let user = event.user().clone();
        if let BroadcastEvent::Leave { .. } = event {
            self.users.remove(&user);
            self.previews.remove(&user);
            return;
        }

        let mut record = self
            .users
            .entry(user.clone())
            .or_insert_with(|| PresenceRecord::new(user.clone(), now));
        record.last_seen = record.last_seen.max(now);

        match event {
            BroadcastEvent::Cursor { at, tool, .. } => {
                record.cursor = Some(*at);
                if tool.is_some() {
                    record.tool.clone_from(tool);
                }
            }
            BroadcastEvent::Presence { tool, .. } => record.tool.clone_from(tool),
            BroadcastEvent::DrawingPreview { points, .. } => {
                drop(record);
                if points.is_empty() {
                    self.previews.remove(&user);
                } else {
                    self.previews.insert(user, points.clone());
                }
            }
            BroadcastEvent::Leave { .. } => {}
        }
    }

    /// Drop users silent for longer than the expiry, as of now
    pub fn prune(&self) -> usize {
        self.prune_at(Utc::now())
    }

    /// Drop users silent for longer than the expiry, as of `now`
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<UserId> = self
            .users
            .iter()
            .filter(|r| {
                now.signed_duration_since(r.last_seen)
                    .to_std()
                    .is_ok_and(|age| age > self.ttl)
            })
            .map(|r| r.key().clone())
            .collect();
        for user in &expired {
            self.users.remove(user);
            self.previews.remove(user);
        }
        expired.len()
    }

    /// Presence of one user
    #[must_use]
    pub fn get(&self, user: &UserId) -> Option<PresenceRecord> {
        self.users.get(user).map(|r| r.clone())
    }

    /// All present users, ordered by id
    #[must_use]
    pub fn users(&self) -> Vec<PresenceRecord> {
        let mut all: Vec<PresenceRecord> = self.users.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| a.user.cmp(&b.user));
        all
    }

    /// Drawing preview of one user
    #[must_use]
    pub fn preview(&self, user: &UserId) -> Option<Vec<NormalizedPoint>> {
        self.previews.get(user).map(|p| p.clone())
    }

    /// Number of present users
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether nobody is present
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Forget everyone
    pub fn clear(&self) {
        self.users.clear();
        self.previews.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn cursor(user: &str, x: f64) -> BroadcastEvent {
        BroadcastEvent::Cursor {
            user: UserId::new(user),
            at: NormalizedPoint::new(x, 0.5),
            tool: None,
        }
    }

    #[test]
    fn cursor_keeps_announced_tool() {
        let store = PresenceStore::new(Duration::from_secs(30));
        store.apply(&BroadcastEvent::Presence {
            user: UserId::new("ana"),
            tool: Some("pin".into()),
        });
        store.apply(&cursor("ana", 0.25));

        let record = store.get(&UserId::new("ana")).expect("present");
        assert_eq!(record.cursor, Some(NormalizedPoint::new(0.25, 0.5)));
        assert_eq!(record.tool.as_deref(), Some("pin"));
    }

    #[test]
    fn leave_removes_user_and_preview() {
        let store = PresenceStore::new(Duration::from_secs(30));
        let ana = UserId::new("ana");
        store.apply(&BroadcastEvent::DrawingPreview {
            user: ana.clone(),
            points: vec![NormalizedPoint::new(0.1, 0.1), NormalizedPoint::new(0.2, 0.2)],
        });
        assert_eq!(store.preview(&ana).map(|p| p.len()), Some(2));

        store.apply(&BroadcastEvent::Leave { user: ana.clone() });
        assert!(store.is_empty());
        assert_eq!(store.preview(&ana), None);
    }

    #[test]
    fn silent_users_expire() {
        let store = PresenceStore::new(Duration::from_secs(30));
        let start = Utc::now();
        store.apply_at(&cursor("ana", 0.1), start);
        store.apply_at(&cursor("ben", 0.2), start + TimeDelta::seconds(20));

        assert_eq!(store.prune_at(start + TimeDelta::seconds(31)), 1);
        let left: Vec<String> = store.users().into_iter().map(|r| r.user.to_string()).collect();
        assert_eq!(left, vec!["ben".to_string()]);
    }

    #[test]
    fn out_of_order_timestamps_do_not_rewind() {
        let store = PresenceStore::new(Duration::from_secs(30));
        let now = Utc::now();
        store.apply_at(&cursor("ana", 0.1), now);
        store.apply_at(&cursor("ana", 0.2), now - TimeDelta::seconds(10));
        assert_eq!(store.get(&UserId::new("ana")).map(|r| r.last_seen), Some(now));
    }
}
