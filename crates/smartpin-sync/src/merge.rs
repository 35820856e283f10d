//! Merge of remote records into the entity cache
//!
//! Shared by the realtime pump and the mutation pipeline. Every merge runs
//! inside one cache update, so the pending check and the write are atomic
//! with respect to optimistic mutations. Rules:
//! - events for an identity with a pending local mutation are parked in the ledger
//! - records older than the cached revision are ignored
//! - records for a remote id deleted earlier in the session are ignored
//! - child records that arrive before their marker wait for it, unless the
//!   marker was deleted
//! - rollups of every affected marker are recomputed in the same step

use crate::ledger::PendingLedger;
use parking_lot::Mutex;
use smartpin_cache::{EntityCache, Patch, ScopeSnapshot};
use smartpin_model::{
    ChangeEvent, ChildRecord, Entity, EntityRef, Layer, LocalId, MarkerRecord, Record, RecordKey, RemoteId,
    ScopeId, ScopeRecords,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Result of merging one remote event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Snapshot changed
    Applied,
    /// Already reflected in the snapshot
    Unchanged,
    /// Older than the cached version, or for a deleted identity
    Stale,
    /// Parked behind a pending local mutation
    Parked,
    /// Child whose marker is not known yet; kept until the marker arrives
    Orphaned,
}

#[derive(Debug, Default)]
struct ScopeMergeState {
    orphans: HashMap<RemoteId, Vec<ChangeEvent>>,
    tombstones: HashSet<RemoteId>,
}

/// Revision-guarded merge of remote state into the cache
#[derive(Debug)]
pub struct Merger {
    cache: Arc<EntityCache>,
    ledger: Arc<PendingLedger>,
    scopes: Mutex<HashMap<ScopeId, ScopeMergeState>>,
}

impl Merger {
    /// Create merger over a cache and ledger
    #[must_use]
    pub fn new(cache: Arc<EntityCache>, ledger: Arc<PendingLedger>) -> Self {
        Self {
            cache,
            ledger,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Cache written to
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// Ledger consulted before every write
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<PendingLedger> {
        &self.ledger
    }

    /// Merge one inbound change event
    pub fn ingest(&self, scope: &ScopeId, event: &ChangeEvent) -> MergeOutcome {
        let mut outcome = MergeOutcome::Unchanged;
        self.cache.update(scope, |snapshot| {
            outcome = self.merge_into(scope, snapshot, event);
            outcome == MergeOutcome::Applied
        });
        trace!(scope = %scope, key = ?event.key(), ?outcome, "Merged remote event");
        outcome
    }

    /// Replace the scope with freshly fetched records, keeping pending local state
    ///
    /// Identities with pending mutations keep their cached version; if the
    /// cache no longer holds one (a pending delete) it stays absent.
    pub fn resync(&self, scope: &ScopeId, records: ScopeRecords) -> bool {
        let counts = (records.markers.len(), records.children.len(), records.layers.len());
        let changed = self.cache.update(scope, |snapshot| {
            self.scopes.lock().remove(scope);
            let fresh = self.rebuild(snapshot, records);
            if *snapshot == fresh {
                false
            } else {
                *snapshot = fresh;
                true
            }
        });
        debug!(
            scope = %scope,
            markers = counts.0,
            children = counts.1,
            layers = counts.2,
            changed,
            "Resynced scope"
        );
        changed
    }

    /// Remember a remote id as deleted so late echoes cannot resurrect it
    pub(crate) fn tombstone(&self, scope: &ScopeId, remote: RemoteId) {
        let mut scopes = self.scopes.lock();
        let state = scopes.entry(scope.clone()).or_default();
        state.orphans.remove(&remote);
        state.tombstones.insert(remote);
    }

    /// Merge inside an already running cache update
    pub(crate) fn merge_into(&self, scope: &ScopeId, snapshot: &mut ScopeSnapshot, event: &ChangeEvent) -> MergeOutcome {
        let keys = event_keys(snapshot, event);
        if self.ledger.park(&keys, event) {
            return MergeOutcome::Parked;
        }

        match event {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => {
                self.merge_record(scope, snapshot, record, event)
            }
            ChangeEvent::Delete { key } => self.merge_delete(scope, snapshot, key),
        }
    }

    fn merge_record(
        &self,
        scope: &ScopeId,
        snapshot: &mut ScopeSnapshot,
        record: &Record,
        event: &ChangeEvent,
    ) -> MergeOutcome {
        if let RecordKey::Marker(id) | RecordKey::Child(id) = record.key() {
            if self.is_tombstoned(scope, &id) {
                return MergeOutcome::Stale;
            }
        }

        let outcome = match record {
            Record::Marker(m) => merge_marker(snapshot, m),
            Record::Child(c) => match merge_child(snapshot, c) {
                Some(outcome) => outcome,
                None if self.is_tombstoned(scope, &c.marker) => return MergeOutcome::Stale,
                None => {
                    self.scopes
                        .lock()
                        .entry(scope.clone())
                        .or_default()
                        .orphans
                        .entry(c.marker.clone())
                        .or_default()
                        .push(event.clone());
                    return MergeOutcome::Orphaned;
                }
            },
            Record::Layer(l) => merge_layer(snapshot, l),
        };

        if let Record::Marker(m) = record {
            if outcome != MergeOutcome::Stale && self.adopt_orphans(scope, snapshot, &m.id) {
                return MergeOutcome::Applied;
            }
        }
        outcome
    }

    fn merge_delete(&self, scope: &ScopeId, snapshot: &mut ScopeSnapshot, key: &RecordKey) -> MergeOutcome {
        let changed = match key {
            RecordKey::Marker(remote) => {
                self.tombstone(scope, remote.clone());
                match snapshot.resolve(remote) {
                    Some(local) => {
                        let children: Vec<RemoteId> = snapshot
                            .children_of(&local)
                            .filter_map(|c| c.id.remote.clone())
                            .collect();
                        for child in children {
                            self.tombstone(scope, child);
                        }
                        snapshot.apply(&Patch::Delete(EntityRef::Marker(local)))
                    }
                    None => false,
                }
            }
            RecordKey::Child(remote) => {
                self.tombstone(scope, remote.clone());
                match snapshot.resolve(remote) {
                    Some(local) => {
                        let parent = snapshot.child(&local).map(|c| c.marker);
                        let removed = snapshot.apply(&Patch::Delete(EntityRef::Child(local)));
                        removed | snapshot.refresh_rollups(parent)
                    }
                    None => false,
                }
            }
            RecordKey::Layer(id) => snapshot.apply(&Patch::Delete(EntityRef::Layer(id.clone()))),
        };
        if changed {
            MergeOutcome::Applied
        } else {
            MergeOutcome::Unchanged
        }
    }

    fn adopt_orphans(&self, scope: &ScopeId, snapshot: &mut ScopeSnapshot, marker: &RemoteId) -> bool {
        let waiting = self
            .scopes
            .lock()
            .get_mut(scope)
            .and_then(|s| s.orphans.remove(marker))
            .unwrap_or_default();
        waiting.iter().fold(false, |changed, event| {
            (self.merge_into(scope, snapshot, event) == MergeOutcome::Applied) | changed
        })
    }

    fn is_tombstoned(&self, scope: &ScopeId, remote: &RemoteId) -> bool {
        self.scopes
            .lock()
            .get(scope)
            .is_some_and(|s| s.tombstones.contains(remote))
    }

    fn rebuild(&self, current: &ScopeSnapshot, records: ScopeRecords) -> ScopeSnapshot {
        let replaced = self.ledger.replaced_remotes();
        let local_of = |remote: &RemoteId, client_ref: Option<LocalId>| {
            current
                .resolve(remote)
                .or_else(|| replaced.get(remote).copied())
                .or(client_ref)
                .unwrap_or_else(LocalId::new)
        };

        let mut fresh = ScopeSnapshot::new();
        for layer in records.layers {
            fresh.apply(&Patch::Insert(Entity::Layer(layer)));
        }
        for m in records.markers {
            let local = local_of(&m.id, m.client_ref);
            fresh.apply(&Patch::Insert(Entity::Marker(m.into_marker(local))));
        }
        for c in records.children {
            let Some(parent) = fresh.resolve(&c.marker) else {
                continue;
            };
            let local = local_of(&c.id, c.client_ref);
            fresh.apply(&Patch::Insert(Entity::Child(c.into_child(local, parent))));
        }

        for key in self.ledger.pending_keys() {
            match current.entity(&key) {
                Some(entity) => fresh.apply(&Patch::Insert(entity)),
                None => fresh.apply(&Patch::Delete(key)),
            };
        }
        fresh.prune_orphans();
        fresh.refresh_all_rollups();
        fresh
    }
}

/// Local key for a remote record: known alias, then the echoed placeholder, then fresh
pub(crate) fn local_for(snapshot: &ScopeSnapshot, remote: &RemoteId, client_ref: Option<LocalId>) -> LocalId {
    snapshot
        .resolve(remote)
        .or(client_ref)
        .unwrap_or_else(LocalId::new)
}

/// Cache keys an event would write
fn event_keys(snapshot: &ScopeSnapshot, event: &ChangeEvent) -> Vec<EntityRef> {
    let known = |remote: &RemoteId, client_ref: Option<LocalId>| {
        let mut locals: Vec<LocalId> = snapshot.resolve(remote).into_iter().collect();
        if let Some(c) = client_ref {
            if !locals.contains(&c) {
                locals.push(c);
            }
        }
        locals
    };
    match event {
        ChangeEvent::Insert { record } | ChangeEvent::Update { record } => match record {
            Record::Marker(m) => known(&m.id, m.client_ref).into_iter().map(EntityRef::Marker).collect(),
            Record::Child(c) => known(&c.id, c.client_ref).into_iter().map(EntityRef::Child).collect(),
            Record::Layer(_) => Vec::new(),
        },
        ChangeEvent::Delete { key } => match key {
            RecordKey::Marker(remote) => snapshot
                .resolve(remote)
                .map(|local| {
                    std::iter::once(EntityRef::Marker(local))
                        .chain(snapshot.children_of(&local).map(|c| EntityRef::Child(c.id.local)))
                        .collect()
                })
                .unwrap_or_default(),
            RecordKey::Child(remote) => snapshot.resolve(remote).map(EntityRef::Child).into_iter().collect(),
            RecordKey::Layer(_) => Vec::new(),
        },
    }
}

fn merge_marker(snapshot: &mut ScopeSnapshot, record: &MarkerRecord) -> MergeOutcome {
    let local = local_for(snapshot, &record.id, record.client_ref);
    if snapshot.marker(&local).is_some_and(|m| m.revision > record.revision) {
        return MergeOutcome::Stale;
    }
    let mut marker = record.clone().into_marker(local);
    marker.rollup = snapshot.rollup_for(&local);
    outcome(snapshot.apply(&Patch::Insert(Entity::Marker(marker))))
}

/// `None` when the parent marker is unknown
fn merge_child(snapshot: &mut ScopeSnapshot, record: &ChildRecord) -> Option<MergeOutcome> {
    let parent = snapshot.resolve(&record.marker)?;
    let local = local_for(snapshot, &record.id, record.client_ref);
    if snapshot.child(&local).is_some_and(|c| c.revision > record.revision) {
        return Some(MergeOutcome::Stale);
    }
    let child = record.clone().into_child(local, parent);
    let changed = snapshot.apply(&Patch::Insert(Entity::Child(child)));
    Some(outcome(changed | snapshot.refresh_rollups([parent])))
}

fn merge_layer(snapshot: &mut ScopeSnapshot, layer: &Layer) -> MergeOutcome {
    if snapshot.layer(&layer.id).is_some_and(|l| l.revision > layer.revision) {
        return MergeOutcome::Stale;
    }
    outcome(snapshot.apply(&Patch::Insert(Entity::Layer(layer.clone()))))
}

fn outcome(changed: bool) -> MergeOutcome {
    if changed {
        MergeOutcome::Applied
    } else {
        MergeOutcome::Unchanged
    }
}
