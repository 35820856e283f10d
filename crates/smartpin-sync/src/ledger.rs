//! Pending-mutation ledger
//!
//! Tracks, per cached identity, the optimistic mutations that have not yet
//! resolved, in issuance order, together with the version each one replaced.
//! Remote events for an identity with pending mutations are parked here and
//! handed back once the last of them resolves.

use crate::state::MutationId;
use parking_lot::Mutex;
use smartpin_model::{ChangeEvent, Entity, EntityRef, LocalId, RemoteId};
use std::collections::HashMap;

/// One identity touched by a mutation
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Touched {
    /// Cache key
    pub(crate) key: EntityRef,
    /// Version before the mutation, `None` if it did not exist
    pub(crate) prior: Option<Entity>,
    /// Version the optimistic patch produced, `None` if it removed the entity
    pub(crate) produced: Option<Entity>,
}

#[derive(Debug)]
struct PendingEntry {
    mutation: MutationId,
    prior: Option<Entity>,
    produced: Option<Entity>,
}

#[derive(Debug, Default)]
struct KeyLedger {
    pending: Vec<PendingEntry>,
    buffered: Vec<ChangeEvent>,
}

/// What a resolving mutation leaves for the caller to do
#[derive(Debug, Default)]
pub(crate) struct Settlement {
    /// Keys this mutation was the last pending one on, with its prior version
    pub(crate) last: Vec<(EntityRef, Option<Entity>)>,
    /// Keys a later mutation is still pending on
    pub(crate) superseded: Vec<EntityRef>,
    /// Parked remote events released by this settlement, in arrival order
    pub(crate) replay: Vec<ChangeEvent>,
}

/// Outcome passed to [`PendingLedger::settle`]
#[derive(Debug)]
pub(crate) enum Resolution<'a> {
    /// Accepted; map holds the authoritative version per covered key
    Committed(&'a HashMap<EntityRef, Option<Entity>>),
    /// Rejected or timed out
    RolledBack,
}

/// Pending mutations and parked remote events, keyed by identity
#[derive(Debug, Default)]
pub struct PendingLedger {
    keys: Mutex<HashMap<EntityRef, KeyLedger>>,
}

impl PendingLedger {
    /// Create empty ledger
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any mutation is pending on `key`
    #[must_use]
    pub fn is_pending(&self, key: &EntityRef) -> bool {
        self.keys.lock().get(key).is_some_and(|k| !k.pending.is_empty())
    }

    /// Keys with at least one pending mutation
    #[must_use]
    pub fn pending_keys(&self) -> Vec<EntityRef> {
        self.keys
            .lock()
            .iter()
            .filter(|(_, k)| !k.pending.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether nothing is pending or parked
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Number of parked remote events
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.keys.lock().values().map(|k| k.buffered.len()).sum()
    }

    pub(crate) fn register(&self, mutation: MutationId, touched: Vec<Touched>) {
        let mut keys = self.keys.lock();
        for t in touched {
            keys.entry(t.key).or_default().pending.push(PendingEntry {
                mutation,
                prior: t.prior,
                produced: t.produced,
            });
        }
    }

    /// Park `event` under the first of `keys` that has a pending mutation
    pub(crate) fn park(&self, keys: &[EntityRef], event: &ChangeEvent) -> bool {
        let mut ledger = self.keys.lock();
        for key in keys {
            if let Some(k) = ledger.get_mut(key) {
                if !k.pending.is_empty() {
                    k.buffered.push(event.clone());
                    return true;
                }
            }
        }
        false
    }

    /// Version `mutation` recorded as replaced on `key`
    pub(crate) fn prior(&self, mutation: MutationId, key: &EntityRef) -> Option<Entity> {
        self.keys
            .lock()
            .get(key)?
            .pending
            .iter()
            .find(|e| e.mutation == mutation)?
            .prior
            .clone()
    }

    /// Server ids of the versions pending mutations replaced, with their cache keys
    ///
    /// Lets a rebuild map a row the cache no longer holds, such as one
    /// deleted optimistically, back to its local key.
    pub(crate) fn replaced_remotes(&self) -> HashMap<RemoteId, LocalId> {
        let ledger = self.keys.lock();
        let mut found = HashMap::new();
        for (key, k) in ledger.iter() {
            let Some(local) = key.local() else {
                continue;
            };
            for entry in &k.pending {
                if let Some(remote) = entry.prior.as_ref().and_then(Entity::entity_id).and_then(|i| i.remote.clone()) {
                    found.insert(remote, local);
                }
            }
        }
        found
    }

    /// Resolve `mutation` on every key it touched
    pub(crate) fn settle(&self, mutation: MutationId, resolution: &Resolution<'_>) -> Settlement {
        let mut ledger = self.keys.lock();
        let mut settlement = Settlement::default();
        let mut drained = Vec::new();

        for (key, k) in ledger.iter_mut() {
            let Some(pos) = k.pending.iter().position(|e| e.mutation == mutation) else {
                continue;
            };
            let entry = k.pending.remove(pos);
            if let Some(next) = k.pending.get_mut(pos) {
                next.prior = match resolution {
                    Resolution::Committed(confirmed) => confirmed.get(key).cloned().unwrap_or(entry.produced),
                    Resolution::RolledBack => entry.prior,
                };
                settlement.superseded.push(key.clone());
            } else {
                settlement.last.push((key.clone(), entry.prior));
            }
            if k.pending.is_empty() {
                settlement.replay.append(&mut k.buffered);
                drained.push(key.clone());
            }
        }
        for key in drained {
            ledger.remove(&key);
        }
        settlement
    }
}
