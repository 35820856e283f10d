//! Optimistic mutation pipeline
//!
//! `mutate` validates an intent against the current snapshot, applies the
//! optimistic patch and takes lane tickets in one cache step, then hands the
//! remote commit to a background task. The task:
//! 1. waits for earlier mutations on the same identities
//! 2. resolves local keys to remote ids
//! 3. commits under the configured deadline
//! 4. promotes placeholders to authoritative versions, or rolls back
//! 5. replays remote events that were parked while it was pending

use crate::backend::{ClosureEvidence, CommitAck, CommitBackend, CommitOp, CommitRequest};
use crate::config::SyncConfig;
use crate::error::{CommitFailure, SyncError, ValidationFailure};
use crate::intent::{Actor, BatchItem, ChildChanges, ChildDraft, Draft, Edit, Intent, MarkerChanges, MarkerDraft, Target};
use crate::lanes::{LaneTable, LaneTicket};
use crate::ledger::{PendingLedger, Resolution, Touched};
use crate::merge::{MergeOutcome, Merger};
use crate::state::{validate_transition, MutationId, MutationState};
use chrono::Utc;
use smartpin_cache::{EntityCache, Patch, ScopeSnapshot};
use smartpin_geometry::NormalizedPoint;
use smartpin_model::{
    ChildCode, ChildIssue, Entity, EntityId, EntityRef, LayerId, LocalId, Marker, PhotoRef, Record, RecordKey,
    RemoteId, ScopeId, Severity, Status,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Result of a resolved mutation
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
    /// Mutation
    pub id: MutationId,
    /// Final state
    pub state: MutationState,
    /// Authoritative acks, in request order
    pub acks: Vec<CommitAck>,
}

/// Handle to a mutation whose optimistic patch is already applied
///
/// Dropping the handle does not cancel the commit.
#[derive(Debug)]
pub struct PendingMutation {
    id: MutationId,
    target: Option<EntityRef>,
    handle: JoinHandle<Result<MutationOutcome, SyncError>>,
}

impl PendingMutation {
    /// Mutation id
    #[inline]
    #[must_use]
    pub fn id(&self) -> MutationId {
        self.id
    }

    /// Entity of the first intent
    #[inline]
    #[must_use]
    pub fn target(&self) -> Option<&EntityRef> {
        self.target.as_ref()
    }

    /// Local key of the entity of the first intent
    #[inline]
    #[must_use]
    pub fn local_id(&self) -> Option<LocalId> {
        self.target.as_ref().and_then(EntityRef::local)
    }

    /// Wait for the commit to resolve
    pub async fn outcome(self) -> Result<MutationOutcome, SyncError> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(SyncError::CommitRejected {
                reason: format!("commit task ended abnormally: {err}"),
            }),
        }
    }
}

/// Remote operation with local references, resolved after the lane wait
#[derive(Debug, Clone)]
enum PlannedOp {
    CreateMarker {
        local: LocalId,
        layer: LayerId,
        position: NormalizedPoint,
        severity: Severity,
    },
    CreateChild {
        local: LocalId,
        marker: LocalId,
        severity: Severity,
        photos: Vec<PhotoRef>,
    },
    UpdateMarker {
        id: LocalId,
        changes: MarkerChanges,
    },
    UpdateChild {
        id: LocalId,
        changes: ChildChanges,
    },
    Transition {
        target: Target,
        to: Status,
    },
    Delete(Target),
}

impl PlannedOp {
    fn key(&self) -> EntityRef {
        match self {
            PlannedOp::CreateMarker { local, .. } | PlannedOp::UpdateMarker { id: local, .. } => EntityRef::Marker(*local),
            PlannedOp::CreateChild { local, .. } | PlannedOp::UpdateChild { id: local, .. } => EntityRef::Child(*local),
            PlannedOp::Transition { target, .. } | PlannedOp::Delete(target) => target.key(),
        }
    }
}

/// Validated effect of one intent
struct Plan {
    patches: Vec<Patch>,
    keys: Vec<EntityRef>,
    rollups: Vec<LocalId>,
    op: PlannedOp,
}

/// Effect of a whole submission, already applied to the snapshot
struct Staged {
    touched: Vec<Touched>,
    ops: Vec<PlannedOp>,
    target: Option<EntityRef>,
    changed: bool,
}

struct Inner {
    cache: Arc<EntityCache>,
    merger: Arc<Merger>,
    backend: Arc<dyn CommitBackend>,
    evidence: Arc<dyn ClosureEvidence>,
    lanes: LaneTable,
    config: SyncConfig,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Optimistic mutation pipeline for all scopes of one client
#[derive(Clone)]
pub struct MutationPipeline {
    inner: Arc<Inner>,
}

impl fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight())
            .field("lanes", &self.inner.lanes.active())
            .finish_non_exhaustive()
    }
}

impl MutationPipeline {
    /// Create pipeline writing through `merger`'s cache and ledger
    #[must_use]
    pub fn new(
        merger: Arc<Merger>,
        backend: Arc<dyn CommitBackend>,
        evidence: Arc<dyn ClosureEvidence>,
        config: SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache: Arc::clone(merger.cache()),
                merger,
                backend,
                evidence,
                lanes: LaneTable::new(),
                config,
                next_id: AtomicU64::new(1),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Apply `intent` optimistically and commit it in the background
    ///
    /// Returns a validation error without touching the cache if a
    /// precondition fails. Must be called within a Tokio runtime.
    pub fn mutate(&self, scope: &ScopeId, actor: &Actor, intent: Intent) -> Result<PendingMutation, SyncError> {
        self.submit(scope, actor, vec![intent], false)
    }

    /// Apply several field or status changes and commit them as one operation
    ///
    /// If the backend refuses any item, every item is rolled back together.
    pub fn mutate_batch(
        &self,
        scope: &ScopeId,
        actor: &Actor,
        items: Vec<BatchItem>,
    ) -> Result<PendingMutation, SyncError> {
        if items.is_empty() {
            return Err(ValidationFailure::EmptyBatch.into());
        }
        self.submit(scope, actor, items.into_iter().map(Intent::from).collect(), true)
    }

    /// Cache written to
    #[inline]
    #[must_use]
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.inner.cache
    }

    /// Shared ledger of pending mutations
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<PendingLedger> {
        self.inner.merger.ledger()
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Mutations whose commit has not resolved
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until no mutation is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn submit(
        &self,
        scope: &ScopeId,
        actor: &Actor,
        intents: Vec<Intent>,
        batch: bool,
    ) -> Result<PendingMutation, SyncError> {
        let inner = &self.inner;
        let id = MutationId(inner.next_id.fetch_add(1, Ordering::Relaxed));
        let kind = intents.first().map_or("empty", Intent::kind);

        let mut staged: Result<(Staged, LaneTicket), ValidationFailure> = Err(ValidationFailure::EmptyBatch);
        inner.cache.update(scope, |snapshot| match inner.stage(scope, snapshot, actor, &intents) {
            Ok(s) => {
                let keys: Vec<EntityRef> = s.touched.iter().map(|t| t.key.clone()).collect();
                inner.merger.ledger().register(id, s.touched.clone());
                let ticket = inner.lanes.enqueue(&keys);
                let changed = s.changed;
                staged = Ok((s, ticket));
                changed
            }
            Err(failure) => {
                staged = Err(failure);
                false
            }
        });

        let (staged, ticket) = staged.map_err(|failure| {
            debug!(scope = %scope, kind, %failure, "Mutation rejected by validation");
            SyncError::from(failure)
        })?;
        debug!(scope = %scope, mutation = %id, kind, items = staged.ops.len(), "Applied optimistic patch");

        inner.in_flight.fetch_add(1, Ordering::AcqRel);
        let task = Arc::clone(inner);
        let scope = scope.clone();
        let ops = staged.ops;
        let handle = tokio::spawn(async move {
            let result = task.run(&scope, id, ops, ticket, batch).await;
            task.in_flight.fetch_sub(1, Ordering::AcqRel);
            task.idle.notify_waiters();
            result
        });

        Ok(PendingMutation {
            id,
            target: staged.target,
            handle,
        })
    }
}

impl Inner {
    async fn run(
        &self,
        scope: &ScopeId,
        id: MutationId,
        ops: Vec<PlannedOp>,
        mut ticket: LaneTicket,
        batch: bool,
    ) -> Result<MutationOutcome, SyncError> {
        let mut state = MutationState::Pending;
        ticket.ready().await;

        let requests = match self.resolve_requests(scope, id, &ops) {
            Ok(requests) => requests,
            Err(reason) => {
                advance(&mut state, MutationState::RolledBack, id);
                warn!(scope = %scope, mutation = %id, %reason, "Rolling back unresolvable mutation");
                self.roll_back(scope, id);
                return Err(SyncError::CommitRejected { reason });
            }
        };

        let deadline = self.config.commit_timeout();
        let result = tokio::time::timeout(deadline, self.send(scope, requests, batch)).await;

        let outcome = match result {
            Ok(Ok(acks)) => {
                advance(&mut state, MutationState::Committed, id);
                self.settle_commit(scope, id, &ops, &acks);
                debug!(scope = %scope, mutation = %id, "Mutation committed");
                Ok(MutationOutcome { id, state, acks })
            }
            Ok(Err(failure)) => {
                advance(&mut state, MutationState::RolledBack, id);
                warn!(scope = %scope, mutation = %id, reason = %failure, "Commit rejected, rolling back");
                self.roll_back(scope, id);
                Err(SyncError::from(failure))
            }
            Err(_) => {
                advance(&mut state, MutationState::RolledBack, id);
                warn!(scope = %scope, mutation = %id, after_ms = self.config.commit_timeout_ms, "Commit timed out, rolling back");
                self.roll_back(scope, id);
                Err(SyncError::NetworkTimeout {
                    after_ms: self.config.commit_timeout_ms,
                })
            }
        };
        drop(ticket);
        outcome
    }

    async fn send(
        &self,
        scope: &ScopeId,
        mut requests: Vec<CommitRequest>,
        batch: bool,
    ) -> Result<Vec<CommitAck>, CommitFailure> {
        if batch {
            let expected = requests.len();
            let acks = self.backend.commit_batch(scope, requests).await?;
            if acks.len() != expected {
                return Err(CommitFailure::new(format!(
                    "batch returned {} acks for {expected} requests",
                    acks.len()
                )));
            }
            Ok(acks)
        } else {
            match requests.pop() {
                Some(request) => Ok(vec![self.backend.commit(scope, request).await?]),
                None => Ok(Vec::new()),
            }
        }
    }

    // ---- staging -------------------------------------------------------

    fn stage(
        &self,
        scope: &ScopeId,
        snapshot: &mut ScopeSnapshot,
        actor: &Actor,
        intents: &[Intent],
    ) -> Result<Staged, ValidationFailure> {
        if intents.is_empty() {
            return Err(ValidationFailure::EmptyBatch);
        }
        let mut scratch = snapshot.clone();
        let mut priors: Vec<(EntityRef, Option<Entity>)> = Vec::new();
        let mut ops = Vec::with_capacity(intents.len());
        let mut changed = false;

        for intent in intents {
            let plan = self.plan(scope, &scratch, actor, intent)?;
            for key in &plan.keys {
                if !priors.iter().any(|(k, _)| k == key) {
                    priors.push((key.clone(), snapshot.entity(key)));
                }
            }
            changed |= scratch.apply_all(&plan.patches);
            changed |= scratch.refresh_rollups(plan.rollups);
            ops.push(plan.op);
        }

        let touched = priors
            .into_iter()
            .map(|(key, prior)| Touched {
                produced: scratch.entity(&key),
                key,
                prior,
            })
            .collect();
        let target = ops.first().map(PlannedOp::key);
        *snapshot = scratch;
        Ok(Staged {
            touched,
            ops,
            target,
            changed,
        })
    }

    fn plan(
        &self,
        scope: &ScopeId,
        snapshot: &ScopeSnapshot,
        actor: &Actor,
        intent: &Intent,
    ) -> Result<Plan, ValidationFailure> {
        match intent {
            Intent::Create(Draft::Marker(draft)) => plan_create_marker(scope, snapshot, actor, draft),
            Intent::Create(Draft::Child(draft)) => plan_create_child(snapshot, actor, draft),
            Intent::Update(Edit::Marker { id, changes }) => plan_update_marker(snapshot, actor, *id, changes),
            Intent::Update(Edit::Child { id, changes }) => plan_update_child(snapshot, actor, *id, changes),
            Intent::Delete(Target::Marker(id)) => plan_delete_marker(snapshot, actor, *id),
            Intent::Delete(Target::Child(id)) => plan_delete_child(snapshot, actor, *id),
            Intent::StatusTransition {
                target: Target::Marker(id),
                to,
            } => plan_marker_transition(snapshot, actor, *id, *to),
            Intent::StatusTransition {
                target: Target::Child(id),
                to,
            } => self.plan_child_transition(snapshot, actor, *id, *to),
        }
    }

    fn plan_child_transition(
        &self,
        snapshot: &ScopeSnapshot,
        actor: &Actor,
        id: LocalId,
        to: Status,
    ) -> Result<Plan, ValidationFailure> {
        let child = snapshot.child(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
        gate_parent(snapshot, actor, &child.marker)?;
        check_transition(child.status, to)?;
        if to == Status::Closed && !self.evidence.has_closure_photo(child) {
            return Err(ValidationFailure::MissingClosurePhoto(id));
        }
        let mut updated = child.clone();
        updated.set_status(to, Utc::now());
        Ok(Plan {
            patches: vec![Patch::Update(Entity::Child(updated))],
            keys: vec![EntityRef::Child(id)],
            rollups: vec![child.marker],
            op: PlannedOp::Transition {
                target: Target::Child(id),
                to,
            },
        })
    }

    // ---- commit resolution ----------------------------------------------

    fn resolve_requests(&self, scope: &ScopeId, id: MutationId, ops: &[PlannedOp]) -> Result<Vec<CommitRequest>, String> {
        let snapshot = self.cache.get(scope);
        ops.iter()
            .map(|op| -> Result<CommitRequest, String> {
                let op_remote = match op {
                    PlannedOp::CreateMarker {
                        layer,
                        position,
                        severity,
                        ..
                    } => CommitOp::CreateMarker {
                        layer: layer.clone(),
                        position: *position,
                        severity: *severity,
                    },
                    PlannedOp::CreateChild {
                        marker,
                        severity,
                        photos,
                        ..
                    } => CommitOp::CreateChild {
                        marker: self.remote_of(&snapshot, id, &EntityRef::Marker(*marker))?,
                        severity: *severity,
                        photos: photos.clone(),
                    },
                    PlannedOp::UpdateMarker { id: local, changes } => CommitOp::UpdateMarker {
                        id: self.remote_of(&snapshot, id, &EntityRef::Marker(*local))?,
                        changes: changes.clone(),
                    },
                    PlannedOp::UpdateChild { id: local, changes } => CommitOp::UpdateChild {
                        id: self.remote_of(&snapshot, id, &EntityRef::Child(*local))?,
                        changes: changes.clone(),
                    },
                    PlannedOp::Transition { target, to } => CommitOp::Transition {
                        key: self.record_key(&snapshot, id, target)?,
                        to: *to,
                    },
                    PlannedOp::Delete(target) => CommitOp::Delete {
                        key: self.record_key(&snapshot, id, target)?,
                    },
                };
                let client_ref = op.key().local().unwrap_or_default();
                Ok(CommitRequest {
                    client_ref,
                    op: op_remote,
                })
            })
            .collect()
    }

    /// Remote id from the cache, or from the version this mutation replaced
    fn remote_of(&self, snapshot: &ScopeSnapshot, id: MutationId, key: &EntityRef) -> Result<RemoteId, String> {
        let remote = |e: &Entity| e.entity_id().and_then(|i| i.remote.clone());
        snapshot
            .entity(key)
            .as_ref()
            .and_then(remote)
            .or_else(|| self.merger.ledger().prior(id, key).as_ref().and_then(remote))
            .ok_or_else(|| match key {
                EntityRef::Marker(l) => format!("marker {l} has no server identity"),
                EntityRef::Child(l) => format!("child issue {l} has no server identity"),
                EntityRef::Layer(l) => format!("layer {l} is not addressable"),
            })
    }

    fn record_key(&self, snapshot: &ScopeSnapshot, id: MutationId, target: &Target) -> Result<RecordKey, String> {
        let remote = self.remote_of(snapshot, id, &target.key())?;
        Ok(match target {
            Target::Marker(_) => RecordKey::Marker(remote),
            Target::Child(_) => RecordKey::Child(remote),
        })
    }

    // ---- settlement -----------------------------------------------------

    fn settle_commit(&self, scope: &ScopeId, id: MutationId, ops: &[PlannedOp], acks: &[CommitAck]) {
        let ledger = self.merger.ledger();
        self.cache.update(scope, |snapshot| {
            let mut confirmed: HashMap<EntityRef, Option<Entity>> = HashMap::new();
            for (op, ack) in ops.iter().zip(acks) {
                let key = op.key();
                match ack {
                    CommitAck::Stored(record) => {
                        if let Some(entity) = authoritative(snapshot, &key, record) {
                            confirmed.insert(key, Some(entity));
                        }
                    }
                    CommitAck::Deleted(record_key) => {
                        if let RecordKey::Marker(remote) | RecordKey::Child(remote) = record_key {
                            self.merger.tombstone(scope, remote.clone());
                        }
                        if let EntityRef::Marker(marker) = key {
                            for child in ledger_children(ledger, snapshot, id, marker) {
                                confirmed.insert(child, None);
                            }
                        }
                        confirmed.insert(key, None);
                    }
                }
            }

            let settlement = ledger.settle(id, &Resolution::Committed(&confirmed));
            let mut owners = Vec::new();
            let mut changed = false;

            for (key, _) in &settlement.last {
                match confirmed.get(key) {
                    Some(Some(entity)) => {
                        owners.extend(owner(snapshot, key, Some(entity)));
                        if let Some(patch) = accept(snapshot, entity) {
                            changed |= snapshot.apply(&patch);
                        }
                    }
                    Some(None) => changed |= snapshot.apply(&Patch::Delete(key.clone())),
                    // Not covered by an ack; the server's own change event will follow
                    None => {}
                }
            }
            for key in &settlement.superseded {
                if let Some(Some(entity)) = confirmed.get(key) {
                    changed |= promote_identity(snapshot, key, entity);
                }
            }
            for event in &settlement.replay {
                changed |= self.merger.merge_into(scope, snapshot, event) == MergeOutcome::Applied;
            }
            changed |= snapshot.refresh_rollups(owners);
            changed
        });
    }

    fn roll_back(&self, scope: &ScopeId, id: MutationId) {
        self.cache.update(scope, |snapshot| {
            let mut settlement = self.merger.ledger().settle(id, &Resolution::RolledBack);
            // Markers first so restored children find their parent
            settlement
                .last
                .sort_by_key(|(key, _)| !matches!(key, EntityRef::Marker(_)));

            let mut owners = Vec::new();
            let mut changed = false;
            for (key, prior) in settlement.last {
                if let Some(Entity::Child(child)) = &prior {
                    if snapshot.marker(&child.marker).is_none() {
                        continue;
                    }
                }
                owners.extend(owner(snapshot, &key, prior.as_ref()));
                changed |= snapshot.apply(&Patch::restore(key, prior));
            }
            for event in &settlement.replay {
                changed |= self.merger.merge_into(scope, snapshot, event) == MergeOutcome::Applied;
            }
            changed |= snapshot.refresh_rollups(owners);
            changed
        });
    }
}

fn advance(state: &mut MutationState, to: MutationState, id: MutationId) {
    match validate_transition(*state, to) {
        Ok(()) => *state = to,
        Err(err) => error!(mutation = %id, %err, "Mutation lifecycle violated"),
    }
}

/// Cache form of an acked record under the mutation's local key
fn authoritative(snapshot: &ScopeSnapshot, key: &EntityRef, record: &Record) -> Option<Entity> {
    let local = key.local()?;
    match record {
        Record::Marker(m) => {
            let mut marker = m.clone().into_marker(local);
            marker.rollup = snapshot.rollup_for(&local);
            Some(Entity::Marker(marker))
        }
        Record::Child(c) => {
            let parent = snapshot
                .resolve(&c.marker)
                .or_else(|| snapshot.child(&local).map(|x| x.marker))?;
            Some(Entity::Child(c.clone().into_child(local, parent)))
        }
        Record::Layer(_) => None,
    }
}

/// Patch installing an authoritative version; `None` if the entity is gone or newer
fn accept(snapshot: &ScopeSnapshot, entity: &Entity) -> Option<Patch> {
    let current = snapshot.entity(&entity.key())?;
    if current.revision() > entity.revision() {
        return None;
    }
    if current.entity_id().is_some_and(EntityId::is_placeholder) {
        Some(Patch::Promote(entity.clone()))
    } else {
        Some(Patch::Update(entity.clone()))
    }
}

/// Give the cached optimistic version the server identity without touching its fields
fn promote_identity(snapshot: &mut ScopeSnapshot, key: &EntityRef, confirmed: &Entity) -> bool {
    let Some(remote) = confirmed.entity_id().and_then(|i| i.remote.clone()) else {
        return false;
    };
    let revision = confirmed.revision();
    let promoted = match snapshot.entity(key) {
        Some(Entity::Marker(mut m)) => {
            m.id = m.id.promoted(remote);
            m.revision = m.revision.max(revision);
            Entity::Marker(m)
        }
        Some(Entity::Child(mut c)) => {
            c.id = c.id.promoted(remote);
            c.revision = c.revision.max(revision);
            Entity::Child(c)
        }
        Some(Entity::Layer(_)) | None => return false,
    };
    snapshot.apply(&Patch::Promote(promoted))
}

/// Marker whose rollup depends on `key`
fn owner(snapshot: &ScopeSnapshot, key: &EntityRef, hint: Option<&Entity>) -> Option<LocalId> {
    match key {
        EntityRef::Marker(id) => Some(*id),
        EntityRef::Child(id) => snapshot.child(id).map(|c| c.marker).or(match hint {
            Some(Entity::Child(c)) => Some(c.marker),
            _ => None,
        }),
        EntityRef::Layer(_) => None,
    }
}

/// Child keys this mutation recorded under `marker`
fn ledger_children(ledger: &PendingLedger, snapshot: &ScopeSnapshot, id: MutationId, marker: LocalId) -> Vec<EntityRef> {
    ledger
        .pending_keys()
        .into_iter()
        .filter(|key| match (key, ledger.prior(id, key)) {
            (EntityRef::Child(_), Some(Entity::Child(c))) => c.marker == marker,
            (EntityRef::Child(child), None) => snapshot.child(child).is_some_and(|c| c.marker == marker),
            _ => false,
        })
        .collect()
}

fn check_transition(from: Status, to: Status) -> Result<(), ValidationFailure> {
    smartpin_model::validate_transition(from, to).map_err(|_| ValidationFailure::IllegalTransition { from, to })
}

fn check_position(position: &NormalizedPoint) -> Result<(), ValidationFailure> {
    if position.is_in_unit_square() {
        Ok(())
    } else {
        Err(ValidationFailure::PositionOutOfRange {
            x: position.x,
            y: position.y,
        })
    }
}

/// Lock and role checks against a layer that must exist
fn gate_layer(snapshot: &ScopeSnapshot, actor: &Actor, layer: &LayerId) -> Result<(), ValidationFailure> {
    let found = snapshot
        .layer(layer)
        .ok_or_else(|| ValidationFailure::UnknownLayer(layer.clone()))?;
    if found.locked {
        return Err(ValidationFailure::LayerLocked(layer.clone()));
    }
    if !found.permits(&actor.role) {
        return Err(ValidationFailure::WriteNotPermitted {
            layer: layer.clone(),
            role: actor.role.clone(),
        });
    }
    Ok(())
}

/// Lock and role checks for an existing marker; layers not loaded yet are not gated
fn gate_marker(snapshot: &ScopeSnapshot, actor: &Actor, marker: &Marker) -> Result<(), ValidationFailure> {
    if snapshot.layer(&marker.layer).is_some() {
        gate_layer(snapshot, actor, &marker.layer)
    } else {
        Ok(())
    }
}

fn gate_parent(snapshot: &ScopeSnapshot, actor: &Actor, marker: &LocalId) -> Result<(), ValidationFailure> {
    match snapshot.marker(marker) {
        Some(m) => gate_marker(snapshot, actor, m),
        None => Err(ValidationFailure::UnknownMarker(*marker)),
    }
}

fn plan_create_marker(
    scope: &ScopeId,
    snapshot: &ScopeSnapshot,
    actor: &Actor,
    draft: &MarkerDraft,
) -> Result<Plan, ValidationFailure> {
    check_position(&draft.position)?;
    gate_layer(snapshot, actor, &draft.layer)?;
    let marker = Marker::new(
        EntityId::placeholder(),
        scope.clone(),
        draft.layer.clone(),
        draft.position,
        snapshot.next_marker_seq(),
    )
    .with_severity(draft.severity);
    let local = marker.id.local;
    Ok(Plan {
        patches: vec![Patch::Insert(Entity::Marker(marker))],
        keys: vec![EntityRef::Marker(local)],
        rollups: Vec::new(),
        op: PlannedOp::CreateMarker {
            local,
            layer: draft.layer.clone(),
            position: draft.position,
            severity: draft.severity,
        },
    })
}

fn plan_create_child(snapshot: &ScopeSnapshot, actor: &Actor, draft: &ChildDraft) -> Result<Plan, ValidationFailure> {
    let parent = snapshot
        .marker(&draft.marker)
        .ok_or(ValidationFailure::UnknownMarker(draft.marker))?;
    gate_marker(snapshot, actor, parent)?;

    let now = Utc::now();
    let mut bumped = parent.clone();
    bumped.next_child_index += 1;
    bumped.last_activity_at = now;

    let mut child = ChildIssue::new(
        EntityId::placeholder(),
        draft.marker,
        ChildCode::new(parent.seq, bumped.next_child_index),
    );
    child.severity = draft.severity;
    child.photos.clone_from(&draft.photos);
    child.opened_at = now;
    let local = child.id.local;

    Ok(Plan {
        patches: vec![
            Patch::Update(Entity::Marker(bumped)),
            Patch::Insert(Entity::Child(child)),
        ],
        keys: vec![EntityRef::Child(local), EntityRef::Marker(draft.marker)],
        rollups: vec![draft.marker],
        op: PlannedOp::CreateChild {
            local,
            marker: draft.marker,
            severity: draft.severity,
            photos: draft.photos.clone(),
        },
    })
}

fn plan_update_marker(
    snapshot: &ScopeSnapshot,
    actor: &Actor,
    id: LocalId,
    changes: &MarkerChanges,
) -> Result<Plan, ValidationFailure> {
    let marker = snapshot.marker(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
    gate_marker(snapshot, actor, marker)?;
    let mut updated = marker.clone();
    if let Some(position) = changes.position {
        check_position(&position)?;
        updated.position = position;
    }
    if let Some(layer) = &changes.layer {
        gate_layer(snapshot, actor, layer)?;
        updated.layer = layer.clone();
    }
    if let Some(severity) = changes.severity {
        updated.severity = severity;
    }
    updated.last_activity_at = Utc::now();
    Ok(Plan {
        patches: vec![Patch::Update(Entity::Marker(updated))],
        keys: vec![EntityRef::Marker(id)],
        rollups: Vec::new(),
        op: PlannedOp::UpdateMarker {
            id,
            changes: changes.clone(),
        },
    })
}

fn plan_update_child(
    snapshot: &ScopeSnapshot,
    actor: &Actor,
    id: LocalId,
    changes: &ChildChanges,
) -> Result<Plan, ValidationFailure> {
    let child = snapshot.child(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
    gate_parent(snapshot, actor, &child.marker)?;
    let mut updated = child.clone();
    if let Some(severity) = changes.severity {
        updated.severity = severity;
    }
    updated.photos.extend(changes.add_photos.iter().cloned());
    Ok(Plan {
        patches: vec![Patch::Update(Entity::Child(updated))],
        keys: vec![EntityRef::Child(id)],
        rollups: Vec::new(),
        op: PlannedOp::UpdateChild {
            id,
            changes: changes.clone(),
        },
    })
}

fn plan_delete_marker(snapshot: &ScopeSnapshot, actor: &Actor, id: LocalId) -> Result<Plan, ValidationFailure> {
    let marker = snapshot.marker(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
    gate_marker(snapshot, actor, marker)?;
    let keys = std::iter::once(EntityRef::Marker(id))
        .chain(snapshot.children_of(&id).map(|c| EntityRef::Child(c.id.local)))
        .collect();
    Ok(Plan {
        patches: vec![Patch::Delete(EntityRef::Marker(id))],
        keys,
        rollups: Vec::new(),
        op: PlannedOp::Delete(Target::Marker(id)),
    })
}

fn plan_delete_child(snapshot: &ScopeSnapshot, actor: &Actor, id: LocalId) -> Result<Plan, ValidationFailure> {
    let child = snapshot.child(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
    gate_parent(snapshot, actor, &child.marker)?;
    Ok(Plan {
        patches: vec![Patch::Delete(EntityRef::Child(id))],
        keys: vec![EntityRef::Child(id)],
        rollups: vec![child.marker],
        op: PlannedOp::Delete(Target::Child(id)),
    })
}

fn plan_marker_transition(
    snapshot: &ScopeSnapshot,
    actor: &Actor,
    id: LocalId,
    to: Status,
) -> Result<Plan, ValidationFailure> {
    let marker = snapshot.marker(&id).ok_or(ValidationFailure::UnknownEntity(id))?;
    gate_marker(snapshot, actor, marker)?;
    check_transition(marker.status, to)?;
    let mut updated = marker.clone();
    updated.status = to;
    updated.last_activity_at = Utc::now();
    Ok(Plan {
        patches: vec![Patch::Update(Entity::Marker(updated))],
        keys: vec![EntityRef::Marker(id)],
        rollups: Vec::new(),
        op: PlannedOp::Transition {
            target: Target::Marker(id),
            to,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AttachedPhotos;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use smartpin_model::{Layer, MarkerRecord};

    #[derive(Clone, Copy)]
    enum Mode {
        Accept,
        Reject,
        Hang,
    }

    struct Stub {
        mode: Mode,
        next: AtomicU64,
    }

    impl Stub {
        fn ack(&self, scope: &ScopeId, request: CommitRequest) -> Result<CommitAck, CommitFailure> {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            match request.op {
                CommitOp::CreateMarker {
                    layer,
                    position,
                    severity,
                } => Ok(CommitAck::Stored(Record::Marker(MarkerRecord {
                    id: RemoteId::new(format!("m-{n}")),
                    client_ref: Some(request.client_ref),
                    scope: scope.clone(),
                    layer,
                    position,
                    status: Status::Open,
                    severity,
                    seq: 40 + u32::try_from(n).unwrap(),
                    next_child_index: 0,
                    created_at: Utc::now(),
                    last_activity_at: Utc::now(),
                    revision: 1,
                }))),
                CommitOp::Delete { key } => Ok(CommitAck::Deleted(key)),
                _ => Err(CommitFailure::new("unsupported by stub")),
            }
        }
    }

    #[async_trait]
    impl CommitBackend for Stub {
        async fn commit(&self, scope: &ScopeId, request: CommitRequest) -> Result<CommitAck, CommitFailure> {
            match self.mode {
                Mode::Accept => self.ack(scope, request),
                Mode::Reject => Err(CommitFailure::new("permission denied")),
                Mode::Hang => futures::future::pending().await,
            }
        }

        async fn commit_batch(
            &self,
            scope: &ScopeId,
            requests: Vec<CommitRequest>,
        ) -> Result<Vec<CommitAck>, CommitFailure> {
            match self.mode {
                Mode::Accept => requests.into_iter().map(|r| self.ack(scope, r)).collect(),
                Mode::Reject => Err(CommitFailure::new("batch refused")),
                Mode::Hang => futures::future::pending().await,
            }
        }
    }

    struct Fixture {
        pipeline: MutationPipeline,
        scope: ScopeId,
        actor: Actor,
    }

    impl Fixture {
        fn new(mode: Mode) -> Self {
            let cache = Arc::new(EntityCache::new());
            let merger = Arc::new(Merger::new(Arc::clone(&cache), Arc::new(PendingLedger::new())));
            let pipeline = MutationPipeline::new(
                merger,
                Arc::new(Stub {
                    mode,
                    next: AtomicU64::new(1),
                }),
                Arc::new(AttachedPhotos),
                SyncConfig::default().with_commit_timeout_ms(1_000),
            );
            let scope = ScopeId::new("roof");
            cache.apply(&scope, &Patch::Insert(Entity::Layer(Layer::new("base", "Base"))));
            Self {
                pipeline,
                scope,
                actor: Actor::new("ana", "inspector"),
            }
        }

        fn snapshot(&self) -> ScopeSnapshot {
            self.pipeline.cache().get(&self.scope)
        }

        fn seed_marker(&self, seq: u32) -> LocalId {
            let mut marker = Marker::new(
                EntityId::authoritative(LocalId::new(), RemoteId::new(format!("seed-{seq}"))),
                self.scope.clone(),
                LayerId::new("base"),
                NormalizedPoint::new(0.5, 0.5),
                seq,
            );
            marker.revision = 1;
            let local = marker.id.local;
            self.pipeline
                .cache()
                .apply(&self.scope, &Patch::Insert(Entity::Marker(marker)));
            local
        }

        fn seed_child(&self, marker: LocalId) -> LocalId {
            let mut child = ChildIssue::new(
                EntityId::authoritative(LocalId::new(), RemoteId::new("seed-child")),
                marker,
                ChildCode::new(1, 1),
            );
            child.revision = 1;
            let local = child.id.local;
            self.pipeline.cache().update(&self.scope, |s| {
                s.apply(&Patch::Insert(Entity::Child(child))) | s.refresh_rollups([marker])
            });
            local
        }

        fn mutate(&self, intent: Intent) -> Result<PendingMutation, SyncError> {
            self.pipeline.mutate(&self.scope, &self.actor, intent)
        }
    }

    fn move_to(id: LocalId, x: f64) -> Intent {
        Intent::Update(Edit::Marker {
            id,
            changes: MarkerChanges {
                position: Some(NormalizedPoint::new(x, 0.5)),
                ..MarkerChanges::default()
            },
        })
    }

    #[tokio::test]
    async fn created_marker_is_promoted_in_place() {
        let fx = Fixture::new(Mode::Accept);
        let pending = fx
            .mutate(Intent::create_marker("base", NormalizedPoint::new(0.5, 0.5)))
            .unwrap();
        let local = pending.local_id().unwrap();

        let optimistic = fx.snapshot().marker(&local).cloned().unwrap();
        assert!(optimistic.id.is_placeholder());
        assert_eq!(optimistic.seq, 1);

        let outcome = pending.outcome().await.unwrap();
        assert_eq!(outcome.state, MutationState::Committed);

        let snapshot = fx.snapshot();
        let promoted = snapshot.marker(&local).unwrap();
        assert_eq!(promoted.id.remote, Some(RemoteId::new("m-1")));
        assert_eq!(promoted.seq, 41);
        assert_eq!(snapshot.marker_count(), 1);
        assert_eq!(snapshot.resolve(&RemoteId::new("m-1")), Some(local));
        assert!(fx.pipeline.ledger().is_idle());
    }

    #[tokio::test]
    async fn lanes_are_released_once_mutations_settle() {
        let fx = Fixture::new(Mode::Reject);
        let marker = fx.seed_marker(1);
        let first = fx.mutate(move_to(marker, 0.1)).unwrap();
        let second = fx.mutate(move_to(marker, 0.2)).unwrap();
        assert_eq!(fx.pipeline.inner.lanes.active(), 1);

        first.outcome().await.unwrap_err();
        second.outcome().await.unwrap_err();
        fx.pipeline.wait_idle().await;
        assert_eq!(fx.pipeline.inner.lanes.active(), 0);
        assert!(format!("{:?}", fx.pipeline).contains("lanes: 0"));
    }

    #[tokio::test]
    async fn rejected_create_restores_previous_snapshot() {
        let fx = Fixture::new(Mode::Reject);
        fx.seed_marker(1);
        let before = fx.snapshot();

        let pending = fx
            .mutate(Intent::create_marker("base", NormalizedPoint::new(0.2, 0.3)))
            .unwrap();
        assert_eq!(fx.snapshot().marker_count(), 2);

        let err = pending.outcome().await.unwrap_err();
        assert!(matches!(err, SyncError::CommitRejected { .. }));
        assert!(err.rolled_back());
        assert_eq!(fx.snapshot(), before);
    }

    #[tokio::test]
    async fn closing_without_photo_leaves_cache_untouched() {
        let fx = Fixture::new(Mode::Accept);
        let marker = fx.seed_marker(1);
        let child = fx.seed_child(marker);
        let before = fx.snapshot();

        let err = fx
            .mutate(Intent::StatusTransition {
                target: Target::Child(child),
                to: Status::Closed,
            })
            .unwrap_err();

        assert_eq!(err.validation(), Some(&ValidationFailure::MissingClosurePhoto(child)));
        assert_eq!(fx.snapshot(), before);
        assert!(fx.pipeline.ledger().is_idle());
        assert_eq!(fx.pipeline.in_flight(), 0);
    }

    #[tokio::test]
    async fn illegal_transition_is_refused() {
        let fx = Fixture::new(Mode::Accept);
        let marker = fx.seed_marker(1);
        let err = fx
            .mutate(Intent::StatusTransition {
                target: Target::Marker(marker),
                to: Status::Open,
            })
            .unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationFailure::IllegalTransition {
                from: Status::Open,
                to: Status::Open,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_commit_times_out_and_rolls_back() {
        let fx = Fixture::new(Mode::Hang);
        let marker = fx.seed_marker(1);
        let before = fx.snapshot();

        let pending = fx.mutate(move_to(marker, 0.9)).unwrap();
        assert_eq!(fx.snapshot().marker(&marker).map(|m| m.position.x), Some(0.9));

        let err = pending.outcome().await.unwrap_err();
        assert_eq!(err, SyncError::NetworkTimeout { after_ms: 1_000 });
        assert!(err.is_retryable());
        assert_eq!(fx.snapshot(), before);
    }

    #[tokio::test]
    async fn queued_edits_roll_back_to_the_original() {
        let fx = Fixture::new(Mode::Reject);
        let marker = fx.seed_marker(1);
        let before = fx.snapshot();

        let first = fx.mutate(move_to(marker, 0.1)).unwrap();
        let second = fx.mutate(move_to(marker, 0.2)).unwrap();
        assert_eq!(fx.snapshot().marker(&marker).map(|m| m.position.x), Some(0.2));

        assert!(first.outcome().await.is_err());
        assert!(second.outcome().await.is_err());
        assert_eq!(fx.snapshot(), before);
        assert!(fx.pipeline.ledger().is_idle());
    }

    #[tokio::test]
    async fn child_creation_advances_the_marker_counter() {
        let fx = Fixture::new(Mode::Hang);
        let marker = fx.seed_marker(3);

        let first = fx.mutate(Intent::create_child(marker, Vec::new())).unwrap();
        let second = fx.mutate(Intent::create_child(marker, Vec::new())).unwrap();

        let snapshot = fx.snapshot();
        let code = |p: &PendingMutation| snapshot.child(&p.local_id().unwrap()).map(|c| c.code);
        assert_eq!(code(&first), Some(ChildCode::new(3, 1)));
        assert_eq!(code(&second), Some(ChildCode::new(3, 2)));

        let parent = snapshot.marker(&marker).unwrap();
        assert_eq!(parent.next_child_index, 2);
        assert_eq!(parent.rollup.total, 2);
        assert_eq!(parent.rollup.open, 2);
    }

    #[tokio::test]
    async fn locked_layer_refuses_new_markers() {
        let fx = Fixture::new(Mode::Accept);
        let mut locked = Layer::new("plans", "Plans");
        locked.locked = true;
        fx.pipeline
            .cache()
            .apply(&fx.scope, &Patch::Insert(Entity::Layer(locked)));

        let err = fx
            .mutate(Intent::create_marker("plans", NormalizedPoint::new(0.5, 0.5)))
            .unwrap_err();
        assert_eq!(err.validation(), Some(&ValidationFailure::LayerLocked(LayerId::new("plans"))));
    }

    #[tokio::test]
    async fn role_outside_write_list_is_refused() {
        let fx = Fixture::new(Mode::Accept);
        let mut restricted = Layer::new("structural", "Structural");
        restricted.write_roles = vec![smartpin_model::Role::new("engineer")];
        fx.pipeline
            .cache()
            .apply(&fx.scope, &Patch::Insert(Entity::Layer(restricted)));

        let err = fx
            .mutate(Intent::create_marker("structural", NormalizedPoint::new(0.5, 0.5)))
            .unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(ValidationFailure::WriteNotPermitted { .. })
        ));
    }

    #[tokio::test]
    async fn position_outside_unit_square_is_refused() {
        let fx = Fixture::new(Mode::Accept);
        let err = fx
            .mutate(Intent::create_marker("base", NormalizedPoint::new(1.5, 0.5)))
            .unwrap_err();
        assert!(matches!(
            err.validation(),
            Some(ValidationFailure::PositionOutOfRange { .. })
        ));
        assert_eq!(fx.snapshot().marker_count(), 0);
    }

    #[tokio::test]
    async fn empty_batch_is_refused() {
        let fx = Fixture::new(Mode::Accept);
        let err = fx.pipeline.mutate_batch(&fx.scope, &fx.actor, Vec::new()).unwrap_err();
        assert_eq!(err.validation(), Some(&ValidationFailure::EmptyBatch));
    }

    #[tokio::test]
    async fn rejected_batch_rolls_back_every_item() {
        let fx = Fixture::new(Mode::Reject);
        let a = fx.seed_marker(1);
        let b = fx.seed_marker(2);
        let before = fx.snapshot();

        let severe = |id| {
            BatchItem::Update(Edit::Marker {
                id,
                changes: MarkerChanges {
                    severity: Some(Severity::Critical),
                    ..MarkerChanges::default()
                },
            })
        };
        let pending = fx
            .pipeline
            .mutate_batch(&fx.scope, &fx.actor, vec![severe(a), severe(b)])
            .unwrap();
        let optimistic = fx.snapshot();
        assert_eq!(optimistic.marker(&a).map(|m| m.severity), Some(Severity::Critical));
        assert_eq!(optimistic.marker(&b).map(|m| m.severity), Some(Severity::Critical));

        assert!(pending.outcome().await.is_err());
        assert_eq!(fx.snapshot(), before);
    }

    #[tokio::test]
    async fn batch_with_one_invalid_item_applies_nothing() {
        let fx = Fixture::new(Mode::Accept);
        let a = fx.seed_marker(1);
        let before = fx.snapshot();

        let err = fx
            .pipeline
            .mutate_batch(
                &fx.scope,
                &fx.actor,
                vec![
                    BatchItem::Update(Edit::Marker {
                        id: a,
                        changes: MarkerChanges {
                            severity: Some(Severity::High),
                            ..MarkerChanges::default()
                        },
                    }),
                    BatchItem::Transition {
                        target: Target::Marker(LocalId::new()),
                        to: Status::Closed,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err.validation(), Some(ValidationFailure::UnknownEntity(_))));
        assert_eq!(fx.snapshot(), before);
    }

    #[tokio::test]
    async fn committed_delete_stays_deleted() {
        let fx = Fixture::new(Mode::Accept);
        let marker = fx.seed_marker(1);
        fx.seed_child(marker);

        let pending = fx.mutate(Intent::Delete(Target::Marker(marker))).unwrap();
        assert_eq!(fx.snapshot().marker_count(), 0);
        assert_eq!(fx.snapshot().child_count(), 0);

        pending.outcome().await.unwrap();
        assert_eq!(fx.snapshot().marker_count(), 0);
        assert_eq!(fx.snapshot().child_count(), 0);
        assert!(fx.pipeline.ledger().is_idle());
    }
}
