//! In-memory backend and push channel
//!
//! [`MemoryServer`] holds the authoritative rows of every scope, assigns
//! identities, sequence numbers, child codes and revisions, and fans change
//! events out to every subscriber of the scope, including the client that
//! wrote them. [`MemoryClient`] is one client's connection to it and
//! implements both backend contracts, with knobs for injecting faults.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use smartpin_model::{
    validate_transition, ChangeEvent, ChildCode, ChildRecord, Layer, LayerId, MarkerRecord, PhotoKind, Record,
    RecordKey, RemoteId, ScopeId, ScopeRecords, Status,
};
use smartpin_sync::{
    BroadcastEvent, ChannelError, ChannelMessage, ChannelStatus, CommitAck, CommitBackend, CommitFailure, CommitOp,
    CommitRequest, PushChannel,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Default)]
struct ScopeRows {
    markers: BTreeMap<RemoteId, MarkerRecord>,
    children: BTreeMap<RemoteId, ChildRecord>,
    layers: BTreeMap<LayerId, Layer>,
    next_seq: u32,
}

impl ScopeRows {
    fn records(&self) -> ScopeRecords {
        ScopeRecords {
            markers: self.markers.values().cloned().collect(),
            children: self.children.values().cloned().collect(),
            layers: self.layers.values().cloned().collect(),
        }
    }

    fn writable(&self, layer: &LayerId) -> Result<(), CommitFailure> {
        match self.layers.get(layer) {
            Some(l) if l.locked => Err(CommitFailure::new(format!("layer {layer} is locked"))),
            Some(_) => Ok(()),
            None => Err(CommitFailure::new(format!("layer {layer} does not exist"))),
        }
    }

    fn marker_layer(&self, id: &RemoteId) -> Result<LayerId, CommitFailure> {
        self.markers
            .get(id)
            .map(|m| m.layer.clone())
            .ok_or_else(|| missing("marker", id))
    }

    fn apply(
        &mut self,
        next_id: &mut u64,
        scope: &ScopeId,
        request: CommitRequest,
    ) -> Result<(CommitAck, Vec<ChangeEvent>), CommitFailure> {
        let now = Utc::now();
        let client_ref = Some(request.client_ref);
        match request.op {
            CommitOp::CreateMarker {
                layer,
                position,
                severity,
            } => {
                self.writable(&layer)?;
                if !position.is_in_unit_square() {
                    return Err(CommitFailure::new("position outside the image"));
                }
                self.next_seq += 1;
                *next_id += 1;
                let record = MarkerRecord {
                    id: RemoteId::new(format!("m-{next_id}")),
                    client_ref,
                    scope: scope.clone(),
                    layer,
                    position,
                    status: Status::Open,
                    severity,
                    seq: self.next_seq,
                    next_child_index: 0,
                    created_at: now,
                    last_activity_at: now,
                    revision: 1,
                };
                self.markers.insert(record.id.clone(), record.clone());
                Ok(stored(Record::Marker(record), Vec::new()))
            }
            CommitOp::CreateChild {
                marker,
                severity,
                photos,
            } => {
                let layer = self.marker_layer(&marker)?;
                self.writable(&layer)?;
                let parent = self.markers.get_mut(&marker).ok_or_else(|| missing("marker", &marker))?;
                parent.next_child_index += 1;
                parent.revision += 1;
                parent.last_activity_at = now;
                let code = ChildCode::new(parent.seq, parent.next_child_index);
                let parent_event = ChangeEvent::Update {
                    record: Record::Marker(parent.clone()),
                };

                *next_id += 1;
                let record = ChildRecord {
                    id: RemoteId::new(format!("c-{next_id}")),
                    client_ref,
                    marker,
                    code,
                    status: Status::Open,
                    severity,
                    photos,
                    opened_at: now,
                    closed_at: None,
                    revision: 1,
                };
                self.children.insert(record.id.clone(), record.clone());
                Ok(stored(Record::Child(record), vec![parent_event]))
            }
            CommitOp::UpdateMarker { id, changes } => {
                let layer = self.marker_layer(&id)?;
                self.writable(&layer)?;
                if let Some(target) = &changes.layer {
                    self.writable(target)?;
                }
                if changes.position.is_some_and(|p| !p.is_in_unit_square()) {
                    return Err(CommitFailure::new("position outside the image"));
                }
                let marker = self.markers.get_mut(&id).ok_or_else(|| missing("marker", &id))?;
                if let Some(position) = changes.position {
                    marker.position = position;
                }
                if let Some(severity) = changes.severity {
                    marker.severity = severity;
                }
                if let Some(target) = changes.layer {
                    marker.layer = target;
                }
                marker.revision += 1;
                marker.last_activity_at = now;
                Ok(updated(Record::Marker(marker.clone())))
            }
            CommitOp::UpdateChild { id, changes } => {
                let parent = self.children.get(&id).ok_or_else(|| missing("child issue", &id))?.marker.clone();
                if let Ok(layer) = self.marker_layer(&parent) {
                    self.writable(&layer)?;
                }
                let child = self.children.get_mut(&id).ok_or_else(|| missing("child issue", &id))?;
                if let Some(severity) = changes.severity {
                    child.severity = severity;
                }
                child.photos.extend(changes.add_photos);
                child.revision += 1;
                Ok(updated(Record::Child(child.clone())))
            }
            CommitOp::Transition {
                key: RecordKey::Marker(id),
                to,
            } => {
                let layer = self.marker_layer(&id)?;
                self.writable(&layer)?;
                let marker = self.markers.get_mut(&id).ok_or_else(|| missing("marker", &id))?;
                validate_transition(marker.status, to).map_err(|e| CommitFailure::new(e.to_string()))?;
                marker.status = to;
                marker.revision += 1;
                marker.last_activity_at = now;
                Ok(updated(Record::Marker(marker.clone())))
            }
            CommitOp::Transition {
                key: RecordKey::Child(id),
                to,
            } => {
                let child = self.children.get_mut(&id).ok_or_else(|| missing("child issue", &id))?;
                validate_transition(child.status, to).map_err(|e| CommitFailure::new(e.to_string()))?;
                if to == Status::Closed && !child.photos.iter().any(|p| p.kind == PhotoKind::Closure) {
                    return Err(CommitFailure::new("closure photo required"));
                }
                child.status = to;
                child.closed_at = match to {
                    Status::Closed => Some(child.closed_at.unwrap_or(now)),
                    _ => None,
                };
                child.revision += 1;
                Ok(updated(Record::Child(child.clone())))
            }
            CommitOp::Transition {
                key: RecordKey::Layer(id),
                ..
            } => Err(CommitFailure::new(format!("layer {id} has no status"))),
            CommitOp::Delete {
                key: RecordKey::Marker(id),
            } => {
                let mut events = Vec::new();
                if let Some(marker) = self.markers.get(&id) {
                    self.writable(&marker.layer.clone())?;
                    let children: Vec<RemoteId> = self
                        .children
                        .values()
                        .filter(|c| c.marker == id)
                        .map(|c| c.id.clone())
                        .collect();
                    for child in children {
                        self.children.remove(&child);
                        events.push(ChangeEvent::Delete {
                            key: RecordKey::Child(child),
                        });
                    }
                    self.markers.remove(&id);
                    events.push(ChangeEvent::Delete {
                        key: RecordKey::Marker(id.clone()),
                    });
                }
                Ok((CommitAck::Deleted(RecordKey::Marker(id)), events))
            }
            CommitOp::Delete {
                key: RecordKey::Child(id),
            } => {
                let mut events = Vec::new();
                if self.children.remove(&id).is_some() {
                    events.push(ChangeEvent::Delete {
                        key: RecordKey::Child(id.clone()),
                    });
                }
                Ok((CommitAck::Deleted(RecordKey::Child(id)), events))
            }
            CommitOp::Delete {
                key: RecordKey::Layer(id),
            } => Err(CommitFailure::new(format!("layer {id} is managed by administrators"))),
        }
    }
}

fn missing(what: &str, id: &RemoteId) -> CommitFailure {
    CommitFailure::new(format!("{what} {id} not found"))
}

fn stored(record: Record, mut follow_up: Vec<ChangeEvent>) -> (CommitAck, Vec<ChangeEvent>) {
    follow_up.insert(0, ChangeEvent::Insert { record: record.clone() });
    (CommitAck::Stored(record), follow_up)
}

fn updated(record: Record) -> (CommitAck, Vec<ChangeEvent>) {
    (
        CommitAck::Stored(record.clone()),
        vec![ChangeEvent::Update { record }],
    )
}

#[derive(Debug)]
struct Subscriber {
    client: u64,
    scope: ScopeId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
}

#[derive(Debug, Default)]
struct ServerState {
    scopes: HashMap<ScopeId, ScopeRows>,
    next_id: u64,
    subscribers: Vec<Subscriber>,
    duplicate_to: HashSet<u64>,
}

impl ServerState {
    fn fan_out(&mut self, scope: &ScopeId, messages: &[ChannelMessage]) {
        self.subscribers.retain(|s| !s.tx.is_closed());
        for sub in self.subscribers.iter().filter(|s| &s.scope == scope) {
            let copies = if self.duplicate_to.contains(&sub.client) { 2 } else { 1 };
            for _ in 0..copies {
                for message in messages {
                    // A receiver dropped mid-loop is pruned on the next fan-out
                    let _ = sub.tx.send(message.clone());
                }
            }
        }
    }

    fn cut(&mut self, keep: impl Fn(&Subscriber) -> bool) {
        let (kept, cut): (Vec<_>, Vec<_>) = self.subscribers.drain(..).partition(|s| keep(s));
        for sub in cut {
            let _ = sub.tx.send(ChannelMessage::Status(ChannelStatus::Disconnected));
        }
        self.subscribers = kept;
    }
}

/// Authoritative store shared by every [`MemoryClient`]
#[derive(Debug, Default)]
pub struct MemoryServer {
    state: Mutex<ServerState>,
    next_client: AtomicU64,
    commits: AtomicUsize,
}

impl MemoryServer {
    /// Create empty server
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// New client connection
    #[must_use]
    pub fn connect(self: &Arc<Self>) -> MemoryClient {
        MemoryClient {
            id: self.next_client.fetch_add(1, Ordering::Relaxed),
            server: Arc::clone(self),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Insert or replace a layer, notifying subscribers
    pub fn put_layer(&self, scope: &ScopeId, mut layer: Layer) {
        let mut state = self.state.lock();
        let rows = state.scopes.entry(scope.clone()).or_default();
        let existed = match rows.layers.get(&layer.id) {
            Some(previous) => {
                layer.revision = previous.revision + 1;
                true
            }
            None => {
                layer.revision = layer.revision.max(1);
                false
            }
        };
        rows.layers.insert(layer.id.clone(), layer.clone());
        let record = Record::Layer(layer);
        let event = if existed {
            ChangeEvent::Update { record }
        } else {
            ChangeEvent::Insert { record }
        };
        state.fan_out(scope, &[ChannelMessage::Change(event)]);
    }

    /// Full contents of a scope
    #[must_use]
    pub fn records(&self, scope: &ScopeId) -> ScopeRecords {
        self.state
            .lock()
            .scopes
            .get(scope)
            .map(ScopeRows::records)
            .unwrap_or_default()
    }

    /// Commit on behalf of a user with no client of its own
    pub fn commit_direct(&self, scope: &ScopeId, request: CommitRequest) -> Result<CommitAck, CommitFailure> {
        let mut acks = self.commit_all(scope, vec![request])?;
        acks.pop().ok_or_else(|| CommitFailure::new("empty acknowledgement"))
    }

    /// Successful commit operations so far
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::Relaxed)
    }

    /// Live subscriptions to a scope
    #[must_use]
    pub fn subscriber_count(&self, scope: &ScopeId) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.iter().filter(|s| &s.scope == scope).count()
    }

    /// Cut every subscription to a scope
    pub fn disconnect_scope(&self, scope: &ScopeId) {
        self.state.lock().cut(|s| &s.scope != scope);
    }

    /// Apply every request or none, then notify subscribers
    fn commit_all(&self, scope: &ScopeId, requests: Vec<CommitRequest>) -> Result<Vec<CommitAck>, CommitFailure> {
        let mut state = self.state.lock();
        let ServerState { scopes, next_id, .. } = &mut *state;
        let rows = scopes.entry(scope.clone()).or_default();

        let mut scratch = rows.clone();
        let mut ids = *next_id;
        let mut acks = Vec::with_capacity(requests.len());
        let mut messages = Vec::new();
        for request in requests {
            let (ack, events) = scratch.apply(&mut ids, scope, request)?;
            acks.push(ack);
            messages.extend(events.into_iter().map(ChannelMessage::Change));
        }
        *rows = scratch;
        *next_id = ids;

        self.commits.fetch_add(1, Ordering::Relaxed);
        state.fan_out(scope, &messages);
        Ok(acks)
    }

    fn attach(&self, client: u64, scope: &ScopeId) -> mpsc::UnboundedReceiver<ChannelMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().subscribers.push(Subscriber {
            client,
            scope: scope.clone(),
            tx,
        });
        rx
    }

    fn broadcast(&self, scope: &ScopeId, event: BroadcastEvent) {
        self.state.lock().fan_out(scope, &[ChannelMessage::Broadcast(event)]);
    }

    fn cut_client(&self, client: u64) {
        self.state.lock().cut(|s| s.client != client);
    }

    fn set_duplicate(&self, client: u64, on: bool) {
        let mut state = self.state.lock();
        if on {
            state.duplicate_to.insert(client);
        } else {
            state.duplicate_to.remove(&client);
        }
    }
}

#[derive(Debug)]
struct Faults {
    gate: watch::Sender<bool>,
    reject_queue: Mutex<VecDeque<String>>,
    reject_all: AtomicBool,
    channel_up: AtomicBool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            gate: watch::Sender::new(true),
            reject_queue: Mutex::new(VecDeque::new()),
            reject_all: AtomicBool::new(false),
            channel_up: AtomicBool::new(true),
        }
    }
}

/// One client's connection to a [`MemoryServer`]
#[derive(Debug, Clone)]
pub struct MemoryClient {
    id: u64,
    server: Arc<MemoryServer>,
    faults: Arc<Faults>,
}

impl MemoryClient {
    /// Connection id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server this client talks to
    #[must_use]
    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    /// Refuse the next commit with `reason`
    pub fn reject_next(&self, reason: impl Into<String>) {
        self.faults.reject_queue.lock().push_back(reason.into());
    }

    /// Refuse every commit until turned off
    pub fn reject_all(&self, on: bool) {
        self.faults.reject_all.store(on, Ordering::SeqCst);
    }

    /// Hold commits in flight until [`Self::release_commits`]
    pub fn hold_commits(&self) {
        self.faults.gate.send_replace(false);
    }

    /// Let held commits through
    pub fn release_commits(&self) {
        self.faults.gate.send_replace(true);
    }

    /// Cut this client's subscriptions; it may resubscribe immediately
    pub fn disconnect(&self) {
        self.server.cut_client(self.id);
    }

    /// Take the channel down (cutting subscriptions) or bring it back
    pub fn set_channel_available(&self, up: bool) {
        self.faults.channel_up.store(up, Ordering::SeqCst);
        if !up {
            self.disconnect();
        }
    }

    /// Deliver every change and broadcast to this client twice
    pub fn duplicate_delivery(&self, on: bool) {
        self.server.set_duplicate(self.id, on);
    }

    async fn admit(&self) -> Result<(), CommitFailure> {
        let mut gate = self.faults.gate.subscribe();
        // The sender lives as long as `self`
        let _ = gate.wait_for(|open| *open).await;
        if let Some(reason) = self.faults.reject_queue.lock().pop_front() {
            return Err(CommitFailure::new(reason));
        }
        if self.faults.reject_all.load(Ordering::SeqCst) {
            return Err(CommitFailure::new("rejected by server"));
        }
        Ok(())
    }

    fn ensure_up(&self) -> Result<(), ChannelError> {
        if self.faults.channel_up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChannelError::Unavailable("network unreachable".into()))
        }
    }
}

#[async_trait]
impl CommitBackend for MemoryClient {
    async fn commit(&self, scope: &ScopeId, request: CommitRequest) -> Result<CommitAck, CommitFailure> {
        self.admit().await?;
        let mut acks = self.server.commit_all(scope, vec![request])?;
        acks.pop().ok_or_else(|| CommitFailure::new("empty acknowledgement"))
    }

    async fn commit_batch(
        &self,
        scope: &ScopeId,
        requests: Vec<CommitRequest>,
    ) -> Result<Vec<CommitAck>, CommitFailure> {
        self.admit().await?;
        self.server.commit_all(scope, requests)
    }
}

#[async_trait]
impl PushChannel for MemoryClient {
    async fn fetch_scope(&self, scope: &ScopeId) -> Result<ScopeRecords, ChannelError> {
        self.ensure_up()?;
        Ok(self.server.records(scope))
    }

    async fn subscribe(&self, scope: &ScopeId) -> Result<BoxStream<'static, ChannelMessage>, ChannelError> {
        self.ensure_up()?;
        let rx = self.server.attach(self.id, scope);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed())
    }

    async fn publish(&self, scope: &ScopeId, event: BroadcastEvent) -> Result<(), ChannelError> {
        self.ensure_up()?;
        self.server.broadcast(scope, event);
        Ok(())
    }
}
