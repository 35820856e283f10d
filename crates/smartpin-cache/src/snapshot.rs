//! Immutable-structure snapshot of one collaboration scope
//!
//! Backed by persistent maps so cloning a snapshot for an observer is cheap
//! and two snapshots can be compared for exact equality.

use crate::patch::Patch;
use im::OrdMap;
use smartpin_geometry::{NormalizedPoint, NormalizedRect};
use smartpin_model::{
    recompute, ChildIssue, Entity, EntityRef, Layer, LayerId, LocalId, Marker, RemoteId, Rollup, Severity, Status,
};

/// Attribute filter for [`ScopeSnapshot::search`]; unset fields match any marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerFilter {
    /// Marker status
    pub status: Option<Status>,
    /// Marker severity
    pub severity: Option<Severity>,
    /// Layer the marker sits on
    pub layer: Option<LayerId>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl MarkerFilter {
    /// Filter matching every marker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only markers in `status`
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Only markers of `severity`
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Only markers on `layer`
    #[must_use]
    pub fn with_layer(mut self, layer: impl Into<LayerId>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    /// At most `limit` results
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `marker` passes every set criterion
    #[must_use]
    pub fn matches(&self, marker: &Marker) -> bool {
        self.status.map_or(true, |s| marker.status == s)
            && self.severity.map_or(true, |s| marker.severity == s)
            && self.layer.as_ref().map_or(true, |l| marker.layer == *l)
    }
}

/// Latest known entities of one scope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeSnapshot {
    markers: OrdMap<LocalId, Marker>,
    children: OrdMap<LocalId, ChildIssue>,
    layers: OrdMap<LayerId, Layer>,
    aliases: OrdMap<RemoteId, LocalId>,
}

impl ScopeSnapshot {
    /// Empty snapshot
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one patch, returning whether anything changed
    pub fn apply(&mut self, patch: &Patch) -> bool {
        match patch {
            Patch::Insert(entity) => self.upsert(entity.clone()),
            Patch::Update(entity) | Patch::Promote(entity) => {
                if self.contains(&entity.key()) {
                    self.upsert(entity.clone())
                } else {
                    false
                }
            }
            Patch::Delete(key) => self.remove(key),
            Patch::SetRollup { marker, rollup } => match self.markers.get(marker) {
                Some(current) if current.rollup != *rollup => {
                    let mut updated = current.clone();
                    updated.rollup = *rollup;
                    self.markers.insert(*marker, updated);
                    true
                }
                _ => false,
            },
        }
    }

    /// Apply patches in order, returning whether anything changed
    pub fn apply_all<'a>(&mut self, patches: impl IntoIterator<Item = &'a Patch>) -> bool {
        patches
            .into_iter()
            .fold(false, |changed, patch| self.apply(patch) | changed)
    }

    /// Marker by local key
    #[inline]
    #[must_use]
    pub fn marker(&self, id: &LocalId) -> Option<&Marker> {
        self.markers.get(id)
    }

    /// Child issue by local key
    #[inline]
    #[must_use]
    pub fn child(&self, id: &LocalId) -> Option<&ChildIssue> {
        self.children.get(id)
    }

    /// Layer by id
    #[inline]
    #[must_use]
    pub fn layer(&self, id: &LayerId) -> Option<&Layer> {
        self.layers.get(id)
    }

    /// Entity at `key`, cloned
    #[must_use]
    pub fn entity(&self, key: &EntityRef) -> Option<Entity> {
        match key {
            EntityRef::Marker(id) => self.marker(id).cloned().map(Entity::Marker),
            EntityRef::Child(id) => self.child(id).cloned().map(Entity::Child),
            EntityRef::Layer(id) => self.layer(id).cloned().map(Entity::Layer),
        }
    }

    /// Whether an entity exists at `key`
    #[must_use]
    pub fn contains(&self, key: &EntityRef) -> bool {
        match key {
            EntityRef::Marker(id) => self.markers.contains_key(id),
            EntityRef::Child(id) => self.children.contains_key(id),
            EntityRef::Layer(id) => self.layers.contains_key(id),
        }
    }

    /// Local key registered for a remote identity
    #[inline]
    #[must_use]
    pub fn resolve(&self, remote: &RemoteId) -> Option<LocalId> {
        self.aliases.get(remote).copied()
    }

    /// All markers in local-key order
    pub fn markers(&self) -> impl Iterator<Item = &Marker> {
        self.markers.values()
    }

    /// All child issues in local-key order
    pub fn children(&self) -> impl Iterator<Item = &ChildIssue> {
        self.children.values()
    }

    /// All layers
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.layers.values()
    }

    /// Children owned by `marker`
    pub fn children_of<'a>(&'a self, marker: &'a LocalId) -> impl Iterator<Item = &'a ChildIssue> + 'a {
        self.children.values().filter(move |c| c.marker == *marker)
    }

    /// Number of markers
    #[inline]
    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Number of child issues
    #[inline]
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Next free marker sequence number
    #[must_use]
    pub fn next_marker_seq(&self) -> u32 {
        self.markers.values().map(|m| m.seq).max().unwrap_or(0) + 1
    }

    /// Rollup recomputed from the marker's current children
    #[must_use]
    pub fn rollup_for(&self, marker: &LocalId) -> Rollup {
        recompute(self.children_of(marker))
    }

    /// `SetRollup` patches for the given markers whose stored rollup is stale
    #[must_use]
    pub fn rollup_patches(&self, markers: impl IntoIterator<Item = LocalId>) -> Vec<Patch> {
        markers
            .into_iter()
            .filter_map(|id| {
                let marker = self.markers.get(&id)?;
                let rollup = self.rollup_for(&id);
                (marker.rollup != rollup).then_some(Patch::SetRollup { marker: id, rollup })
            })
            .collect()
    }

    /// Recompute and store rollups for the given markers
    pub fn refresh_rollups(&mut self, markers: impl IntoIterator<Item = LocalId>) -> bool {
        let patches = self.rollup_patches(markers);
        self.apply_all(&patches)
    }

    /// Recompute and store every marker's rollup
    pub fn refresh_all_rollups(&mut self) -> bool {
        let ids: Vec<LocalId> = self.markers.keys().copied().collect();
        self.refresh_rollups(ids)
    }

    /// Drop child issues whose marker is not present
    pub fn prune_orphans(&mut self) -> bool {
        let orphans: Vec<LocalId> = self
            .children
            .values()
            .filter(|c| !self.markers.contains_key(&c.marker))
            .map(|c| c.id.local)
            .collect();
        orphans
            .into_iter()
            .fold(false, |changed, id| self.remove(&EntityRef::Child(id)) | changed)
    }

    /// Whether a marker's layer takes part in hit-testing and rendering
    ///
    /// Markers on a layer this snapshot does not know are treated as visible.
    #[must_use]
    pub fn is_marker_visible(&self, marker: &Marker) -> bool {
        self.layers.get(&marker.layer).map_or(true, |l| l.visible)
    }

    /// Visible markers inside `area`, for viewport culling
    #[must_use]
    pub fn markers_in(&self, area: &NormalizedRect) -> Vec<&Marker> {
        self.markers
            .values()
            .filter(|m| area.contains(&m.position) && self.is_marker_visible(m))
            .collect()
    }

    /// Topmost visible marker within an elliptical tolerance of `point`
    ///
    /// Ties on layer order resolve to the nearest marker.
    #[must_use]
    pub fn hit_test(&self, point: NormalizedPoint, tolerance_x: f64, tolerance_y: f64) -> Option<&Marker> {
        if tolerance_x <= 0.0 || tolerance_y <= 0.0 {
            return None;
        }
        self.markers
            .values()
            .filter(|m| self.is_marker_visible(m))
            .filter_map(|m| {
                let dx = (m.position.x - point.x) / tolerance_x;
                let dy = (m.position.y - point.y) / tolerance_y;
                let d = dx * dx + dy * dy;
                (d <= 1.0).then_some((m, d))
            })
            .max_by(|(a, da), (b, db)| {
                self.layer_order(a)
                    .cmp(&self.layer_order(b))
                    .then(db.total_cmp(da))
            })
            .map(|(m, _)| m)
    }

    /// Markers within `radius` of `point`, nearest first, regardless of layer
    #[must_use]
    pub fn markers_near(&self, point: NormalizedPoint, radius: f64) -> Vec<&Marker> {
        let mut near: Vec<(&Marker, f64)> = self
            .markers
            .values()
            .map(|m| (m, m.position.distance(&point)))
            .filter(|(_, d)| *d <= radius)
            .collect();
        near.sort_by(|(_, a), (_, b)| a.total_cmp(b));
        near.into_iter().map(|(m, _)| m).collect()
    }

    /// Markers matching `filter` in sequence order, regardless of layer visibility
    #[must_use]
    pub fn search(&self, filter: &MarkerFilter) -> Vec<&Marker> {
        let mut found: Vec<&Marker> = self.markers.values().filter(|m| filter.matches(m)).collect();
        found.sort_by_key(|m| m.seq);
        if let Some(limit) = filter.limit {
            found.truncate(limit);
        }
        found
    }

    fn layer_order(&self, marker: &Marker) -> i32 {
        self.layers.get(&marker.layer).map_or(0, |l| l.order)
    }

    fn upsert(&mut self, entity: Entity) -> bool {
        match entity {
            Entity::Marker(marker) => {
                let local = marker.id.local;
                if self.markers.get(&local) == Some(&marker) {
                    return false;
                }
                let old = self.markers.get(&local).and_then(|m| m.id.remote.clone());
                self.unalias(old.as_ref(), marker.id.remote.as_ref());
                if let Some(remote) = &marker.id.remote {
                    self.aliases.insert(remote.clone(), local);
                }
                self.markers.insert(local, marker);
                true
            }
            Entity::Child(child) => {
                let local = child.id.local;
                if self.children.get(&local) == Some(&child) {
                    return false;
                }
                let old = self.children.get(&local).and_then(|c| c.id.remote.clone());
                self.unalias(old.as_ref(), child.id.remote.as_ref());
                if let Some(remote) = &child.id.remote {
                    self.aliases.insert(remote.clone(), local);
                }
                self.children.insert(local, child);
                true
            }
            Entity::Layer(layer) => {
                if self.layers.get(&layer.id) == Some(&layer) {
                    return false;
                }
                self.layers.insert(layer.id.clone(), layer);
                true
            }
        }
    }

    fn remove(&mut self, key: &EntityRef) -> bool {
        match key {
            EntityRef::Marker(id) => {
                let Some(marker) = self.markers.remove(id) else {
                    return false;
                };
                self.unalias(marker.id.remote.as_ref(), None);
                let orphans: Vec<LocalId> = self.children_of(id).map(|c| c.id.local).collect();
                for child in orphans {
                    self.remove(&EntityRef::Child(child));
                }
                true
            }
            EntityRef::Child(id) => match self.children.remove(id) {
                Some(child) => {
                    self.unalias(child.id.remote.as_ref(), None);
                    true
                }
                None => false,
            },
            EntityRef::Layer(id) => self.layers.remove(id).is_some(),
        }
    }

    fn unalias(&mut self, old: Option<&RemoteId>, keep: Option<&RemoteId>) {
        if let Some(old) = old {
            if Some(old) != keep {
                self.aliases.remove(old);
            }
        }
    }
}
