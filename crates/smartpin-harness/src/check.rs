//! Convergence checks between a client snapshot and the backend's rows

use smartpin_cache::ScopeSnapshot;
use smartpin_model::{ChildCode, LayerId, PhotoRef, RemoteId, ScopeRecords, Severity, Status};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

/// Comparable marker fields; timestamps and derived rollups are left out
#[derive(Debug, Clone, PartialEq)]
struct MarkerView {
    layer: LayerId,
    position: (f64, f64),
    status: Status,
    severity: Severity,
    seq: u32,
    next_child_index: u32,
    revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct ChildView {
    marker: Option<RemoteId>,
    code: ChildCode,
    status: Status,
    severity: Severity,
    photos: Vec<PhotoRef>,
    revision: u64,
}

/// Backend rows in comparable form
#[derive(Debug, Clone, Default)]
pub struct ExpectedState {
    markers: BTreeMap<RemoteId, MarkerView>,
    children: BTreeMap<RemoteId, ChildView>,
    layers: BTreeSet<LayerId>,
}

impl ExpectedState {
    /// Index the backend's rows
    #[must_use]
    pub fn from_records(records: &ScopeRecords) -> Self {
        let markers = records
            .markers
            .iter()
            .map(|m| {
                let view = MarkerView {
                    layer: m.layer.clone(),
                    position: (m.position.x, m.position.y),
                    status: m.status,
                    severity: m.severity,
                    seq: m.seq,
                    next_child_index: m.next_child_index,
                    revision: m.revision,
                };
                (m.id.clone(), view)
            })
            .collect();
        let children = records
            .children
            .iter()
            .map(|c| {
                let view = ChildView {
                    marker: Some(c.marker.clone()),
                    code: c.code,
                    status: c.status,
                    severity: c.severity,
                    photos: c.photos.clone(),
                    revision: c.revision,
                };
                (c.id.clone(), view)
            })
            .collect();
        let layers = records.layers.iter().map(|l| l.id.clone()).collect();
        Self {
            markers,
            children,
            layers,
        }
    }

    /// Number of marker rows
    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    /// Number of child rows
    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Every way `snapshot` differs from these rows; empty when converged
    #[must_use]
    pub fn diff(&self, snapshot: &ScopeSnapshot) -> Vec<String> {
        let mut found = Vec::new();

        let mut markers = BTreeMap::new();
        for marker in snapshot.markers() {
            match &marker.id.remote {
                Some(remote) => {
                    let view = MarkerView {
                        layer: marker.layer.clone(),
                        position: (marker.position.x, marker.position.y),
                        status: marker.status,
                        severity: marker.severity,
                        seq: marker.seq,
                        next_child_index: marker.next_child_index,
                        revision: marker.revision,
                    };
                    markers.insert(remote.clone(), view);
                }
                None => found.push(format!("placeholder marker {}", marker.id)),
            }
        }

        let mut children = BTreeMap::new();
        for child in snapshot.children() {
            match &child.id.remote {
                Some(remote) => {
                    let parent = snapshot.marker(&child.marker).and_then(|m| m.id.remote.clone());
                    let view = ChildView {
                        marker: parent,
                        code: child.code,
                        status: child.status,
                        severity: child.severity,
                        photos: child.photos.clone(),
                        revision: child.revision,
                    };
                    children.insert(remote.clone(), view);
                }
                None => found.push(format!("placeholder child {}", child.id)),
            }
        }

        compare("marker", &self.markers, &markers, &mut found);
        compare("child", &self.children, &children, &mut found);

        let layers: BTreeSet<LayerId> = snapshot.layers().map(|l| l.id.clone()).collect();
        for missing in self.layers.difference(&layers) {
            found.push(format!("layer {missing} missing"));
        }
        for extra in layers.difference(&self.layers) {
            found.push(format!("layer {extra} not on server"));
        }
        found
    }
}

fn compare<V: PartialEq + Debug>(
    what: &str,
    expected: &BTreeMap<RemoteId, V>,
    actual: &BTreeMap<RemoteId, V>,
    found: &mut Vec<String>,
) {
    for (id, want) in expected {
        match actual.get(id) {
            None => found.push(format!("{what} {id} missing")),
            Some(got) if got != want => found.push(format!("{what} {id}: expected {want:?}, got {got:?}")),
            Some(_) => {}
        }
    }
    for id in actual.keys().filter(|id| !expected.contains_key(*id)) {
        found.push(format!("{what} {id} not on server"));
    }
}

/// Markers whose cached rollup disagrees with their children
#[must_use]
pub fn stale_rollups(snapshot: &ScopeSnapshot) -> Vec<String> {
    snapshot
        .markers()
        .filter(|m| !m.rollup.is_consistent() || m.rollup != snapshot.rollup_for(&m.id.local))
        .map(|m| format!("marker {} rollup {:?}", m.id, m.rollup))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartpin_cache::Patch;
    use smartpin_geometry::NormalizedPoint;
    use smartpin_model::{Entity, EntityId, Layer, LocalId, Marker, MarkerRecord, ScopeId};

    fn marker(remote: Option<&str>) -> Marker {
        let id = match remote {
            Some(r) => EntityId::authoritative(LocalId::new(), RemoteId::new(r)),
            None => EntityId::placeholder(),
        };
        let mut marker = Marker::new(id, ScopeId::new("roof"), LayerId::new("base"), NormalizedPoint::new(0.5, 0.5), 1);
        marker.revision = 1;
        marker
    }

    fn records_for(snapshot: &ScopeSnapshot) -> ScopeRecords {
        let mut records = ScopeRecords::default();
        for m in snapshot.markers() {
            records.markers.push(MarkerRecord {
                id: m.id.remote.clone().unwrap(),
                client_ref: None,
                scope: m.scope.clone(),
                layer: m.layer.clone(),
                position: m.position,
                status: m.status,
                severity: m.severity,
                seq: m.seq,
                next_child_index: m.next_child_index,
                created_at: m.created_at,
                last_activity_at: m.last_activity_at,
                revision: m.revision,
            });
        }
        records.layers = snapshot.layers().cloned().collect();
        records
    }

    #[test]
    fn identical_state_has_no_diff() {
        let mut snapshot = ScopeSnapshot::new();
        snapshot.apply(&Patch::Insert(Entity::Layer(Layer::new("base", "Base"))));
        snapshot.apply(&Patch::Insert(Entity::Marker(marker(Some("m-1")))));
        let expected = ExpectedState::from_records(&records_for(&snapshot));
        assert!(expected.diff(&snapshot).is_empty());
        assert!(stale_rollups(&snapshot).is_empty());
    }

    #[test]
    fn placeholders_and_field_drift_are_reported() {
        let mut snapshot = ScopeSnapshot::new();
        snapshot.apply(&Patch::Insert(Entity::Marker(marker(Some("m-1")))));
        let expected = ExpectedState::from_records(&records_for(&snapshot));

        let mut drifted = snapshot.clone();
        let mut moved = marker(Some("m-1"));
        moved.id = snapshot.markers().next().unwrap().id.clone();
        moved.revision = 2;
        drifted.apply(&Patch::Insert(Entity::Marker(moved)));
        drifted.apply(&Patch::Insert(Entity::Marker(marker(None))));

        let diff = expected.diff(&drifted);
        assert_eq!(diff.len(), 2, "{diff:?}");
        assert!(diff.iter().any(|d| d.starts_with("placeholder marker")));
        assert!(diff.iter().any(|d| d.starts_with("marker m-1:")));
    }
}
