//! Per-identity FIFO lanes
//!
//! A mutation takes a ticket on every identity it touches at the moment it
//! is applied locally. The ticket waits for the previous ticket holder on
//! each of those identities, so commits for one identity go out in the
//! order the optimistic patches were applied. Registration is synchronous;
//! waiting only ever targets earlier tickets, so lanes cannot deadlock.

use parking_lot::Mutex;
use smartpin_model::EntityRef;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Tails = Arc<Mutex<HashMap<EntityRef, watch::Receiver<bool>>>>;

/// Lane registry shared by one pipeline
#[derive(Debug, Default)]
pub(crate) struct LaneTable {
    tails: Tails,
}

impl LaneTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue behind the current holder of each key
    pub(crate) fn enqueue(&self, keys: &[EntityRef]) -> LaneTicket {
        let (done, own) = watch::channel(false);
        let mut tails = self.tails.lock();
        let mut waits = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(prev) = tails.insert(key.clone(), own.clone()) {
                if !prev.same_channel(&own) && !waits.iter().any(|w: &watch::Receiver<bool>| w.same_channel(&prev)) {
                    waits.push(prev);
                }
            }
        }
        LaneTicket {
            keys: keys.to_vec(),
            waits,
            done,
            own,
            tails: Arc::clone(&self.tails),
        }
    }

    /// Number of identities with a live ticket
    pub(crate) fn active(&self) -> usize {
        self.tails.lock().len()
    }
}

/// Place in the lanes of a set of identities; dropping it releases them
#[derive(Debug)]
pub(crate) struct LaneTicket {
    keys: Vec<EntityRef>,
    waits: Vec<watch::Receiver<bool>>,
    done: watch::Sender<bool>,
    own: watch::Receiver<bool>,
    tails: Tails,
}

impl LaneTicket {
    /// Wait until every earlier ticket on these identities is released
    pub(crate) async fn ready(&mut self) {
        for prev in &mut self.waits {
            // A closed channel means the predecessor was dropped, which releases it too
            let _ = prev.wait_for(|released| *released).await;
        }
        self.waits.clear();
    }
}

impl Drop for LaneTicket {
    fn drop(&mut self) {
        self.done.send_replace(true);
        let mut tails = self.tails.lock();
        for key in &self.keys {
            if tails.get(key).is_some_and(|tail| tail.same_channel(&self.own)) {
                tails.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartpin_model::LocalId;
    use std::time::Duration;

    #[tokio::test]
    async fn second_ticket_waits_for_first() {
        let lanes = LaneTable::new();
        let key = EntityRef::Marker(LocalId::new());
        let first = lanes.enqueue(&[key.clone()]);
        let mut second = lanes.enqueue(&[key]);

        let blocked = tokio::time::timeout(Duration::from_millis(20), second.ready()).await;
        assert!(blocked.is_err());

        drop(first);
        tokio::time::timeout(Duration::from_millis(20), second.ready())
            .await
            .expect("released after first drops");
        drop(second);
        assert_eq!(lanes.active(), 0);
    }

    #[tokio::test]
    async fn disjoint_keys_do_not_wait() {
        let lanes = LaneTable::new();
        let _first = lanes.enqueue(&[EntityRef::Marker(LocalId::new())]);
        let mut second = lanes.enqueue(&[EntityRef::Marker(LocalId::new())]);
        tokio::time::timeout(Duration::from_millis(20), second.ready())
            .await
            .expect("independent lanes");
    }

    #[tokio::test]
    async fn multi_key_ticket_waits_on_each_lane() {
        let lanes = LaneTable::new();
        let a = EntityRef::Marker(LocalId::new());
        let b = EntityRef::Child(LocalId::new());
        let on_a = lanes.enqueue(&[a.clone()]);
        let on_b = lanes.enqueue(&[b.clone()]);
        let mut both = lanes.enqueue(&[a, b]);

        drop(on_a);
        let blocked = tokio::time::timeout(Duration::from_millis(20), both.ready()).await;
        assert!(blocked.is_err());
        drop(on_b);
        tokio::time::timeout(Duration::from_millis(20), both.ready())
            .await
            .expect("both lanes released");
    }
}
