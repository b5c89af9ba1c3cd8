//! Per-incident serialization.
//!
//! Every incident gets two lanes. The record lane is held only for a
//! read-modify-write against the store; the turn lane is held for a whole
//! conversation turn, including the model call, so turns on one incident
//! queue behind each other without blocking pipeline writes.
//!
//! Lanes exist only while someone holds or waits on them; the last guard to
//! drop removes the incident's entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LaneMap = Arc<Mutex<HashMap<String, Lanes>>>;

#[derive(Default)]
struct Lanes {
    record: Arc<AsyncMutex<()>>,
    turn: Arc<AsyncMutex<()>>,
}

impl Lanes {
    /// Only the map itself still refers to either lane.
    fn idle(&self) -> bool {
        Arc::strong_count(&self.record) == 1 && Arc::strong_count(&self.turn) == 1
    }
}

#[derive(Clone, Default)]
pub struct IncidentActors {
    lanes: LaneMap,
}

/// Held lane. Dropping it releases the lane and prunes the incident's entry
/// when nobody else is holding or queued on either lane.
pub struct LaneGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lanes: LaneMap,
    incident_id: String,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        if lanes.get(&self.incident_id).is_some_and(Lanes::idle) {
            lanes.remove(&self.incident_id);
        }
    }
}

impl IncidentActors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive access to the incident's record for one read-modify-write.
    pub async fn record(&self, incident_id: &str) -> LaneGuard {
        let lane = self.lane(incident_id, |lanes| lanes.record.clone());
        self.hold(incident_id, lane).await
    }

    /// Exclusive access to the incident's conversation for one turn.
    pub async fn turn(&self, incident_id: &str) -> LaneGuard {
        let lane = self.lane(incident_id, |lanes| lanes.turn.clone());
        self.hold(incident_id, lane).await
    }

    /// Number of incidents with a held or contended lane.
    pub fn active(&self) -> usize {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn hold(&self, incident_id: &str, lane: Arc<AsyncMutex<()>>) -> LaneGuard {
        // Declared before the lock future so a cancelled wait drops the
        // future's lane reference first and then prunes.
        let mut held = LaneGuard {
            guard: None,
            lanes: self.lanes.clone(),
            incident_id: incident_id.to_string(),
        };
        let locking = lane.lock_owned();
        held.guard = Some(locking.await);
        held
    }

    fn lane(
        &self,
        incident_id: &str,
        pick: impl FnOnce(&Lanes) -> Arc<AsyncMutex<()>>,
    ) -> Arc<AsyncMutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        pick(lanes.entry(incident_id.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_incident_is_serialized() {
        let actors = IncidentActors::new();
        let guard = actors.record("inc-1").await;

        let contender = actors.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.record("inc-1").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        waiting.await.expect("join");
        assert_eq!(actors.active(), 0);
    }

    #[tokio::test]
    async fn different_incidents_and_lanes_are_independent() {
        let actors = IncidentActors::new();
        let _record = actors.record("inc-1").await;
        let _turn = actors.turn("inc-1").await;

        tokio::time::timeout(Duration::from_millis(100), actors.record("inc-2"))
            .await
            .expect("other incident is not blocked");
    }

    #[tokio::test]
    async fn released_lanes_are_pruned() {
        let actors = IncidentActors::new();
        for id in ["nope-1", "nope-2", "nope-3"] {
            let _lane = actors.record(id).await;
        }
        assert_eq!(actors.active(), 0);

        let turn = actors.turn("inc-1").await;
        {
            let _record = actors.record("inc-1").await;
        }
        assert_eq!(actors.active(), 1, "turn lane still held");
        drop(turn);
        assert_eq!(actors.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_its_entry() {
        let actors = IncidentActors::new();
        let held = actors.record("inc-1").await;
        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), actors.record("inc-1")).await;
        assert!(timed_out.is_err());
        drop(held);
        assert_eq!(actors.active(), 0);
    }
}
