//! Per-partition detectors for the serving process.

use rusqlite::Connection;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use super::{history, EwmaState, ShiftDecision, ShiftDetector, ShiftMode};
use crate::config::ShiftConfig;
use crate::embedding::cosine_distance;
use crate::error::{Error, Result};
use crate::memory::types::Session;

#[derive(Debug)]
struct PartitionState {
    detector: ShiftDetector,
    last_vector: Option<Vec<f32>>,
    /// Session of the last vector; `None` for session-less rows.
    session: Option<String>,
}

/// Owns one [`ShiftDetector`] per partition, seeded lazily from
/// `threshold_history`, plus the last vector seen in each partition.
#[derive(Debug)]
pub struct ShiftTracker {
    config: ShiftConfig,
    partitions: HashMap<String, PartitionState>,
}

impl ShiftTracker {
    /// Fails with [`Error::InvalidInput`] when `config` does not validate.
    pub fn new(config: ShiftConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidInput(format!("{e:#}")))?;
        Ok(Self {
            config,
            partitions: HashMap::new(),
        })
    }

    fn partition(&mut self, conn: &Connection, partition: &str) -> Result<&mut PartitionState> {
        match self.partitions.entry(partition.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let seed = history::seed(conn, partition, self.config.seed_sessions)?;
                Ok(entry.insert(PartitionState {
                    detector: ShiftDetector::new(&self.config, seed)?,
                    last_vector: None,
                    session: None,
                }))
            }
        }
    }

    /// Feed the next vector in `partition`, captured in `session`. The first
    /// vector only primes the tracker and yields `None`.
    ///
    /// When the session changes, the previous session's state is checkpointed
    /// before the new vector is folded in, and no distance is taken across
    /// the boundary.
    pub fn observe(
        &mut self,
        conn: &Connection,
        partition: &str,
        session: Option<&str>,
        vector: &[f32],
    ) -> Result<Option<ShiftDecision>> {
        let state = self.partition(conn, partition)?;
        if state.session.as_deref() != session {
            if let Some(previous) = state.session.take() {
                history::checkpoint(conn, partition, &previous, &state.detector.state())?;
                state.last_vector = None;
            }
            state.session = session.map(str::to_string);
        }

        let decision = match &state.last_vector {
            Some(previous) => Some(state.detector.observe(cosine_distance(previous, vector))),
            None => None,
        };
        state.last_vector = Some(vector.to_vec());
        Ok(decision)
    }

    /// Current learned state, if the partition has been touched.
    pub fn state(&self, partition: &str) -> Option<EwmaState> {
        self.partitions.get(partition).map(|s| s.detector.state())
    }

    /// Switch every current and future detector to `mode`.
    pub fn set_mode(&mut self, mode: ShiftMode) {
        match mode {
            ShiftMode::Adaptive => {
                self.config.enabled = true;
                self.config.manual_threshold = None;
            }
            ShiftMode::Disabled => self.config.enabled = false,
            ShiftMode::Manual(threshold) => {
                self.config.enabled = true;
                self.config.manual_threshold = Some(threshold);
            }
        }
        for state in self.partitions.values_mut() {
            state.detector.set_mode(mode);
        }
    }

    /// Persist the partition's state as `session`'s final state.
    ///
    /// If `session` is the one the partition is currently in, the last vector
    /// is forgotten so the next session starts without a carried-over
    /// distance. A session the tracker already left keeps the state saved at
    /// its boundary.
    pub fn checkpoint_session(&mut self, conn: &Connection, session: &Session) -> Result<EwmaState> {
        let state = self.partition(conn, &session.partition_key)?;
        if state.session.as_deref() != Some(session.id.as_str()) {
            if let Some(saved) = history::for_session(conn, &session.id)? {
                return Ok(saved);
            }
        }
        let ewma = state.detector.state();
        history::checkpoint(conn, &session.partition_key, &session.id, &ewma)?;
        if state.session.as_deref() == Some(session.id.as_str()) {
            state.session = None;
            state.last_vector = None;
        }
        Ok(ewma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{OpenOptions, Store};
    use crate::embedding::EMBEDDING_DIM;
    use crate::memory::sessions;

    fn test_store() -> Store {
        Store::open_in_memory(&OpenOptions::default().vector_extension(false)).unwrap()
    }

    fn spike(dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim] = 1.0;
        v
    }

    fn tracker() -> ShiftTracker {
        ShiftTracker::new(ShiftConfig::default()).unwrap()
    }

    #[test]
    fn first_vector_primes_without_decision() {
        let store = test_store();
        let mut tracker = tracker();
        assert!(tracker.observe(store.conn(), "p1", None, &spike(0)).unwrap().is_none());
        let decision = tracker.observe(store.conn(), "p1", None, &spike(1)).unwrap().unwrap();
        // orthogonal vectors: distance 1.0, well above the default band
        assert!(decision.shifted);
    }

    #[test]
    fn partitions_are_independent() {
        let store = test_store();
        let mut tracker = tracker();
        tracker.observe(store.conn(), "p1", None, &spike(0)).unwrap();
        assert!(tracker.observe(store.conn(), "p2", None, &spike(1)).unwrap().is_none());
        assert!(tracker.state("p1").is_some());
        assert!(tracker.state("p3").is_none());
    }

    #[test]
    fn checkpoint_then_restart_reseeds() {
        let store = test_store();
        let session = sessions::start(store.conn(), "p1").unwrap();
        let mut tracker = tracker();
        for dim in [0, 0, 1, 1] {
            tracker.observe(store.conn(), "p1", Some(&session.id), &spike(dim)).unwrap();
        }
        let saved = tracker.checkpoint_session(store.conn(), &session).unwrap();
        assert_eq!(saved.observations, 3);

        let mut restarted = self::tracker();
        restarted.observe(store.conn(), "p1", None, &spike(0)).unwrap();
        let seeded = restarted.state("p1").unwrap();
        assert!((seeded.distance - saved.distance).abs() < 1e-12);
    }

    #[test]
    fn new_session_checkpoints_the_previous_one_first() {
        let store = test_store();
        let a = sessions::start(store.conn(), "p1").unwrap();
        let b = sessions::start(store.conn(), "p1").unwrap();
        let mut tracker = tracker();

        tracker.observe(store.conn(), "p1", Some(&a.id), &spike(0)).unwrap();
        tracker.observe(store.conn(), "p1", Some(&a.id), &spike(0)).unwrap();
        let after_a = tracker.state("p1").unwrap();

        // no distance across the boundary: b's first vector only primes
        assert!(tracker.observe(store.conn(), "p1", Some(&b.id), &spike(5)).unwrap().is_none());
        tracker.observe(store.conn(), "p1", Some(&b.id), &spike(6)).unwrap();
        assert_eq!(tracker.state("p1").unwrap().observations, after_a.observations + 1);

        let stored: i64 = store
            .conn()
            .query_row(
                "SELECT observation_count FROM threshold_history WHERE session_id = ?1",
                [&a.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(stored as u64, after_a.observations);

        // a later sweep of ended sessions keeps a's boundary state
        sessions::end(store.conn(), &a.id, None).unwrap();
        let kept = tracker.checkpoint_session(store.conn(), &a).unwrap();
        assert_eq!(kept, after_a);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = ShiftConfig {
            min_threshold: 0.8,
            max_threshold: 0.2,
            ..ShiftConfig::default()
        };
        let err = ShiftTracker::new(config).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn set_mode_applies_to_new_partitions() {
        let store = test_store();
        let mut tracker = tracker();
        tracker.set_mode(ShiftMode::Disabled);
        tracker.observe(store.conn(), "p1", None, &spike(0)).unwrap();
        let decision = tracker.observe(store.conn(), "p1", None, &spike(1)).unwrap().unwrap();
        assert!(!decision.shifted);
    }
}
