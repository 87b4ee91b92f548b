mod helpers;

use cairn::config::ShiftConfig;
use cairn::memory::sessions;
use cairn::shift::{history, EwmaState, ShiftDetector, ShiftMode, ShiftTracker};

#[test]
fn settled_topic_then_jump_is_detected() {
    let mut detector = ShiftDetector::new(&ShiftConfig::default(), None).unwrap();
    let decisions: Vec<bool> = [0.1, 0.12, 0.11, 0.9]
        .into_iter()
        .map(|d| detector.observe(d).shifted)
        .collect();
    assert_eq!(decisions, vec![false, false, false, true]);
}

#[test]
fn threshold_is_clamped_for_any_state() {
    let config = ShiftConfig::default();
    for (distance, variance) in [(0.0, 0.0), (5.0, 5.0), (-1.0, 0.0), (0.2, f64::INFINITY)] {
        let seed = EwmaState {
            distance,
            variance,
            observations: 1,
        };
        let threshold = ShiftDetector::new(&config, Some(seed)).unwrap().threshold();
        assert!(
            (config.min_threshold..=config.max_threshold).contains(&threshold),
            "threshold {threshold} out of band for ({distance}, {variance})"
        );
    }
}

#[test]
fn learned_state_survives_restart_through_history() {
    let (tmp, store) = helpers::file_store();
    let config = ShiftConfig::default();
    let session = sessions::start(store.conn(), "p1").unwrap();

    let mut tracker = ShiftTracker::new(config.clone()).unwrap();
    for seed in [1u8, 1, 1, 1, 2] {
        tracker
            .observe(store.conn(), "p1", Some(&session.id), &helpers::test_embedding(seed))
            .unwrap();
    }
    sessions::end(store.conn(), &session.id, None).unwrap();
    let saved = tracker.checkpoint_session(store.conn(), &session).unwrap();
    store.close();

    let store = helpers::open_at(&tmp.path().join("cairn.db"), true);
    let seeded = history::seed(store.conn(), "p1", config.seed_sessions).unwrap().unwrap();
    assert!((seeded.distance - saved.distance).abs() < 1e-12);
    assert!((seeded.variance - saved.variance).abs() < 1e-12);
    assert_eq!(seeded.observations, saved.observations);

    // other partitions still cold-start
    assert!(history::seed(store.conn(), "p2", config.seed_sessions).unwrap().is_none());
}

#[test]
fn switching_modes_keeps_learned_state() {
    let store = helpers::test_store();
    let mut tracker = ShiftTracker::new(ShiftConfig::default()).unwrap();
    tracker.observe(store.conn(), "p1", None, &helpers::test_embedding(1)).unwrap();
    tracker.observe(store.conn(), "p1", None, &helpers::test_embedding(1)).unwrap();
    let learned = tracker.state("p1").unwrap();

    tracker.set_mode(ShiftMode::Manual(0.5));
    let decision = tracker
        .observe(store.conn(), "p1", None, &helpers::test_embedding(2))
        .unwrap()
        .unwrap();
    assert!(decision.shifted);
    assert_eq!(decision.threshold, 0.5);
    assert_eq!(tracker.state("p1").unwrap(), learned);

    tracker.set_mode(ShiftMode::Disabled);
    let decision = tracker
        .observe(store.conn(), "p1", None, &helpers::test_embedding(3))
        .unwrap()
        .unwrap();
    assert!(!decision.shifted);
    assert_eq!(tracker.state("p1").unwrap(), learned);
}

#[test]
fn misconfigured_band_is_an_error_not_a_panic() {
    let config = ShiftConfig {
        min_threshold: 0.9,
        max_threshold: 0.1,
        ..ShiftConfig::default()
    };
    assert!(ShiftDetector::new(&config, None).is_err());
    assert!(matches!(ShiftTracker::new(config), Err(cairn::Error::InvalidInput(_))));
}
