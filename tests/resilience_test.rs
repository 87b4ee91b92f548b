mod helpers;

use cairn::capture::{capture, CaptureEvent};
use cairn::db::{OpenOptions, Store};
use cairn::memory::observations;
use cairn::memory::types::NewObservation;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn open_creates_missing_directories() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("nested").join("dir").join("cairn.db");
    assert!(!db_path.exists());

    let store = Store::open(&db_path, &OpenOptions::default()).unwrap();
    assert!(db_path.exists());
    assert_eq!(store.path(), Some(db_path.as_path()));
    assert_eq!(observations::count(store.conn(), None).unwrap(), 0);
}

#[test]
fn file_store_runs_in_wal_mode_with_configured_timeout() {
    let tmp = TempDir::new().unwrap();
    let options = OpenOptions::new(Duration::from_millis(1234));
    let store = Store::open(tmp.path().join("cairn.db"), &options).unwrap();

    let mode: String = store
        .conn()
        .pragma_query_value(None, "journal_mode", |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
    let timeout: i64 = store
        .conn()
        .pragma_query_value(None, "busy_timeout", |row| row.get(0))
        .unwrap();
    assert_eq!(timeout, 1234);
    let fk: i64 = store
        .conn()
        .pragma_query_value(None, "foreign_keys", |row| row.get(0))
        .unwrap();
    assert_eq!(fk, 1);
}

#[test]
fn held_write_lock_surfaces_as_busy_after_timeout() {
    let (tmp, holder) = helpers::file_store();
    let path = tmp.path().join("cairn.db");
    holder.conn().execute_batch("BEGIN IMMEDIATE").unwrap();

    let impatient = Store::open(&path, &OpenOptions::new(Duration::from_millis(50))).unwrap();
    let err = observations::create(impatient.conn(), &NewObservation::new("p1", "blocked")).unwrap_err();
    assert!(err.is_busy(), "expected busy, got {err}");

    // Reads still work while the writer holds the lock.
    assert_eq!(observations::count(impatient.conn(), None).unwrap(), 0);

    let event: CaptureEvent =
        serde_json::from_str(r#"{"partition_key": "p1", "content": "also blocked"}"#).unwrap();
    assert!(capture(impatient.conn(), &event).is_err());

    holder.conn().execute_batch("COMMIT").unwrap();
    assert!(capture(impatient.conn(), &event).is_ok());
}

#[test]
fn checkpoint_flushes_wal() {
    let (_tmp, store) = helpers::file_store();
    for i in 0..20 {
        observations::create(store.conn(), &NewObservation::new("p1", format!("row {i}"))).unwrap();
    }
    let stats = store.checkpoint().unwrap();
    assert!(!stats.busy);
    assert_eq!(stats.log_frames, stats.checkpointed_frames);
}

#[test]
fn keyword_only_store_still_accepts_vectors() {
    let store = helpers::keyword_only_store();
    let id = observations::create(store.conn(), &NewObservation::new("p1", "no vec here"))
        .unwrap()
        .id;
    assert!(observations::update_embedding(&store, &id, &helpers::test_embedding(3)).unwrap());
    assert!(observations::get_by_id(store.conn(), &id).unwrap().unwrap().has_embedding);
    assert_eq!(observations::count_unvectorized(store.conn()).unwrap(), 0);
}

#[test]
fn wrong_width_vector_is_rejected() {
    let store = helpers::test_store();
    let id = observations::create(store.conn(), &NewObservation::new("p1", "short vector"))
        .unwrap()
        .id;
    let err = observations::update_embedding(&store, &id, &[0.5; 8]).unwrap_err();
    assert!(matches!(err, cairn::Error::InvalidInput(_)));
}

#[test]
fn rebuilt_text_index_still_matches() {
    let store = helpers::test_store();
    observations::create(store.conn(), &NewObservation::new("p1", "rebuild me please")).unwrap();
    store.rebuild_text_index().unwrap();
    let hits = observations::search(&store, "rebuild", "p1", &Default::default(), None).unwrap();
    assert_eq!(hits.len(), 1);
}
