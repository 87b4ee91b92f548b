mod helpers;

use cairn::memory::observations;
use cairn::memory::sessions;
use cairn::memory::types::{Classification, ListFilter, NewObservation};

#[test]
fn partitions_never_see_each_other() {
    let store = helpers::test_store();
    for i in 0..50 {
        observations::create(store.conn(), &NewObservation::new("p1", format!("p1 note {i}"))).unwrap();
    }
    for i in 0..3 {
        observations::create(store.conn(), &NewObservation::new("p2", format!("p2 note {i}"))).unwrap();
    }

    let mut filter = ListFilter::partition("p2");
    filter.limit = 100;
    let p2 = observations::list(store.conn(), &filter).unwrap();
    assert_eq!(p2.len(), 3);
    assert!(p2.iter().all(|o| o.partition_key == "p2"));

    filter.partition_key = "p1".into();
    let p1 = observations::list(store.conn(), &filter).unwrap();
    assert_eq!(p1.len(), 50);

    assert_eq!(observations::count(store.conn(), Some("p2")).unwrap(), 3);
    assert_eq!(observations::count(store.conn(), None).unwrap(), 53);
}

#[test]
fn list_is_newest_first_and_pages() {
    let store = helpers::test_store();
    let ids: Vec<String> = (0..5)
        .map(|i| {
            observations::create(store.conn(), &NewObservation::new("p1", format!("entry {i}")))
                .unwrap()
                .id
        })
        .collect();

    let mut filter = ListFilter::partition("p1");
    filter.limit = 2;
    let first = observations::list(store.conn(), &filter).unwrap();
    assert_eq!(first.iter().map(|o| &o.id).collect::<Vec<_>>(), vec![&ids[4], &ids[3]]);

    filter.offset = 2;
    let second = observations::list(store.conn(), &filter).unwrap();
    assert_eq!(second.iter().map(|o| &o.id).collect::<Vec<_>>(), vec![&ids[2], &ids[1]]);
}

#[test]
fn soft_delete_then_restore_is_identity() {
    let store = helpers::test_store();
    let created = observations::create(
        store.conn(),
        &NewObservation::new("p1", "the build needs openssl").title("build deps"),
    )
    .unwrap();

    assert!(observations::soft_delete(store.conn(), &created.id).unwrap());
    assert!(observations::get_by_id(store.conn(), &created.id).unwrap().is_none());
    assert!(observations::list(store.conn(), &ListFilter::partition("p1")).unwrap().is_empty());
    // already deleted
    assert!(!observations::soft_delete(store.conn(), &created.id).unwrap());

    assert!(observations::restore(store.conn(), &created.id).unwrap());
    let restored = observations::get_by_id(store.conn(), &created.id).unwrap().unwrap();
    assert_eq!(restored.content, created.content);
    assert_eq!(restored.title, created.title);
    assert_eq!(restored.partition_key, created.partition_key);
    assert_eq!(restored.created_at, created.created_at);
    assert!(restored.deleted_at.is_none());
}

#[test]
fn unknown_ids_are_not_errors() {
    let store = helpers::test_store();
    assert!(observations::get_by_id(store.conn(), "does-not-exist").unwrap().is_none());
    assert!(!observations::soft_delete(store.conn(), "does-not-exist").unwrap());
    assert!(!observations::restore(store.conn(), "does-not-exist").unwrap());
}

#[test]
fn noise_is_hidden_unless_asked_for() {
    let store = helpers::test_store();
    observations::create(store.conn(), &NewObservation::new("p1", "useful")).unwrap();
    observations::create(
        store.conn(),
        &NewObservation::new("p1", "ls -la").classification(Classification::Noise),
    )
    .unwrap();

    let default = observations::list(store.conn(), &ListFilter::partition("p1")).unwrap();
    assert_eq!(default.len(), 1);

    let mut noise = ListFilter::partition("p1");
    noise.classification = Some(Classification::Noise);
    let only_noise = observations::list(store.conn(), &noise).unwrap();
    assert_eq!(only_noise.len(), 1);
    assert_eq!(only_noise[0].content, "ls -la");
}

#[test]
fn observations_attach_to_sessions() {
    let store = helpers::test_store();
    let session = sessions::start(store.conn(), "p1").unwrap();
    observations::create(store.conn(), &NewObservation::new("p1", "inside").session(&session.id)).unwrap();
    observations::create(store.conn(), &NewObservation::new("p1", "outside")).unwrap();

    let mut filter = ListFilter::partition("p1");
    filter.session_id = Some(session.id.clone());
    let rows = observations::list(store.conn(), &filter).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].content, "inside");

    assert!(sessions::end(store.conn(), &session.id, Some("done")).unwrap());
    assert!(!sessions::end(store.conn(), &session.id, None).unwrap());
    let ended = sessions::get(store.conn(), &session.id).unwrap().unwrap();
    assert_eq!(ended.summary.as_deref(), Some("done"));
    assert!(sessions::current_open(store.conn(), "p1").unwrap().is_none());
}

#[test]
fn file_store_survives_reopen() {
    let (tmp, store) = helpers::file_store();
    let id = observations::create(store.conn(), &NewObservation::new("p1", "persisted"))
        .unwrap()
        .id;
    store.close();

    let reopened = helpers::open_at(&tmp.path().join("cairn.db"), true);
    let row = observations::get_by_id(reopened.conn(), &id).unwrap().unwrap();
    assert_eq!(row.content, "persisted");
}
