//! Tests for the experiment registry: explicit creation, implicit
//! auto-creation under contention, winner transitions, targeting and delete.

use std::sync::{Arc, Barrier};
use std::thread;

use headline_lab::{
    ErrorKind, EventKind, EventLedger, ExperimentRegistry, ExperimentState, NewExperiment,
    Provenance, SqliteStore, StoreOptions, Targeting,
};
use rstest::rstest;

fn labels(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

// ---------------------------------------------------------------------------
// Create / validation
// ---------------------------------------------------------------------------

#[test]
fn test_create_is_server_provenance_and_running() {
    let store = SqliteStore::open_in_memory().unwrap();
    let exp = store
        .create(&NewExperiment::new("hero", &["A", "B"]).with_goal("signup"))
        .unwrap();
    assert_eq!(exp.provenance, Provenance::Server);
    assert_eq!(exp.state, ExperimentState::Running);
    assert_eq!(exp.goal.as_deref(), Some("signup"));
    assert_eq!(exp.winner, None);
    assert!(!exp.has_conflict);
}

#[rstest]
#[case(NewExperiment::new("hero", &["A"]))]
#[case(NewExperiment::new("hero", &["A", " "]))]
#[case(NewExperiment::new("bad name!", &["A", "B"]))]
#[case(NewExperiment::new("", &["A", "B"]))]
#[case(NewExperiment::new("hero", &["A", "B"]).with_weights(vec![0.5]))]
#[case(NewExperiment::new("hero", &["A", "B"]).with_weights(vec![0.7, 0.7]))]
#[case(NewExperiment::new("hero", &["A", "B"]).with_weights(vec![-0.5, 1.5]))]
fn test_create_rejects_invalid_definitions(#[case] def: NewExperiment) {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store.create(&def).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDefinition);
    assert_eq!(store.count_experiments().unwrap(), 0);
}

#[test]
fn test_weights_round_trip() {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .create(&NewExperiment::new("hero", &["A", "B", "C"]).with_weights(vec![0.5, 0.3, 0.2]))
        .unwrap();
    assert_eq!(store.get("hero").unwrap().weights, Some(vec![0.5, 0.3, 0.2]));
}

#[test]
fn test_duplicate_create_already_exists() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    let err = store.create(&NewExperiment::new("hero", &["X", "Y"])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(store.get("hero").unwrap().variants, labels(&["A", "B"]));
}

#[test]
fn test_list_newest_first() {
    let store = SqliteStore::open_in_memory().unwrap();
    for name in ["one", "two", "three"] {
        store.create(&NewExperiment::new(name, &["A", "B"])).unwrap();
    }
    let names: Vec<_> = store.list().unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["three", "two", "one"]);
}

// ---------------------------------------------------------------------------
// Auto-create
// ---------------------------------------------------------------------------

#[test]
fn test_get_or_create_creates_client_experiment_once() {
    let store = SqliteStore::open_in_memory().unwrap();
    let (exp, created) = store.get_or_create("hero", &labels(&["A", "B"])).unwrap();
    assert!(created);
    assert_eq!(exp.provenance, Provenance::Client);

    let (again, created) = store.get_or_create("hero", &labels(&["X", "Y", "Z"])).unwrap();
    assert!(!created);
    assert_eq!(again.id, exp.id);
    assert_eq!(again.variants, labels(&["A", "B"]));
}

#[test]
fn test_concurrent_auto_create_has_single_winner() {
    const WORKERS: usize = 8;
    let dir = tempfile::tempdir().unwrap();
    let base = SqliteStore::open(dir.path().join("lab.db"), &StoreOptions::default()).unwrap();
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = (0..WORKERS)
        .map(|i| {
            let store = base.reopen().unwrap();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let variants = vec![format!("A{i}"), format!("B{i}")];
                barrier.wait();
                store.get_or_create("hero", &variants).unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);

    let stored = base.get("hero").unwrap();
    for (exp, _) in &results {
        assert_eq!(exp.id, stored.id);
        assert_eq!(exp.variants, stored.variants);
    }
    assert_eq!(base.count_experiments().unwrap(), 1);
}

// ---------------------------------------------------------------------------
// Conflict flag
// ---------------------------------------------------------------------------

#[test]
fn test_record_conflict_is_sticky_and_reports_first_flip() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    assert!(store.record_conflict("hero").unwrap());
    assert!(!store.record_conflict("hero").unwrap());
    assert!(store.get("hero").unwrap().has_conflict);
}

#[test]
fn test_record_conflict_unknown_is_not_found() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.record_conflict("ghost").unwrap_err().kind(), ErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// Winner
// ---------------------------------------------------------------------------

#[test]
fn test_set_winner_completes() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    let exp = store.set_winner("hero", 1).unwrap();
    assert_eq!(exp.state, ExperimentState::Completed);
    assert_eq!(exp.winner, Some(1));
}

#[rstest]
#[case(-1)]
#[case(2)]
fn test_set_winner_out_of_range(#[case] variant: i64) {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    let err = store.set_winner("hero", variant).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidVariant);
    assert!(store.get("hero").unwrap().is_running());
}

#[test]
fn test_set_winner_twice_is_invalid_state() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    store.set_winner("hero", 0).unwrap();
    let err = store.set_winner("hero", 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(store.get("hero").unwrap().winner, Some(0));
}

#[test]
fn test_set_winner_unknown_is_not_found() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.set_winner("ghost", 0).unwrap_err().kind(), ErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// Targeting / lookup
// ---------------------------------------------------------------------------

#[test]
fn test_targeting_round_trip_and_lookup() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    store.create(&NewExperiment::new("cta", &["A", "B"])).unwrap();
    let t = Targeting {
        url: Some("https://site.test/".into()),
        target: Some("h1".into()),
        cta_target: None,
        conversion_url: Some("https://site.test/thanks".into()),
    };
    store.set_targeting("hero", &t).unwrap();
    assert_eq!(store.get("hero").unwrap().targeting, t);

    let hits = store.list_by_url("https://site.test/").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "hero");

    store.set_winner("hero", 0).unwrap();
    assert!(store.list_by_url("https://site.test/").unwrap().is_empty());
}

#[test]
fn test_targeting_unknown_is_not_found() {
    let store = SqliteStore::open_in_memory().unwrap();
    let err = store.set_targeting("ghost", &Targeting::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

#[test]
fn test_delete_removes_events() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    store.record_event("hero", 0, EventKind::View, "v1").unwrap();
    store.delete("hero").unwrap();
    assert_eq!(store.get("hero").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(store.events("hero").unwrap().is_empty());

    store.create(&NewExperiment::new("hero", &["A", "B"])).unwrap();
    assert!(store.aggregate("hero").unwrap().is_empty());
}

#[test]
fn test_delete_unknown_is_not_found() {
    let store = SqliteStore::open_in_memory().unwrap();
    assert_eq!(store.delete("ghost").unwrap_err().kind(), ErrorKind::NotFound);
}
