use chrono::Utc;
use stagehand_store::{
    FileOwnershipStore, OwnerToken, OwnershipRecord, OwnershipStore, StageId, StateLayout,
    StoreError,
};
use std::sync::{Arc, Barrier};
use std::thread;

// Racing claimants on separate store handles must observe exactly one winner.
#[test]
fn concurrent_claims_have_single_winner() {
    let dir = tempfile::tempdir().unwrap();
    let layout = StateLayout::new(dir.path());
    layout.initialize().unwrap();

    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = (0..contenders)
        .map(|i| {
            let barrier = Arc::clone(&barrier);
            let root = dir.path().to_path_buf();
            thread::spawn(move || {
                let store = FileOwnershipStore::new(StateLayout::new(&root));
                let now = Utc::now();
                let record = OwnershipRecord::new(
                    StageId::generate(),
                    OwnerToken::new(format!("actor-{i}")),
                    "attended",
                    root.join("stages"),
                    now,
                );
                barrier.wait();
                store.claim(record, now)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one claim must succeed");
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(r, Err(StoreError::AlreadyClaimed { .. })));
    }

    let store = FileOwnershipStore::new(layout);
    assert!(store.current(Utc::now()).unwrap().is_some());
}

#[test]
fn claim_survives_across_store_instances() {
    let dir = tempfile::tempdir().unwrap();
    let now = Utc::now();
    let id = StageId::generate();
    {
        let store = FileOwnershipStore::new(StateLayout::new(dir.path()));
        store
            .claim(
                OwnershipRecord::new(
                    id.clone(),
                    OwnerToken::new("alice"),
                    "attended",
                    dir.path().join("stages"),
                    now,
                ),
                now,
            )
            .unwrap();
    }

    let second_request = FileOwnershipStore::new(StateLayout::new(dir.path()));
    assert_eq!(
        second_request.owner(now).unwrap(),
        Some(OwnerToken::new("alice"))
    );
    assert_eq!(
        second_request.staging_root(now).unwrap(),
        Some(dir.path().join("stages"))
    );
    second_request.release(&id).unwrap();
    assert!(second_request.current(now).unwrap().is_none());
}
