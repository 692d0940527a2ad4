//! Write-slot fairness and reader/writer concurrency through the public API.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use kestrel_common::config::KvConfig;
use kestrel_common::error::{KvError, TxnError};
use kestrel_storage::KeyValueDb;

fn open(dir: &std::path::Path) -> Arc<KeyValueDb> {
    let mut config = KvConfig::with_dir(dir);
    config.compaction.background = false;
    Arc::new(KeyValueDb::open(config).unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writers_are_granted_in_request_order() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = db.start_write_transaction().await.unwrap();
    let second = db.start_write_transaction();
    let third = db.start_write_transaction();

    let third_task = {
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let mut tr = third.await.unwrap();
            order.lock().push(3);
            tr.create_or_update(b"k", b"third").unwrap();
            tr.commit().unwrap();
        })
    };
    let second_task = {
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            let mut tr = second.await.unwrap();
            order.lock().push(2);
            tokio::time::sleep(Duration::from_millis(50)).await;
            tr.create_or_update(b"k", b"second").unwrap();
            tr.commit().unwrap();
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(order.lock().is_empty());
    drop(first);

    second_task.await.unwrap();
    third_task.await.unwrap();
    assert_eq!(*order.lock(), vec![2, 3]);
    let tr = db.start_read_only_transaction();
    assert_eq!(tr.get(b"k").unwrap(), Some(b"third".to_vec()));
}

#[tokio::test]
async fn test_abandoned_grant_passes_the_slot_on() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    let first = db.start_write_transaction().await.unwrap();
    let abandoned = db.start_write_transaction();
    let waiting = db.start_write_transaction();
    drop(abandoned);
    drop(first);
    let mut tr = waiting.await.unwrap();
    tr.create_or_update(b"x", b"1").unwrap();
    tr.commit().unwrap();
}

#[tokio::test]
async fn test_write_after_close_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    db.close().unwrap();
    assert!(matches!(
        db.start_write_transaction().await,
        Err(KvError::Txn(TxnError::Closed))
    ));
}

#[test]
fn test_readers_always_see_whole_commits() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(dir.path());
    {
        let mut tr = db.start_write_transaction().wait().unwrap();
        tr.create_or_update(b"left", &0u64.to_le_bytes()).unwrap();
        tr.create_or_update(b"right", &0u64.to_le_bytes()).unwrap();
        tr.commit().unwrap();
    }

    let writer = {
        let db = Arc::clone(&db);
        std::thread::spawn(move || {
            for i in 1..=200u64 {
                let mut tr = db.start_write_transaction().wait().unwrap();
                tr.create_or_update(b"left", &i.to_le_bytes()).unwrap();
                tr.create_or_update(b"right", &i.to_le_bytes()).unwrap();
                tr.commit().unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                for _ in 0..300 {
                    let tr = db.start_read_only_transaction();
                    let left = tr.get(b"left").unwrap().unwrap();
                    let right = tr.get(b"right").unwrap().unwrap();
                    assert_eq!(left, right);
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    let tr = db.start_read_only_transaction();
    assert_eq!(tr.get(b"left").unwrap(), Some(200u64.to_le_bytes().to_vec()));
}
