use basalt::txn::log::read_log;
use basalt::{BasaltError, Config, Engine, IsolationLevel, RowKey};
use bytes::Bytes;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

fn start(dir: &Path) -> Engine {
    Engine::start(Config::synchronous(dir)).unwrap()
}

fn key(id: u64) -> RowKey {
    RowKey::new("orders", id)
}

fn read(engine: &Engine, key: &RowKey) -> Result<Bytes, BasaltError> {
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    let value = engine.read(&txn, key);
    engine.commit(txn).unwrap();
    value
}

fn commit_insert(engine: &Engine, key: &RowKey, value: &'static [u8]) {
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.insert(&txn, key, Bytes::from_static(value)).unwrap();
    engine.commit(txn).unwrap();
}

#[test]
fn test_committed_work_survives_crash_before_page_flush() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        commit_insert(&engine, &key(1), b"v1");
        assert!(engine.dirty_pages() > 0);
        engine.simulate_crash();
    }

    let engine = start(dir.path());
    assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"v1"));
}

#[test]
fn test_uncommitted_work_rolled_back_after_crash() {
    let dir = tempdir().unwrap();
    let loser;
    {
        let engine = start(dir.path());
        commit_insert(&engine, &key(1), b"v1");

        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.update(&txn, &key(1), Bytes::from_static(b"v2")).unwrap();
        engine.insert(&txn, &key(2), Bytes::from_static(b"half")).unwrap();
        loser = txn.id;
        // Forces the log and writes the uncommitted pages to disk
        engine.checkpoint().unwrap();
        engine.simulate_crash();
    }

    let engine = Engine::open(Config::synchronous(dir.path())).unwrap();
    let report = engine.recover().unwrap();
    assert_eq!(report.losers, vec![loser]);
    assert_eq!(report.clrs_written, 3);
    assert!(report.checkpoint_lsn.is_some());

    assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"v1"));
    assert!(matches!(read(&engine, &key(2)), Err(BasaltError::NotFound(_))));
}

#[test]
fn test_transaction_is_all_or_nothing() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        for id in 0..10 {
            engine.insert(&txn, &key(id), Bytes::from_static(b"x")).unwrap();
        }
        // Another commit makes the partial work durable in the log
        commit_insert(&engine, &key(100), b"other");
        engine.simulate_crash();
    }

    let engine = start(dir.path());
    for id in 0..10 {
        assert!(matches!(read(&engine, &key(id)), Err(BasaltError::NotFound(_))));
    }
    assert_eq!(read(&engine, &key(100)).unwrap(), Bytes::from_static(b"other"));
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        commit_insert(&engine, &key(1), b"kept");
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.update(&txn, &key(1), Bytes::from_static(b"lost")).unwrap();
        commit_insert(&engine, &key(2), b"kept");
        engine.simulate_crash();
    }

    // Crash again straight after recovery, then once more
    for _ in 0..2 {
        let engine = start(dir.path());
        assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"kept"));
        assert_eq!(read(&engine, &key(2)).unwrap(), Bytes::from_static(b"kept"));
        engine.simulate_crash();
    }

    let engine = start(dir.path());
    let again = engine.recover().unwrap();
    assert!(again.losers.is_empty());
    assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"kept"));
    assert_eq!(engine.versions_for(&key(1)).unwrap().len(), 1);
}

#[test]
fn test_aborted_transaction_stays_aborted_after_crash() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        commit_insert(&engine, &key(1), b"v1");
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.delete(&txn, &key(1)).unwrap();
        engine.abort(txn).unwrap();
        engine.simulate_crash();
    }

    let engine = Engine::open(Config::synchronous(dir.path())).unwrap();
    let report = engine.recover().unwrap();
    assert!(report.losers.is_empty());
    assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"v1"));
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        commit_insert(&engine, &key(1), b"v1");
        engine.shutdown().unwrap();
    }

    let wal_path = dir.path().join("wal.log");
    let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
    file.write_all(&[0x2a, 0x00, 0x00]).unwrap();
    drop(file);

    let engine = Engine::open(Config::synchronous(dir.path())).unwrap();
    let report = engine.recover().unwrap();
    assert!(report.torn_tail);
    assert_eq!(read(&engine, &key(1)).unwrap(), Bytes::from_static(b"v1"));

    // Later records land after the cut, not after the garbage
    commit_insert(&engine, &key(2), b"v2");
    let scan = read_log(&wal_path).unwrap();
    assert!(!scan.torn_tail);
}

#[test]
fn test_checkpoint_truncates_log_and_recovery_still_works() {
    let dir = tempdir().unwrap();
    {
        let engine = start(dir.path());
        for id in 0..20 {
            commit_insert(&engine, &key(id), b"row");
        }
        let before = read_log(&dir.path().join("wal.log")).unwrap().records.len();
        engine.checkpoint().unwrap();
        let after = read_log(&dir.path().join("wal.log")).unwrap().records.len();
        assert!(after < before);

        commit_insert(&engine, &key(20), b"after checkpoint");
        engine.simulate_crash();
    }

    let engine = start(dir.path());
    for id in 0..20 {
        assert_eq!(read(&engine, &key(id)).unwrap(), Bytes::from_static(b"row"));
    }
    assert_eq!(read(&engine, &key(20)).unwrap(), Bytes::from_static(b"after checkpoint"));
}

#[test]
fn test_transaction_ids_keep_growing_across_restarts() {
    let dir = tempdir().unwrap();
    let first = {
        let engine = start(dir.path());
        let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
        engine.insert(&txn, &key(1), Bytes::from_static(b"v1")).unwrap();
        engine.commit(txn).unwrap();
        engine.shutdown().unwrap();
        txn.id
    };

    let engine = start(dir.path());
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert!(txn.id > first);
    // Versions written before the restart count as committed
    assert_eq!(engine.read(&txn, &key(1)).unwrap(), Bytes::from_static(b"v1"));
}

#[test]
fn test_automatic_checkpoint_bounds_log() {
    let dir = tempdir().unwrap();
    let mut config = Config::synchronous(dir.path());
    config.checkpoint_threshold_bytes = 2048;
    let engine = Engine::start(config).unwrap();

    for id in 0..200 {
        commit_insert(&engine, &key(id), b"payload");
    }
    assert!(engine.wal().bytes_since_checkpoint() < 4096);
    let records = read_log(&dir.path().join("wal.log")).unwrap().records.len();
    assert!(records < 200);
}
