//! End-to-end tests for the single-shard store surface: durability across
//! reopen, concurrent counters, and transient-fault swallowing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use strata_core::{JournalMode, StrataConfig};
use strata_store::{ErrorHandler, FailsafeTag, Store};

fn file_config(path: std::path::PathBuf) -> StrataConfig {
    StrataConfig {
        database: Some(path),
        ..Default::default()
    }
}

#[test]
fn roundtrip_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.db");

    {
        let store = Store::new(file_config(db.clone())).unwrap();
        assert!(store.write("α", &[1, 2, 3]).unwrap());
        assert_eq!(store.read("α").unwrap(), Some(vec![1, 2, 3]));
    }

    // 重新開啟同一個資料庫，資料仍在。
    let store = Store::new(file_config(db)).unwrap();
    assert_eq!(store.read("α").unwrap(), Some(vec![1, 2, 3]));
    assert!(store.delete("α").unwrap());
    assert_eq!(store.read("α").unwrap(), None);
}

#[test]
fn concurrent_increments_are_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(file_config(dir.path().join("counters.db"))).unwrap();

    store.write("n", b"5").unwrap();

    const WORKERS: usize = 50;
    let mut observed = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                scope.spawn(|| store.increment("n", 1).unwrap().unwrap())
            })
            .collect();
        for handle in handles {
            observed.push(handle.join().unwrap());
        }
    });

    // 每次遞增都在列鎖下進行：50 個 worker 各 +1，結果必為 55。
    assert_eq!(store.read("n").unwrap(), Some(b"55".to_vec()));

    // Every worker saw a distinct intermediate value in (5, 55].
    observed.sort_unstable();
    let expected: Vec<i64> = (6..=55).collect();
    assert_eq!(observed, expected);
}

#[test]
fn transient_fault_yields_default_and_reports_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("faulty.db");

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler: ErrorHandler = Arc::new(move |tag, _err, _returning| {
        assert_eq!(tag, FailsafeTag::WriteEntry);
        seen.fetch_add(1, Ordering::SeqCst);
    });

    let config = StrataConfig {
        database: Some(db.clone()),
        // 短 lock-wait，讓測試不用等預設的五秒。
        busy_timeout_ms: 50,
        ..Default::default()
    };
    let store = Store::builder(config)
        .error_handler(handler)
        .build()
        .unwrap();

    // 另一條連線持有寫鎖，模擬鎖等待逾時。
    let blocker = rusqlite::Connection::open(&db).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    // 寫入吞掉暫時性錯誤，回傳預設值 false；handler 恰被呼叫一次。
    assert!(!store.write("x", b"v").unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // WAL 下讀取不受寫鎖影響，而且 store 內容未被改動。
    assert_eq!(store.read("x").unwrap(), None);

    blocker.execute_batch("COMMIT").unwrap();

    // 故障排除後一切如常。
    assert!(store.write("x", b"v").unwrap());
    assert_eq!(store.read("x").unwrap(), Some(b"v".to_vec()));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "no further reports");
}

#[test]
fn transient_fault_on_read_yields_nil_and_reports_read_tag() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("read-lockout.db");

    let tags = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&tags);
    let handler: ErrorHandler = Arc::new(move |tag, _err, _returning| {
        seen.lock().unwrap().push(tag);
    });

    let mut config = StrataConfig {
        database: Some(db.clone()),
        // Rollback journal：EXCLUSIVE 交易連讀取也會擋下，
        // 讓下一個 SELECT 真的撞上鎖等待逾時。
        journal_mode: JournalMode::Delete,
        busy_timeout_ms: 50,
        ..Default::default()
    };
    // 關掉淘汰界限，背景批次不碰資料庫，handler 只會收到讀取路徑的事件。
    config.expiry.max_age = None;

    let store = Store::builder(config)
        .error_handler(handler)
        .build()
        .unwrap();
    store.write("x", b"v").unwrap();

    let blocker = rusqlite::Connection::open(&db).unwrap();
    blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

    // SELECT 失敗被吞掉：read 回傳預設值 None，handler 恰收到一次 read_entry。
    assert_eq!(store.read("x").unwrap(), None);
    assert_eq!(tags.lock().unwrap().as_slice(), &[FailsafeTag::ReadEntry]);

    blocker.execute_batch("COMMIT").unwrap();

    // 故障排除後資料原封不動，不再有新的回報。
    assert_eq!(store.read("x").unwrap(), Some(b"v".to_vec()));
    assert_eq!(tags.lock().unwrap().len(), 1, "no further reports");
}

#[test]
fn fetch_computes_and_caches_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(file_config(dir.path().join("fetch.db"))).unwrap();

    let computed = AtomicUsize::new(0);
    for _ in 0..3 {
        let value = store
            .fetch("expensive", &Default::default(), || {
                computed.fetch_add(1, Ordering::SeqCst);
                b"result".to_vec()
            })
            .unwrap();
        assert_eq!(value, b"result");
    }
    assert_eq!(computed.load(Ordering::SeqCst), 1);
}
