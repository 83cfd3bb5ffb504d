//! End-to-end coverage of the store's externally observable behavior:
//! durability across reopen, rollback, column-family lifecycle, large
//! values, TTL expiry, and cross-handle read isolation.

use kvengine::{JournalMode, Store, StoreConfig};
use std::thread::sleep;
use std::time::Duration;

fn db_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_str().unwrap().to_string()
}

#[test]
fn wal_roundtrip_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir, "test.db");

    let mut store = Store::open_v2(&path, StoreConfig::new().journal_mode(JournalMode::Wal)).unwrap();
    let cf = store.cf_get_default();
    store.put(&cf, b"hello", b"world").unwrap();
    store.close().unwrap();

    let mut reopened = Store::open(&path).unwrap();
    let cf = reopened.cf_get_default();
    assert_eq!(reopened.get(&cf, b"hello").unwrap(), Some(b"world".to_vec()));
}

#[test]
fn rollback_discards_writes_made_in_the_transaction() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(&db_path(&dir, "test.db")).unwrap();
    let cf = store.cf_get_default();

    store.begin(true).unwrap();
    store.put(&cf, b"a", b"1").unwrap();
    store.put(&cf, b"b", b"2").unwrap();
    store.rollback().unwrap();

    assert_eq!(store.get(&cf, b"a").unwrap(), None);
    assert_eq!(store.get(&cf, b"b").unwrap(), None);
}

#[test]
fn column_families_can_be_created_listed_and_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(&db_path(&dir, "test.db")).unwrap();

    let users = store.cf_create("users").unwrap();
    let products = store.cf_create("products").unwrap();
    let orders = store.cf_create("orders").unwrap();

    for (i, cf) in [&users, &products, &orders].into_iter().enumerate() {
        store.put(cf, format!("k{i}-1").as_bytes(), b"v1").unwrap();
        store.put(cf, format!("k{i}-2").as_bytes(), b"v2").unwrap();
    }

    let mut names = store.cf_list().unwrap();
    names.sort();
    let mut expected = vec!["default", "users", "products", "orders"];
    expected.sort();
    assert_eq!(names, expected);

    store.cf_drop("orders").unwrap();
    let names = store.cf_list().unwrap();
    assert!(!names.iter().any(|n| n == "orders"));
}

#[test]
fn large_values_round_trip_byte_exact_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir, "test.db");

    {
        let mut store = Store::open(&path).unwrap();
        let cf = store.cf_get_default();
        for i in 0..10u8 {
            let key = format!("chunk_{i}");
            let pattern = b'A' + (i % 26);
            let value = vec![pattern; 1024 * 1024];
            store.put(&cf, key.as_bytes(), &value).unwrap();
        }
        store.close().unwrap();
    }

    let mut store = Store::open(&path).unwrap();
    let cf = store.cf_get_default();
    for i in 0..10u8 {
        let key = format!("chunk_{i}");
        let pattern = b'A' + (i % 26);
        let value = store.get(&cf, key.as_bytes()).unwrap().expect("chunk present");
        assert_eq!(value.len(), 1024 * 1024);
        assert!(value.iter().all(|&b| b == pattern), "chunk {i} had mismatched bytes");
    }
}

#[test]
fn ttl_expires_and_hides_the_key() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(&db_path(&dir, "test.db")).unwrap();
    let cf = store.cf_get_default();

    let now = kvengine::kv::now_ms();
    store.put_ttl(&cf, b"flash", b"x", now + 50).unwrap();
    sleep(Duration::from_millis(100));

    assert_eq!(store.get(&cf, b"flash").unwrap(), None);
    assert!(store.ttl_remaining(&cf, b"flash").is_err());
}

#[test]
fn a_reader_handle_does_not_see_a_concurrent_handles_commit_until_reopened() {
    let dir = tempfile::tempdir().unwrap();
    let path = db_path(&dir, "test.db");

    let mut a = Store::open(&path).unwrap();
    let cf_a = a.cf_get_default();
    a.put(&cf_a, b"seed", b"1").unwrap();

    let keys_before: Vec<Vec<u8>> = a.iterator(&cf_a).map(|r| r.unwrap().0).collect();
    assert!(!keys_before.iter().any(|k| k == b"z"));

    {
        let mut b = Store::open(&path).unwrap();
        let cf_b = b.cf_get_default();
        b.put(&cf_b, b"z", b"new").unwrap();
        b.close().unwrap();
    }

    let keys_during: Vec<Vec<u8>> = a.iterator(&cf_a).map(|r| r.unwrap().0).collect();
    assert!(!keys_during.iter().any(|k| k == b"z"), "handle a must not observe b's uncommitted-to-it write");
    a.close().unwrap();

    let mut reopened = Store::open(&path).unwrap();
    let cf = reopened.cf_get_default();
    let keys_after: Vec<Vec<u8>> = reopened.iterator(&cf).map(|r| r.unwrap().0).collect();
    assert!(keys_after.iter().any(|k| k == b"z"), "z must be visible after reopen");
}
