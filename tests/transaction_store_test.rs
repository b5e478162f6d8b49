// 集成测试：事务存储
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use txn_monitor::transactions::{QueryExecution, SqlType, TransactionStatus, TransactionStore};

fn query(sql: &str, ms: u64) -> QueryExecution {
    QueryExecution::new(sql, Duration::from_millis(ms))
}

#[test]
fn test_transaction_lifecycle() {
    let store = TransactionStore::new();
    store.register_transaction("conn-1", "tx-1");

    assert!(store.record_query("conn-1", query("SELECT * FROM orders WHERE id = 42", 5)));
    assert!(store.record_query("conn-1", query("UPDATE orders SET state = 'paid' WHERE id = 42", 8)));

    let snapshot = store.transaction("tx-1").unwrap();
    assert_eq!(snapshot.queries[0].sql_type, SqlType::Select);
    assert_eq!(snapshot.queries[0].sql_pattern, "SELECT * FROM orders WHERE id = ?");
    assert_eq!(snapshot.queries[1].sql_pattern, "UPDATE orders SET state = ? WHERE id = ?");
    assert!(snapshot.queries[0].sequence < snapshot.queries[1].sequence);

    let metrics = store
        .complete_transaction("conn-1", TransactionStatus::Committed)
        .unwrap();
    assert_eq!(metrics.transaction_id, "tx-1");
    assert_eq!(metrics.query_count, 2);
    assert_eq!(metrics.total_execution_time_ms, 13);
    assert_eq!(metrics.status, TransactionStatus::Committed);

    // 结束后的操作都是空操作
    assert!(!store.record_query("conn-1", query("SELECT 1", 1)));
    assert!(store
        .complete_transaction("conn-1", TransactionStatus::RolledBack)
        .is_none());
    assert!(store.transaction("tx-1").is_none());
}

#[test]
fn test_rollback_status() {
    let store = TransactionStore::new();
    store.register_transaction("conn-1", "tx-1");
    store.record_query("conn-1", query("DELETE FROM carts", 2).failed("lock wait timeout"));

    let metrics = store
        .complete_transaction("conn-1", TransactionStatus::RolledBack)
        .unwrap();
    assert_eq!(metrics.status, TransactionStatus::RolledBack);
    assert_eq!(metrics.query_count, 1);
}

#[test]
fn test_concurrent_connections() {
    let store = Arc::new(TransactionStore::new());
    let mut handles = vec![];

    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(thread::spawn(move || {
            let conn = format!("conn-{}", i);
            let tx = format!("tx-{}", i);
            store.register_transaction(&conn, &tx);
            for _ in 0..50 {
                store.record_query(&conn, query("SELECT 1", 1));
            }
            store.complete_transaction(&conn, TransactionStatus::Committed)
        }));
    }

    for handle in handles {
        let metrics = handle.join().unwrap().unwrap();
        assert_eq!(metrics.query_count, 50);
        assert_eq!(metrics.total_execution_time_ms, 50);
    }
    assert_eq!(store.active_count(), 0);
    assert_eq!(store.bound_connections(), 0);
}

#[test]
fn test_concurrent_complete_happens_once() {
    let store = Arc::new(TransactionStore::new());
    store.register_transaction("conn-1", "tx-1");

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .complete_transaction("conn-1", TransactionStatus::Committed)
                    .is_some()
            })
        })
        .collect();

    let completed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|done| *done)
        .count();
    assert_eq!(completed, 1);
}

#[test]
fn test_shared_transaction_leaves_no_binding() {
    let store = TransactionStore::new();
    store.register_transaction("conn-1", "tx-1");
    store.register_transaction("conn-2", "tx-1");

    store
        .complete_transaction("conn-1", TransactionStatus::Committed)
        .unwrap();
    assert!(store.cleanup_orphans(Duration::from_millis(1)).is_empty());
    assert_eq!(store.bound_connections(), 0);
    assert_eq!(store.active_count(), 0);
    assert!(store.transaction_for("conn-2").is_none());

    // conn-2 可以开始新的事务
    store.register_transaction("conn-2", "tx-2");
    assert!(store.record_query("conn-2", query("SELECT 1", 1)));
}
