//! 模拟两个连接互相等待对方持有的行锁，产生一次死锁并上报到采集端
//!
//! 先启动 `cargo run --example collector`，再运行本示例

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use txn_monitor::metrics::{ConnectionPoolGauge, ProcessGauges};
use txn_monitor::{MetricsPublisher, MonitorConfig, PublisherConfig, TransactionMonitor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = Arc::new(ConnectionPoolGauge::new(10));
    let publisher = MetricsPublisher::http(
        &PublisherConfig::from_env(),
        Arc::new(ProcessGauges::new(Arc::clone(&pool))),
    )?;
    let monitor = TransactionMonitor::new(MonitorConfig::low_latency(), publisher);

    pool.acquire();
    pool.acquire();
    let tx_a = monitor.on_transaction_begin("conn-a");
    let tx_b = monitor.on_transaction_begin("conn-b");
    monitor.set_rollback_cost(&tx_a, 10);
    monitor.set_rollback_cost(&tx_b, 2);

    monitor.on_query_executed(
        "conn-a",
        "UPDATE accounts SET balance = balance - 100 WHERE id = 1",
        Duration::from_millis(4),
        None,
    );
    monitor.on_lock_requested(&tx_a, "accounts:1");
    monitor.on_lock_acquired(&tx_a, "accounts:1");

    monitor.on_query_executed(
        "conn-b",
        "UPDATE accounts SET balance = balance - 50 WHERE id = 2",
        Duration::from_millis(3),
        None,
    );
    monitor.on_lock_requested(&tx_b, "accounts:2");
    monitor.on_lock_acquired(&tx_b, "accounts:2");

    // 交叉请求对方的行
    monitor.on_lock_requested(&tx_a, "accounts:2");
    if let Some(event) = monitor.on_lock_requested(&tx_b, "accounts:1") {
        info!(victim = %event.victim, chain = ?event.lock_chain, "rolling back victim");
        let victim_conn = if event.victim == tx_a { "conn-a" } else { "conn-b" };
        monitor.on_rollback(victim_conn);
        pool.release();
    }

    // 幸存事务拿到锁后提交
    for (conn, tx) in [("conn-a", &tx_a), ("conn-b", &tx_b)] {
        if monitor.store().transaction_for(conn).is_some() {
            monitor.on_lock_acquired(tx, if conn == "conn-a" { "accounts:2" } else { "accounts:1" });
            monitor.on_commit(conn);
            pool.release();
        }
    }

    info!(stats = ?monitor.stats(), "simulation finished");
    monitor.shutdown().await;
    Ok(())
}
