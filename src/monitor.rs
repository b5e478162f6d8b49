//! 监控门面
//!
//! 数据库访问层的拦截点只和这里打交道：事务开始与结束、查询执行、锁事件。
//! 门面把事实写入事务存储和死锁检测器，再交给上报器异步发送。

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MonitorConfig;
use crate::metrics::{MetricsPublisher, PublisherReport};
use crate::transactions::{
    DeadlockEvent, DeadlockStats, QueryExecution, TransactionId, TransactionMetrics,
    TransactionStatus, TransactionStore, WaitForGraphDetector,
};

/// 监控统计报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorReport {
    pub active_transactions: usize,
    pub bound_connections: usize,
    pub deadlock: DeadlockStats,
    pub publisher: PublisherReport,
}

/// 事务监控器
pub struct TransactionMonitor {
    store: Arc<TransactionStore>,
    detector: Arc<WaitForGraphDetector>,
    publisher: Arc<MetricsPublisher>,
    config: MonitorConfig,
    exposed: AtomicBool,
}

impl TransactionMonitor {
    pub fn new(config: MonitorConfig, publisher: MetricsPublisher) -> Self {
        Self {
            store: Arc::new(TransactionStore::new()),
            detector: Arc::new(WaitForGraphDetector::new()),
            publisher: Arc::new(publisher),
            config,
            exposed: AtomicBool::new(false),
        }
    }

    /// 开启事务并生成事务ID
    pub fn on_transaction_begin(&self, connection_id: &str) -> TransactionId {
        let transaction_id = uuid::Uuid::new_v4().to_string();
        self.begin_transaction(connection_id, &transaction_id);
        transaction_id
    }

    /// 使用调用方给定的事务ID开启事务
    ///
    /// 连接上未结束的旧事务按回滚处理：释放它的锁并上报
    pub fn begin_transaction(&self, connection_id: &str, transaction_id: &str) {
        if let Some(abandoned) = self.store.register_transaction(connection_id, transaction_id) {
            self.detector.on_transaction_completed(&abandoned.transaction_id);
            self.publisher.publish_transaction(&abandoned);
        }
    }

    /// 记录一次查询执行，`error` 为失败原因
    ///
    /// 指标总会上报；连接没有绑定事务时只有开启了隐式事务才会记录到存储
    pub fn on_query_executed(
        &self,
        connection_id: &str,
        sql: &str,
        duration: Duration,
        error: Option<&str>,
    ) {
        let mut query = QueryExecution::new(sql, duration);
        if let Some(message) = error {
            query = query.failed(message);
        }

        let thread = std::thread::current();
        let thread_label = thread.name().unwrap_or("unnamed");
        self.publisher.publish_query(&query, connection_id, thread_label);

        if self.store.record_query(connection_id, query.clone()) {
            return;
        }
        let unbound = self
            .store
            .transaction_for(connection_id)
            .map_or(true, |tx| !self.store.contains_transaction(&tx));
        if self.config.implicit_transactions && unbound {
            let transaction_id = self.on_transaction_begin(connection_id);
            debug!(connection_id, %transaction_id, "implicit transaction started");
            self.store.record_query(connection_id, query);
        }
    }

    /// 记录锁请求并立即检测死锁，检测到时上报并返回事件
    pub fn on_lock_requested(&self, transaction_id: &str, resource: &str) -> Option<DeadlockEvent> {
        self.detector.on_lock_requested(transaction_id, resource);
        let event = self.detector.check_for_deadlock()?;
        self.publisher.publish_deadlock(&event);
        Some(event)
    }

    pub fn on_lock_acquired(&self, transaction_id: &str, resource: &str) -> bool {
        self.detector.on_lock_acquired(transaction_id, resource)
    }

    pub fn on_lock_released(&self, transaction_id: &str, resource: &str) {
        self.detector.on_lock_released(transaction_id, resource);
    }

    pub fn set_rollback_cost(&self, transaction_id: &str, cost: i64) {
        self.detector.set_rollback_cost(transaction_id, cost);
    }

    pub fn on_commit(&self, connection_id: &str) -> Option<TransactionMetrics> {
        self.complete(connection_id, TransactionStatus::Committed)
    }

    pub fn on_rollback(&self, connection_id: &str) -> Option<TransactionMetrics> {
        self.complete(connection_id, TransactionStatus::RolledBack)
    }

    fn complete(&self, connection_id: &str, status: TransactionStatus) -> Option<TransactionMetrics> {
        let metrics = self.store.complete_transaction(connection_id, status)?;
        self.detector.on_transaction_completed(&metrics.transaction_id);
        self.publisher.publish_transaction(&metrics);
        Some(metrics)
    }

    /// 清理孤儿事务并释放它们在检测器中的资源
    ///
    /// 只出现在锁事件中、事务存储里没有的事务按最近一次锁事件计算空闲时间
    pub fn cleanup_orphans(&self, max_age: Duration) -> Vec<TransactionId> {
        let mut evicted = self.store.cleanup_orphans(max_age);
        for transaction_id in &evicted {
            self.detector.on_transaction_completed(transaction_id);
        }
        let store = &self.store;
        evicted.extend(
            self.detector
                .sweep_idle(max_age, |tx| store.contains_transaction(tx)),
        );
        evicted
    }

    /// 启动定期孤儿清理任务
    pub fn spawn_housekeeping(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.housekeeping_interval);
            loop {
                ticker.tick().await;
                let evicted = monitor.cleanup_orphans(monitor.config.orphan_max_age);
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "housekeeping evicted orphans");
                }
            }
        })
    }

    /// 开启定期统计输出；重复调用返回 None
    pub fn expose_metrics(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.exposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let monitor = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.stats_interval);
            loop {
                ticker.tick().await;
                let report = monitor.stats();
                info!(
                    active_transactions = report.active_transactions,
                    deadlocks = report.deadlock.deadlocks_detected,
                    published = report.publisher.sent,
                    dropped = report.publisher.dropped,
                    "transaction monitor stats"
                );
            }
        }))
    }

    pub fn stats(&self) -> MonitorReport {
        MonitorReport {
            active_transactions: self.store.active_count(),
            bound_connections: self.store.bound_connections(),
            deadlock: self.detector.stats(),
            publisher: self.publisher.stats().report(),
        }
    }

    pub fn store(&self) -> &Arc<TransactionStore> {
        &self.store
    }

    pub fn detector(&self) -> &Arc<WaitForGraphDetector> {
        &self.detector
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// 等待上报队列处理完
    ///
    /// 仍有其他 `Arc` 持有监控器时（例如后台任务未终止）只能放弃等待
    pub async fn shutdown(self) {
        match Arc::try_unwrap(self.publisher) {
            Ok(publisher) => publisher.shutdown().await,
            Err(_) => debug!("publisher still shared, skipping drain"),
        }
    }
}
