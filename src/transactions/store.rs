// 事务存储
//
// 记录每个连接当前绑定的事务，以及每个事务正在做什么
// - 连接 -> 事务、事务ID -> 上下文 两张并发表，无全局锁
// - 单个事务的修改由它自己的互斥锁串行化

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::transactions::model::{
    ConnectionId, QueryExecution, Transaction, TransactionId, TransactionMetrics,
    TransactionStatus,
};

/// 单个事务的上下文句柄
pub type TransactionContext = Arc<Mutex<Transaction>>;

/// 事务存储
///
/// 每个进程构造一个实例并把句柄传给调用方
#[derive(Debug, Default)]
pub struct TransactionStore {
    /// 连接绑定：connection_id -> transaction_id
    bindings: DashMap<ConnectionId, TransactionId>,
    /// 活动事务：transaction_id -> 上下文
    transactions: DashMap<TransactionId, TransactionContext>,
}

impl TransactionStore {
    /// 创建新的事务存储
    pub fn new() -> Self {
        Self::default()
    }

    /// 把连接绑定到事务，事务不存在时创建
    ///
    /// 连接原先绑定的事务没有提交或回滚、且不再被其他连接使用时，按回滚处理并返回它的指标
    pub fn register_transaction(
        &self,
        connection_id: &str,
        transaction_id: &str,
    ) -> Option<TransactionMetrics> {
        self.transactions
            .entry(transaction_id.to_string())
            .or_insert_with(|| {
                debug!(transaction_id, connection_id, "transaction registered");
                Arc::new(Mutex::new(Transaction::new(transaction_id, connection_id)))
            });

        let previous = self
            .bindings
            .insert(connection_id.to_string(), transaction_id.to_string())?;
        if previous == transaction_id {
            return None;
        }

        warn!(
            connection_id,
            %previous,
            transaction_id,
            "connection rebound before its transaction completed"
        );
        self.abandon(&previous)
    }

    /// 记录查询
    ///
    /// 连接未绑定事务或事务已结束时静默丢弃，返回 false
    pub fn record_query(&self, connection_id: &str, query: QueryExecution) -> bool {
        let Some(context) = self.context_for(connection_id) else {
            return false;
        };
        let mut tx = context.lock();
        tx.add_query(query)
    }

    /// 完成事务
    ///
    /// 解除连接绑定、移出活动表并返回指标快照
    pub fn complete_transaction(
        &self,
        connection_id: &str,
        final_status: TransactionStatus,
    ) -> Option<TransactionMetrics> {
        if !final_status.is_terminal() {
            return None;
        }

        let (_, transaction_id) = self.bindings.remove(connection_id)?;
        let (_, context) = self.transactions.remove(&transaction_id)?;
        // 同一事务可能被多个连接绑定，一并解除
        self.bindings.retain(|_, bound| *bound != transaction_id);

        let mut tx = context.lock();
        if !tx.finish(final_status) {
            return None;
        }
        debug!(
            transaction_id = %tx.id,
            status = %tx.status,
            queries = tx.query_count(),
            "transaction completed"
        );
        Some(tx.metrics())
    }

    /// 清理孤儿事务
    ///
    /// 空闲超过 `max_age` 的活动事务被强制移除，返回被移除的事务ID
    pub fn cleanup_orphans(&self, max_age: Duration) -> Vec<TransactionId> {
        let expired: Vec<(TransactionId, ConnectionId)> = self
            .transactions
            .iter()
            .filter_map(|entry| {
                let tx = entry.value().lock();
                (!tx.is_completed() && tx.idle_for() > max_age)
                    .then(|| (tx.id.clone(), tx.connection_id.clone()))
            })
            .collect();

        let mut evicted = Vec::with_capacity(expired.len());
        for (transaction_id, connection_id) in expired {
            // 复查：扫描之后事务可能又有了活动
            let removed = self.transactions.remove_if(&transaction_id, |_, context| {
                let tx = context.lock();
                !tx.is_completed() && tx.idle_for() > max_age
            });
            let Some((_, context)) = removed else {
                continue;
            };

            self.bindings
                .remove_if(&connection_id, |_, bound| *bound == transaction_id);

            let tx = context.lock();
            warn!(
                transaction_id = %tx.id,
                connection_id = %tx.connection_id,
                idle_ms = tx.idle_for().as_millis() as u64,
                queries = tx.query_count(),
                "evicting orphaned transaction"
            );
            evicted.push(transaction_id);
        }

        evicted
    }

    /// 回滚一个已经没有连接绑定的事务
    fn abandon(&self, transaction_id: &str) -> Option<TransactionMetrics> {
        if self.bindings.iter().any(|entry| entry.value() == transaction_id) {
            return None;
        }
        let (_, context) = self.transactions.remove(transaction_id)?;
        let mut tx = context.lock();
        if !tx.finish(TransactionStatus::RolledBack) {
            return None;
        }
        Some(tx.metrics())
    }

    /// 事务是否仍处于活动表中
    pub fn contains_transaction(&self, transaction_id: &str) -> bool {
        self.transactions.contains_key(transaction_id)
    }

    /// 获取事务快照
    pub fn transaction(&self, transaction_id: &str) -> Option<Transaction> {
        let context = self.transactions.get(transaction_id)?.value().clone();
        let tx = context.lock();
        Some(tx.clone())
    }

    /// 获取连接当前绑定的事务ID
    pub fn transaction_for(&self, connection_id: &str) -> Option<TransactionId> {
        self.bindings.get(connection_id).map(|id| id.value().clone())
    }

    /// 活动事务数量
    pub fn active_count(&self) -> usize {
        self.transactions.len()
    }

    /// 已绑定的连接数量
    pub fn bound_connections(&self) -> usize {
        self.bindings.len()
    }

    fn context_for(&self, connection_id: &str) -> Option<TransactionContext> {
        // 先释放 bindings 的分片锁，再访问 transactions
        let transaction_id = self.transaction_for(connection_id)?;
        self.transactions
            .get(&transaction_id)
            .map(|context| context.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str, ms: u64) -> QueryExecution {
        QueryExecution::new(sql, Duration::from_millis(ms))
    }

    #[test]
    fn test_register_is_idempotent() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-1");
        store.record_query("conn-1", query("SELECT 1", 1));
        store.register_transaction("conn-1", "tx-1");

        assert_eq!(store.active_count(), 1);
        assert_eq!(store.transaction("tx-1").unwrap().query_count(), 1);
    }

    #[test]
    fn test_record_without_binding_is_noop() {
        let store = TransactionStore::new();
        assert!(!store.record_query("conn-x", query("SELECT 1", 1)));
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn test_complete_returns_metrics() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-1");
        store.record_query("conn-1", query("SELECT * FROM a", 5));
        store.record_query("conn-1", query("UPDATE a SET x = 1", 8));

        let metrics = store
            .complete_transaction("conn-1", TransactionStatus::Committed)
            .unwrap();
        assert_eq!(metrics.query_count, 2);
        assert_eq!(metrics.total_execution_time_ms, 13);
        assert_eq!(metrics.status, TransactionStatus::Committed);
        assert!(metrics.end_time.is_some());

        assert_eq!(store.active_count(), 0);
        assert!(store.transaction_for("conn-1").is_none());
    }

    #[test]
    fn test_complete_unknown_or_active_status() {
        let store = TransactionStore::new();
        assert!(store
            .complete_transaction("conn-1", TransactionStatus::Committed)
            .is_none());

        store.register_transaction("conn-1", "tx-1");
        assert!(store
            .complete_transaction("conn-1", TransactionStatus::Active)
            .is_none());
        // 非法的目标状态不会解除绑定
        assert_eq!(store.transaction_for("conn-1").as_deref(), Some("tx-1"));
    }

    #[test]
    fn test_cleanup_orphans() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-old");
        std::thread::sleep(Duration::from_millis(30));
        store.register_transaction("conn-2", "tx-new");

        let evicted = store.cleanup_orphans(Duration::from_millis(20));
        assert_eq!(evicted, vec!["tx-old".to_string()]);
        assert_eq!(store.active_count(), 1);
        assert!(store.transaction_for("conn-1").is_none());
        assert_eq!(store.transaction_for("conn-2").as_deref(), Some("tx-new"));
    }

    #[test]
    fn test_rebind_rolls_back_previous() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-old");
        store.record_query("conn-1", query("UPDATE a SET x = 1", 4));

        let abandoned = store.register_transaction("conn-1", "tx-new").unwrap();
        assert_eq!(abandoned.transaction_id, "tx-old");
        assert_eq!(abandoned.status, TransactionStatus::RolledBack);
        assert_eq!(abandoned.query_count, 1);

        assert!(!store.contains_transaction("tx-old"));
        assert_eq!(store.transaction_for("conn-1").as_deref(), Some("tx-new"));
        assert_eq!(store.active_count(), 1);
    }

    #[test]
    fn test_rebind_keeps_shared_transaction() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-1");
        store.register_transaction("conn-2", "tx-1");

        // conn-2 仍绑定 tx-1，不能回滚
        assert!(store.register_transaction("conn-1", "tx-2").is_none());
        assert!(store.contains_transaction("tx-1"));
    }

    #[test]
    fn test_complete_releases_every_binding() {
        let store = TransactionStore::new();
        store.register_transaction("conn-1", "tx-1");
        store.register_transaction("conn-2", "tx-1");

        store
            .complete_transaction("conn-1", TransactionStatus::Committed)
            .unwrap();
        assert_eq!(store.bound_connections(), 0);
        assert!(store.transaction_for("conn-2").is_none());
        assert!(store
            .complete_transaction("conn-2", TransactionStatus::Committed)
            .is_none());
    }
}
