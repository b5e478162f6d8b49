// 事务与查询数据模型
//
// 定义被监控事务的状态、查询执行记录以及完成时的指标快照

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::transactions::sql::{normalize_sql, SqlType};

/// 事务ID（由调用方提供的不透明字符串）
pub type TransactionId = String;
/// 数据库连接ID
pub type ConnectionId = String;
/// 资源ID（行、表、页等，由调用方决定粒度）
pub type ResourceId = String;

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// 活动中
    Active,
    /// 已提交
    Committed,
    /// 已回滚
    RolledBack,
}

impl TransactionStatus {
    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Active => write!(f, "ACTIVE"),
            TransactionStatus::Committed => write!(f, "COMMITTED"),
            TransactionStatus::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// 查询执行结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Success,
    Error,
}

/// 查询执行记录
///
/// 记录后不可变，只会追加到事务的查询列表中
#[derive(Debug, Clone, PartialEq)]
pub struct QueryExecution {
    /// 查询ID
    pub query_id: String,
    /// 归一化后的 SQL（字面量替换为占位符）
    pub sql_pattern: String,
    /// 语句类型
    pub sql_type: SqlType,
    /// 执行耗时
    pub execution_time: Duration,
    /// 执行时间戳
    pub timestamp: DateTime<Utc>,
    /// 执行结果
    pub status: QueryStatus,
    /// 错误信息
    pub error_message: Option<String>,
    /// 在所属事务中的序号（记录时分配）
    pub sequence: u64,
}

impl QueryExecution {
    /// 创建成功的查询记录，自动生成查询ID
    pub fn new(sql: &str, execution_time: Duration) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), sql, execution_time)
    }

    /// 使用调用方提供的查询ID
    pub fn with_id(query_id: impl Into<String>, sql: &str, execution_time: Duration) -> Self {
        Self {
            query_id: query_id.into(),
            sql_pattern: normalize_sql(sql),
            sql_type: SqlType::infer(sql),
            execution_time,
            timestamp: Utc::now(),
            status: QueryStatus::Success,
            error_message: None,
            sequence: 0,
        }
    }

    /// 标记为失败
    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.status = QueryStatus::Error;
        self.error_message = Some(message.into());
        self
    }

    /// 执行耗时（毫秒）
    pub fn execution_time_ms(&self) -> u64 {
        self.execution_time.as_millis() as u64
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }
}

/// 被监控的事务
#[derive(Debug, Clone)]
pub struct Transaction {
    /// 事务ID
    pub id: TransactionId,
    /// 绑定的连接
    pub connection_id: ConnectionId,
    /// 开始时间（墙钟）
    pub start_time: DateTime<Utc>,
    /// 开始时间（单调时钟，用于计算时长）
    pub started_at: Instant,
    /// 最近一次活动时间，孤儿清理按它判断
    pub last_activity: Instant,
    /// 事务状态
    pub status: TransactionStatus,
    /// 结束时间，只在状态离开 Active 时设置一次
    pub end_time: Option<DateTime<Utc>>,
    /// 已执行的查询
    pub queries: Vec<QueryExecution>,
    /// 查询序号计数器
    pub query_sequence: u64,
}

impl Transaction {
    /// 创建新事务
    pub fn new(id: impl Into<TransactionId>, connection_id: impl Into<ConnectionId>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            connection_id: connection_id.into(),
            start_time: Utc::now(),
            started_at: now,
            last_activity: now,
            status: TransactionStatus::Active,
            end_time: None,
            queries: Vec::new(),
            query_sequence: 0,
        }
    }

    /// 追加查询；事务已完成时返回 false
    pub fn add_query(&mut self, mut query: QueryExecution) -> bool {
        if self.is_completed() {
            return false;
        }
        self.query_sequence += 1;
        query.sequence = self.query_sequence;
        self.queries.push(query);
        self.last_activity = Instant::now();
        true
    }

    /// 获取查询数量
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    /// 所有查询执行耗时之和
    pub fn total_execution_time(&self) -> Duration {
        self.queries.iter().map(|q| q.execution_time).sum()
    }

    /// 是否已完成
    pub fn is_completed(&self) -> bool {
        self.status.is_terminal()
    }

    /// 状态迁移到终止状态
    ///
    /// 只有 Active 事务可以迁移，且目标必须是终止状态
    pub fn finish(&mut self, status: TransactionStatus) -> bool {
        if self.is_completed() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        true
    }

    /// 距最近一次活动的时长
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// 生成指标快照
    pub fn metrics(&self) -> TransactionMetrics {
        TransactionMetrics {
            transaction_id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status,
            query_count: self.query_count(),
            total_execution_time_ms: self.total_execution_time().as_millis() as u64,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

/// 事务完成时的指标快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub transaction_id: TransactionId,
    pub connection_id: ConnectionId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub query_count: usize,
    pub total_execution_time_ms: u64,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_query_assigns_sequence() {
        let mut tx = Transaction::new("tx-1", "conn-1");
        assert!(tx.add_query(QueryExecution::new("SELECT 1", Duration::from_millis(3))));
        assert!(tx.add_query(QueryExecution::new("SELECT 2", Duration::from_millis(4))));

        assert_eq!(tx.query_sequence, 2);
        assert_eq!(tx.queries[0].sequence, 1);
        assert_eq!(tx.queries[1].sequence, 2);
        assert_eq!(tx.total_execution_time(), Duration::from_millis(7));
    }

    #[test]
    fn test_finish_only_once() {
        let mut tx = Transaction::new("tx-1", "conn-1");
        assert!(tx.finish(TransactionStatus::Committed));
        let end = tx.end_time;
        assert!(end.is_some());

        // 终止后不能再迁移
        assert!(!tx.finish(TransactionStatus::RolledBack));
        assert_eq!(tx.status, TransactionStatus::Committed);
        assert_eq!(tx.end_time, end);
    }

    #[test]
    fn test_finish_rejects_active_target() {
        let mut tx = Transaction::new("tx-1", "conn-1");
        assert!(!tx.finish(TransactionStatus::Active));
        assert!(tx.end_time.is_none());
    }

    #[test]
    fn test_completed_transaction_rejects_queries() {
        let mut tx = Transaction::new("tx-1", "conn-1");
        tx.finish(TransactionStatus::RolledBack);
        assert!(!tx.add_query(QueryExecution::new("SELECT 1", Duration::ZERO)));
        assert_eq!(tx.query_count(), 0);
    }

    #[test]
    fn test_failed_query() {
        let q = QueryExecution::new("DELETE FROM t WHERE id = 3", Duration::from_millis(1))
            .failed("lock wait timeout");
        assert!(!q.is_success());
        assert_eq!(q.error_message.as_deref(), Some("lock wait timeout"));
        assert_eq!(q.sql_type, SqlType::Delete);
    }
}
