// 事务监控模块
//
// 提供进程内事务的跟踪与死锁检测：
// - 事务与查询的生命周期记录
// - SQL 归一化
// - 等待图死锁检测与受害者推荐

pub mod model;
pub mod sql;
pub mod store;
pub mod deadlock;

pub use model::{
    ConnectionId, QueryExecution, QueryStatus, ResourceId, Transaction, TransactionId,
    TransactionMetrics, TransactionStatus,
};
pub use sql::{normalize_sql, SqlType};
pub use store::{TransactionContext, TransactionStore};
pub use deadlock::{
    DeadlockEvent, DeadlockStats, DeadlockType, LockChainLink, WaitForGraphDetector, WaitGraph,
    WaitGraphStats,
};
