//! 指标上报模块
//!
//! 把事务、查询和死锁事实转换为线上事件，异步发送到采集端

pub mod event;
pub mod gauges;
pub mod publisher;

pub use event::{
    DeadlockEventData, DeadlockSeverity, DeadlockStatus, MetricsPayload, MonitorEvent,
    QueryEventData, SystemGauges, TransactionEventData,
};
pub use gauges::{ConnectionPoolGauge, GaugeSource, ProcessGauges};
pub use publisher::{
    HttpTransport, MetricsPublisher, MetricsTransport, PublisherReport, PublisherStats,
};
