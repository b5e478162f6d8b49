//! 上报事件的线上格式
//!
//! 每个事件序列化为一个 JSON 对象：
//! `{timestamp, pod_name?, namespace?, event_type, data, metrics}`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transactions::{
    DeadlockEvent, DeadlockType, QueryExecution, QueryStatus, SqlType, TransactionMetrics,
    TransactionStatus,
};

/// 查询执行事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryEventData {
    pub query_id: String,
    pub sql_pattern: String,
    pub sql_type: SqlType,
    pub execution_time_ms: u64,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub connection_id: String,
    pub thread_name: String,
}

impl QueryEventData {
    pub fn new(query: &QueryExecution, connection_id: &str, thread_name: &str) -> Self {
        Self {
            query_id: query.query_id.clone(),
            sql_pattern: query.sql_pattern.clone(),
            sql_type: query.sql_type,
            execution_time_ms: query.execution_time_ms(),
            status: query.status,
            error_message: query.error_message.clone(),
            connection_id: connection_id.to_string(),
            thread_name: thread_name.to_string(),
        }
    }
}

/// 事务结束事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEventData {
    pub transaction_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: TransactionStatus,
    pub duration_ms: u64,
    pub query_count: usize,
    pub total_execution_time_ms: u64,
}

impl From<&TransactionMetrics> for TransactionEventData {
    fn from(metrics: &TransactionMetrics) -> Self {
        Self {
            transaction_id: metrics.transaction_id.clone(),
            start_time: metrics.start_time,
            end_time: metrics.end_time,
            status: metrics.status,
            duration_ms: metrics.duration_ms,
            query_count: metrics.query_count,
            total_execution_time_ms: metrics.total_execution_time_ms,
        }
    }
}

/// 死锁严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlockSeverity {
    High,
    Critical,
}

impl DeadlockSeverity {
    /// 两个事务互等为 HIGH，三个及以上的环为 CRITICAL
    pub fn for_cycle_length(len: usize) -> Self {
        if len >= 3 {
            DeadlockSeverity::Critical
        } else {
            DeadlockSeverity::High
        }
    }
}

/// 死锁处理状态；检测器只做检测，所以总是 DETECTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlockStatus {
    Detected,
}

/// 死锁事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockEventData {
    pub id: String,
    #[serde(rename = "type")]
    pub deadlock_type: DeadlockType,
    pub participants: Vec<String>,
    pub detection_time: DateTime<Utc>,
    pub recommended_victim: String,
    pub lock_chain: Vec<String>,
    pub severity: DeadlockSeverity,
    pub status: DeadlockStatus,
    pub cycle_length: usize,
}

impl From<&DeadlockEvent> for DeadlockEventData {
    fn from(event: &DeadlockEvent) -> Self {
        Self {
            id: event.id.clone(),
            deadlock_type: event.deadlock_type,
            participants: event.participants.clone(),
            detection_time: event.detected_at,
            recommended_victim: event.victim.clone(),
            lock_chain: event.lock_chain.iter().map(|link| link.to_string()).collect(),
            severity: DeadlockSeverity::for_cycle_length(event.cycle_length()),
            status: DeadlockStatus::Detected,
            cycle_length: event.cycle_length(),
        }
    }
}

/// 监控事件（线上 `event_type` + `data` 两个字段）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum MonitorEvent {
    QueryExecution(QueryEventData),
    TransactionEvent(TransactionEventData),
    DeadlockEvent(DeadlockEventData),
}

impl MonitorEvent {
    /// 线上的 event_type 标签
    pub fn event_type(&self) -> &'static str {
        match self {
            MonitorEvent::QueryExecution(_) => "query_execution",
            MonitorEvent::TransactionEvent(_) => "transaction_event",
            MonitorEvent::DeadlockEvent(_) => "deadlock_event",
        }
    }

    /// 只序列化 data 部分
    pub fn data_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            MonitorEvent::QueryExecution(data) => serde_json::to_value(data),
            MonitorEvent::TransactionEvent(data) => serde_json::to_value(data),
            MonitorEvent::DeadlockEvent(data) => serde_json::to_value(data),
        }
    }
}

/// 进程级资源指标快照
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemGauges {
    pub connection_pool_active: u64,
    pub connection_pool_max: u64,
    pub heap_usage_ratio: f64,
    pub cpu_usage_ratio: f64,
}

/// 完整的上报载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsPayload {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(flatten)]
    pub event: MonitorEvent,
    #[serde(default)]
    pub metrics: SystemGauges,
}

impl MetricsPayload {
    pub fn new(event: MonitorEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            pod_name: None,
            namespace: None,
            event,
            metrics: SystemGauges::default(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::LockChainLink;
    use serde_json::json;

    fn deadlock(participants: &[&str]) -> DeadlockEvent {
        DeadlockEvent {
            id: "dl-1".to_string(),
            participants: participants.iter().map(|p| p.to_string()).collect(),
            deadlock_type: DeadlockType::CircularWait,
            victim: participants[0].to_string(),
            detected_at: Utc::now(),
            lock_chain: vec![LockChainLink {
                waiter: "a".to_string(),
                resource: "row:1".to_string(),
                holder: "b".to_string(),
            }],
        }
    }

    #[test]
    fn test_payload_wire_shape() {
        let query = QueryExecution::with_id("q-1", "SELECT * FROM t WHERE id = 9", Default::default());
        let mut payload = MetricsPayload::new(MonitorEvent::QueryExecution(QueryEventData::new(
            &query, "conn-1", "worker-3",
        )));
        payload.pod_name = Some("orders-1".to_string());

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["event_type"], "query_execution");
        assert_eq!(value["pod_name"], "orders-1");
        assert!(value.get("namespace").is_none());
        assert_eq!(value["data"]["sql_pattern"], "SELECT * FROM t WHERE id = ?");
        assert_eq!(value["data"]["sql_type"], "SELECT");
        assert_eq!(value["data"]["status"], "SUCCESS");
        assert_eq!(value["data"]["thread_name"], "worker-3");
        assert_eq!(value["metrics"]["connection_pool_max"], 0);
    }

    #[test]
    fn test_deadlock_data_uses_camel_case() {
        let data = DeadlockEventData::from(&deadlock(&["a", "b", "c"]));
        let value = serde_json::to_value(&data).unwrap();

        assert_eq!(value["recommendedVictim"], "a");
        assert_eq!(value["cycleLength"], 3);
        assert_eq!(value["severity"], "CRITICAL");
        assert_eq!(value["status"], "DETECTED");
        assert_eq!(value["type"], "CIRCULAR_WAIT");
        assert_eq!(value["lockChain"], json!(["a -> b (row:1)"]));
        assert!(value.get("detectionTime").is_some());
    }

    #[test]
    fn test_parse_inbound_payload() {
        let raw = json!({
            "timestamp": "2026-01-02T03:04:05Z",
            "event_type": "transaction_event",
            "data": {
                "transaction_id": "tx-1",
                "start_time": "2026-01-02T03:04:00Z",
                "end_time": "2026-01-02T03:04:05Z",
                "status": "COMMITTED",
                "duration_ms": 5000,
                "query_count": 2,
                "total_execution_time_ms": 13
            }
        });

        let payload: MetricsPayload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.event_type(), "transaction_event");
        assert_eq!(payload.metrics, SystemGauges::default());
        match payload.event {
            MonitorEvent::TransactionEvent(data) => {
                assert_eq!(data.status, TransactionStatus::Committed);
                assert_eq!(data.total_execution_time_ms, 13);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let raw = json!({
            "timestamp": "2026-01-02T03:04:05Z",
            "event_type": "heap_dump",
            "data": {}
        });
        assert!(serde_json::from_value::<MetricsPayload>(raw).is_err());
    }
}
