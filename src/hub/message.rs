//! 推送给订阅者的消息
//!
//! 线上格式 `{type, data, timestamp}`，`type` 与上报的 `event_type` 对应，
//! 其中 `query_execution` 为兼容旧订阅者映射为 `query_metrics`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::{MetricsPayload, MonitorEvent};

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    QueryMetrics,
    TransactionEvent,
    DeadlockEvent,
}

impl From<&MonitorEvent> for MessageKind {
    fn from(event: &MonitorEvent) -> Self {
        match event {
            MonitorEvent::QueryExecution(_) => MessageKind::QueryMetrics,
            MonitorEvent::TransactionEvent(_) => MessageKind::TransactionEvent,
            MonitorEvent::DeadlockEvent(_) => MessageKind::DeadlockEvent,
        }
    }
}

/// 广播消息，创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn new(kind: MessageKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// 从上报载荷构造；资源指标和来源信息并入 data
    pub fn from_payload(payload: &MetricsPayload) -> serde_json::Result<Self> {
        let mut data = payload.event.data_value()?;
        if let Some(object) = data.as_object_mut() {
            object.insert("metrics".to_string(), serde_json::to_value(&payload.metrics)?);
            if let Some(pod_name) = &payload.pod_name {
                object.insert("pod_name".to_string(), pod_name.clone().into());
            }
            if let Some(namespace) = &payload.namespace {
                object.insert("namespace".to_string(), namespace.clone().into());
            }
        }

        Ok(Self {
            kind: MessageKind::from(&payload.event),
            payload: data,
            timestamp: payload.timestamp,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
