//! 错误类型
//!
//! 监控埋点侧的误用（未知连接、未知事务）不会产生错误，只做静默忽略；
//! 这里只定义上报和广播中心会遇到的错误

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::hub::SubscriberState;

/// 指标上报错误
#[derive(Debug, Error)]
pub enum PublishError {
    /// 发送队列已满
    #[error("publish queue is full")]
    QueueFull,
    /// 后台发送任务已停止
    #[error("publisher worker has stopped")]
    WorkerStopped,
    /// 发送超时
    #[error("send timed out after {0} ms")]
    Timeout(u64),
    /// 采集端返回非成功状态
    #[error("collector responded with status {0}")]
    Status(u16),
    /// 网络错误
    #[error("transport error: {0}")]
    Transport(String),
    /// 序列化失败
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PublishError::Status(status.as_u16()),
            None => PublishError::Transport(err.to_string()),
        }
    }
}

/// 广播中心错误
#[derive(Debug, Error)]
pub enum HubError {
    /// 上报内容无法解析
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    /// 非法的订阅者状态迁移
    #[error("invalid subscriber transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: SubscriberState,
        to: SubscriberState,
    },
}

impl HubError {
    fn status_code(&self) -> StatusCode {
        match self {
            HubError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            HubError::InvalidTransition { .. } => StatusCode::CONFLICT,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::MalformedPayload(err.to_string())
    }
}
