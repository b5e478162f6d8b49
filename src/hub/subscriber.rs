//! 订阅者连接
//!
//! 状态机：CONNECTING -> OPEN -> CLOSING -> CLOSED，只能向前迁移；
//! 握手失败时允许 CONNECTING -> CLOSING

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::error::HubError;
use crate::hub::message::BroadcastMessage;

/// 订阅者ID
pub type SubscriberId = u64;

/// 订阅者连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriberState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SubscriberState {
    /// 是否允许迁移到 `next`
    pub fn can_transition_to(self, next: SubscriberState) -> bool {
        use SubscriberState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }
}

/// 投递失败的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// 发送队列已满（慢消费者）
    QueueFull,
    /// 发送队列已关闭
    Closed,
}

/// 单个订阅者
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    state: Mutex<SubscriberState>,
    /// 发送端，关闭时取出并丢弃
    sender: Mutex<Option<mpsc::Sender<Arc<BroadcastMessage>>>>,
    last_seen: Mutex<Instant>,
}

impl Subscriber {
    pub(crate) fn new(id: SubscriberId, sender: mpsc::Sender<Arc<BroadcastMessage>>) -> Self {
        Self {
            id,
            state: Mutex::new(SubscriberState::Connecting),
            sender: Mutex::new(Some(sender)),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock()
    }

    /// 状态迁移
    pub fn transition(&self, next: SubscriberState) -> Result<(), HubError> {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return Err(HubError::InvalidTransition { from: *state, to: next });
        }
        *state = next;
        Ok(())
    }

    /// 连接已释放：CLOSING -> CLOSED
    pub fn mark_closed(&self) -> Result<(), HubError> {
        self.transition(SubscriberState::Closed)
    }

    /// 记录一次对端活动（包括 pong）
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// 距上一次对端活动的时长
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// 非阻塞投递
    pub(crate) fn try_deliver(&self, message: Arc<BroadcastMessage>) -> Result<(), DeliveryFailure> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(DeliveryFailure::Closed);
        };
        sender.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryFailure::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    /// 关闭发送队列并进入 CLOSING；只有第一次调用生效
    pub(crate) fn close(&self) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        drop(sender);
        let mut state = self.state.lock();
        if state.can_transition_to(SubscriberState::Closing) {
            *state = SubscriberState::Closing;
        }
        true
    }
}

/// 注册后返回给连接任务的句柄
#[derive(Debug)]
pub struct SubscriberHandle {
    pub subscriber: Arc<Subscriber>,
    pub receiver: mpsc::Receiver<Arc<BroadcastMessage>>,
}

impl SubscriberHandle {
    pub fn id(&self) -> SubscriberId {
        self.subscriber.id()
    }

    /// 接收下一条消息；队列关闭且取空后返回 None
    pub async fn recv(&mut self) -> Option<Arc<BroadcastMessage>> {
        self.receiver.recv().await
    }
}
