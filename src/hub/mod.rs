//! 广播中心
//!
//! 运行在采集进程中，把收到的事件扇出给所有在线订阅者：
//! - 每个订阅者有自己的有界队列，投递用 `try_send`，永不阻塞
//! - 队列满的慢订阅者直接被移除，不影响其他订阅者
//! - 心跳超时的订阅者由巡检任务移除

pub mod message;
pub mod subscriber;

pub use message::{BroadcastMessage, MessageKind};
pub use subscriber::{DeliveryFailure, Subscriber, SubscriberHandle, SubscriberId, SubscriberState};

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::error::{HubError, PublishError};
use crate::metrics::{MetricsPayload, MetricsTransport};

/// 广播中心统计
#[derive(Debug, Default)]
pub struct HubStats {
    published: AtomicU64,
    deliveries: AtomicU64,
    dropped_subscribers: AtomicU64,
    rejected_payloads: AtomicU64,
}

impl HubStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Relaxed)
    }

    /// 因队列满、队列关闭或心跳超时被移除的订阅者数
    pub fn dropped_subscribers(&self) -> u64 {
        self.dropped_subscribers.load(Ordering::Relaxed)
    }

    pub fn rejected_payloads(&self) -> u64 {
        self.rejected_payloads.load(Ordering::Relaxed)
    }
}

/// 广播中心统计报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubReport {
    pub subscribers: usize,
    pub published: u64,
    pub deliveries: u64,
    pub dropped_subscribers: u64,
    pub rejected_payloads: u64,
}

/// 广播中心
pub struct BroadcastHub {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    stats: HubStats,
}

impl BroadcastHub {
    /// 创建广播中心，`queue_capacity` 为每个订阅者的队列容量
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            stats: HubStats::default(),
        }
    }

    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.subscriber_queue_capacity)
    }

    /// 注册订阅者（握手完成后调用），返回的句柄处于 OPEN 状态
    pub fn register(&self) -> SubscriberHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let subscriber = Arc::new(Subscriber::new(id, sender));

        // CONNECTING -> OPEN 对新建的订阅者总是合法
        let _ = subscriber.transition(SubscriberState::Open);
        self.subscribers.insert(id, Arc::clone(&subscriber));
        debug!(subscriber_id = id, "subscriber registered");

        SubscriberHandle {
            subscriber,
            receiver,
        }
    }

    /// 注销订阅者并关闭它的发送队列；已注销时返回 false
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let Some((_, subscriber)) = self.subscribers.remove(&id) else {
            return false;
        };
        subscriber.close();
        debug!(subscriber_id = id, "subscriber unregistered");
        true
    }

    /// 投递到所有订阅者，返回成功投递数
    pub fn publish(&self, message: BroadcastMessage) -> usize {
        let message = Arc::new(message);
        let mut delivered = 0;
        let mut failed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_deliver(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(reason) => failed.push((*entry.key(), reason)),
            }
        }

        // 遍历结束后再移除，避免持有分片锁时写 map
        for (id, reason) in failed {
            if self.unregister(id) {
                self.stats.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber_id = id, ?reason, "dropping subscriber");
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// 解析并广播一条上报；格式错误只返回给发送方
    pub fn ingest(&self, body: &[u8]) -> Result<usize, HubError> {
        let payload: MetricsPayload = serde_json::from_slice(body).map_err(|err| {
            self.stats.rejected_payloads.fetch_add(1, Ordering::Relaxed);
            HubError::from(err)
        })?;
        self.publish_payload(&payload)
    }

    /// 广播一条已解析的上报
    pub fn publish_payload(&self, payload: &MetricsPayload) -> Result<usize, HubError> {
        let message = BroadcastMessage::from_payload(payload)?;
        Ok(self.publish(message))
    }

    /// 移除超过 `timeout` 没有任何活动的订阅者
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<SubscriberId> {
        let stale: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|entry| entry.value().idle_for() > timeout)
            .map(|entry| *entry.key())
            .collect();

        stale
            .into_iter()
            .filter(|&id| {
                let removed = self.unregister(id);
                if removed {
                    self.stats.dropped_subscribers.fetch_add(1, Ordering::Relaxed);
                    warn!(subscriber_id = id, "subscriber missed keep-alive, dropping");
                }
                removed
            })
            .collect()
    }

    /// 启动心跳巡检任务
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration, timeout: Duration) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                hub.sweep_stale(timeout);
            }
        })
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn subscriber_state(&self, id: SubscriberId) -> Option<SubscriberState> {
        self.subscribers.get(&id).map(|entry| entry.value().state())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stats(&self) -> &HubStats {
        &self.stats
    }

    pub fn report(&self) -> HubReport {
        HubReport {
            subscribers: self.subscriber_count(),
            published: self.stats.published(),
            deliveries: self.stats.deliveries(),
            dropped_subscribers: self.stats.dropped_subscribers(),
            rejected_payloads: self.stats.rejected_payloads(),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::from_config(&HubConfig::default())
    }
}

/// 进程内直连：上报器直接把事件交给同进程的广播中心
impl MetricsTransport for BroadcastHub {
    fn send<'a>(&'a self, payload: &'a MetricsPayload) -> BoxFuture<'a, Result<(), PublishError>> {
        let result = BroadcastMessage::from_payload(payload)
            .map(|message| {
                self.publish(message);
            })
            .map_err(PublishError::from);
        Box::pin(async move { result })
    }
}
