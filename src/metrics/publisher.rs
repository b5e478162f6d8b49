//! 指标异步上报
//!
//! 调用方只把事件放进有界队列，由一个后台任务负责序列化和网络发送：
//! - 入队永不阻塞，队列满时丢弃新事件
//! - 每个事件只尝试发送一次，超时或失败记录日志后丢弃

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PublisherConfig;
use crate::error::PublishError;
use crate::metrics::event::{
    DeadlockEventData, MetricsPayload, MonitorEvent, QueryEventData, SystemGauges,
    TransactionEventData,
};
use crate::metrics::gauges::GaugeSource;
use crate::transactions::{DeadlockEvent, QueryExecution, TransactionMetrics};

/// 上报通道
pub trait MetricsTransport: Send + Sync + 'static {
    /// 发送一个载荷；超时由调用方控制
    fn send<'a>(&'a self, payload: &'a MetricsPayload) -> BoxFuture<'a, Result<(), PublishError>>;
}

/// 通过 HTTP POST JSON 发送到采集端
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl MetricsTransport for HttpTransport {
    fn send<'a>(&'a self, payload: &'a MetricsPayload) -> BoxFuture<'a, Result<(), PublishError>> {
        Box::pin(async move {
            self.client
                .post(&self.endpoint)
                .json(payload)
                .send()
                .await?
                .error_for_status()?;
            Ok(())
        })
    }
}

/// 上报统计
#[derive(Debug, Default)]
pub struct PublisherStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl PublisherStats {
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// 入队时被丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// 发送失败或超时的事件数
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn report(&self) -> PublisherReport {
        PublisherReport {
            enqueued: self.enqueued(),
            dropped: self.dropped(),
            sent: self.sent(),
            failed: self.failed(),
        }
    }
}

/// 上报统计报告
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PublisherReport {
    pub enqueued: u64,
    pub dropped: u64,
    pub sent: u64,
    pub failed: u64,
}

/// 等待发送的事件
struct PendingEvent {
    queued_at: DateTime<Utc>,
    event: MonitorEvent,
}

/// 后台任务使用的配置
struct WorkerContext {
    transport: Arc<dyn MetricsTransport>,
    gauges: Arc<dyn GaugeSource>,
    stats: Arc<PublisherStats>,
    send_timeout: Duration,
    pod_name: Option<String>,
    namespace: Option<String>,
}

/// 指标上报器
///
/// 每个实例拥有一个后台发送任务，必须在 tokio 运行时内创建
pub struct MetricsPublisher {
    sender: mpsc::Sender<PendingEvent>,
    stats: Arc<PublisherStats>,
    worker: JoinHandle<()>,
}

impl MetricsPublisher {
    /// 使用自定义通道创建
    pub fn new(
        config: &PublisherConfig,
        transport: Arc<dyn MetricsTransport>,
        gauges: Arc<dyn GaugeSource>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(PublisherStats::default());

        let context = WorkerContext {
            transport,
            gauges,
            stats: Arc::clone(&stats),
            send_timeout: config.send_timeout,
            pod_name: config.pod_name.clone(),
            namespace: config.namespace.clone(),
        };
        let worker = tokio::spawn(run_worker(receiver, context));

        Self {
            sender,
            stats,
            worker,
        }
    }

    /// 通过 HTTP 发送到 `config.endpoint`
    pub fn http(
        config: &PublisherConfig,
        gauges: Arc<dyn GaugeSource>,
    ) -> Result<Self, PublishError> {
        let transport = HttpTransport::new(config.endpoint.clone())?;
        Ok(Self::new(config, Arc::new(transport), gauges))
    }

    /// 上报查询执行
    pub fn publish_query(
        &self,
        query: &QueryExecution,
        connection_id: &str,
        thread_label: &str,
    ) -> bool {
        let data = QueryEventData::new(query, connection_id, thread_label);
        self.enqueue(MonitorEvent::QueryExecution(data)).is_ok()
    }

    /// 上报事务结束
    pub fn publish_transaction(&self, metrics: &TransactionMetrics) -> bool {
        let data = TransactionEventData::from(metrics);
        self.enqueue(MonitorEvent::TransactionEvent(data)).is_ok()
    }

    /// 上报死锁
    pub fn publish_deadlock(&self, event: &DeadlockEvent) -> bool {
        let data = DeadlockEventData::from(event);
        self.enqueue(MonitorEvent::DeadlockEvent(data)).is_ok()
    }

    /// 放入发送队列，不阻塞
    pub fn enqueue(&self, event: MonitorEvent) -> Result<(), PublishError> {
        let event_type = event.event_type();
        let pending = PendingEvent {
            queued_at: Utc::now(),
            event,
        };

        match self.sender.try_send(pending) {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type, "publish queue full, event dropped");
                Err(PublishError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event_type, "publisher worker stopped, event dropped");
                Err(PublishError::WorkerStopped)
            }
        }
    }

    pub fn stats(&self) -> &Arc<PublisherStats> {
        &self.stats
    }

    /// 关闭队列并等待已入队的事件处理完
    pub async fn shutdown(self) {
        let Self { sender, worker, .. } = self;
        drop(sender);
        if let Err(err) = worker.await {
            warn!(error = %err, "publisher worker terminated abnormally");
        }
    }
}

async fn run_worker(mut receiver: mpsc::Receiver<PendingEvent>, context: WorkerContext) {
    while let Some(pending) = receiver.recv().await {
        let payload = MetricsPayload {
            timestamp: pending.queued_at,
            pod_name: context.pod_name.clone(),
            namespace: context.namespace.clone(),
            event: pending.event,
            metrics: sample_gauges(&context.gauges).await,
        };
        let event_type = payload.event_type();

        let result = tokio::time::timeout(context.send_timeout, context.transport.send(&payload))
            .await
            .unwrap_or_else(|_| {
                Err(PublishError::Timeout(context.send_timeout.as_millis() as u64))
            });

        match result {
            Ok(()) => {
                context.stats.sent.fetch_add(1, Ordering::Relaxed);
                debug!(event_type, "metrics event delivered");
            }
            Err(err) => {
                context.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(event_type, error = %err, "metrics delivery failed, event dropped");
            }
        }
    }
    debug!("publisher worker stopped");
}

/// 采样会读取 /proc 等系统文件，放到阻塞线程池执行
async fn sample_gauges(gauges: &Arc<dyn GaugeSource>) -> SystemGauges {
    let gauges = Arc::clone(gauges);
    tokio::task::spawn_blocking(move || gauges.sample())
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "gauge sampling failed");
            SystemGauges::default()
        })
}
