//! 配置模块
//!
//! 定义监控核心、指标上报和广播中心的配置选项

use std::net::SocketAddr;
use std::time::Duration;

/// 指标上报配置
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// 采集端的接收地址
    pub endpoint: String,

    /// 待发送队列容量，满了之后新事件直接丢弃
    pub queue_capacity: usize,

    /// 单次发送超时
    pub send_timeout: Duration,

    /// 所在 Pod 名称
    pub pod_name: Option<String>,

    /// 所在命名空间
    pub namespace: Option<String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/api/metrics".to_string(),
            queue_capacity: 1024,
            send_timeout: Duration::from_secs(2),
            pod_name: None,
            namespace: None,
        }
    }
}

impl PublisherConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// 从环境变量读取：MONITOR_COLLECTOR_URL、POD_NAME、POD_NAMESPACE
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("MONITOR_COLLECTOR_URL") {
            config.endpoint = endpoint;
        }
        config.pod_name = std::env::var("POD_NAME").ok();
        config.namespace = std::env::var("POD_NAMESPACE").ok();
        config
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_pod(mut self, pod_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self.namespace = Some(namespace.into());
        self
    }
}

/// 监控核心配置
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// 空闲多久的活动事务视为孤儿
    pub orphan_max_age: Duration,

    /// 孤儿清理间隔
    pub housekeeping_interval: Duration,

    /// 未绑定事务的连接执行查询时是否隐式开启事务
    pub implicit_transactions: bool,

    /// 统计报告输出间隔
    pub stats_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            orphan_max_age: Duration::from_secs(300),        // 5 minutes
            housekeeping_interval: Duration::from_secs(60),  // 1 minute
            implicit_transactions: false,
            stats_interval: Duration::from_secs(30),
        }
    }
}

impl MonitorConfig {
    /// 短周期配置，用于演示和测试
    pub fn low_latency() -> Self {
        Self {
            orphan_max_age: Duration::from_millis(500),
            housekeeping_interval: Duration::from_millis(100),
            stats_interval: Duration::from_secs(1),
            ..Default::default()
        }
    }

    pub fn with_orphan_max_age(mut self, max_age: Duration) -> Self {
        self.orphan_max_age = max_age;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn with_implicit_transactions(mut self, enable: bool) -> Self {
        self.implicit_transactions = enable;
        self
    }
}

/// 广播中心配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 监听地址
    pub bind_addr: SocketAddr,

    /// 每个订阅者的发送队列容量
    pub subscriber_queue_capacity: usize,

    /// 心跳探测间隔
    pub ping_interval: Duration,

    /// 超过该时长没有收到任何帧则断开
    pub pong_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            subscriber_queue_capacity: 256,
            ping_interval: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(45),
        }
    }
}

impl HubConfig {
    /// 短周期配置，用于演示和测试
    pub fn low_latency() -> Self {
        Self {
            subscriber_queue_capacity: 16,
            ping_interval: Duration::from_millis(200),
            pong_timeout: Duration::from_millis(600),
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(1);
        self
    }
}
