//! 进程资源指标采样
//!
//! 每个上报事件都会附带一份采样时刻的连接池/内存/CPU 快照

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sysinfo::{CpuExt, Pid, ProcessExt, System, SystemExt};

use crate::metrics::event::SystemGauges;

/// 指标来源
pub trait GaugeSource: Send + Sync + 'static {
    /// 采样一次当前值
    fn sample(&self) -> SystemGauges;
}

/// 固定值来源，测试时使用
impl GaugeSource for SystemGauges {
    fn sample(&self) -> SystemGauges {
        self.clone()
    }
}

/// 连接池使用情况，由埋点层更新
#[derive(Debug, Default)]
pub struct ConnectionPoolGauge {
    active: AtomicU64,
    max: AtomicU64,
}

impl ConnectionPoolGauge {
    pub fn new(max: u64) -> Self {
        Self {
            active: AtomicU64::new(0),
            max: AtomicU64::new(max),
        }
    }

    /// 连接被借出
    pub fn acquire(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// 连接被归还；不会减到负数
    pub fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::Relaxed);
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }
}

/// 当前进程的指标采样器
pub struct ProcessGauges {
    pool: Arc<ConnectionPoolGauge>,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessGauges {
    pub fn new(pool: Arc<ConnectionPoolGauge>) -> Self {
        Self {
            pool,
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPoolGauge> {
        &self.pool
    }
}

impl GaugeSource for ProcessGauges {
    fn sample(&self) -> SystemGauges {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu();

        let total_memory = system.total_memory();
        let process_memory = match self.pid {
            Some(pid) if system.refresh_process(pid) => {
                system.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            _ => 0,
        };

        let heap_usage_ratio = if total_memory == 0 {
            0.0
        } else {
            (process_memory as f64 / total_memory as f64).min(1.0)
        };
        let cpu_usage_ratio = (system.global_cpu_info().cpu_usage() as f64 / 100.0).clamp(0.0, 1.0);

        SystemGauges {
            connection_pool_active: self.pool.active(),
            connection_pool_max: self.pool.max(),
            heap_usage_ratio,
            cpu_usage_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_gauge_never_negative() {
        let pool = ConnectionPoolGauge::new(10);
        pool.acquire();
        pool.release();
        pool.release();
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.max(), 10);
    }

    #[test]
    fn test_process_gauges_ratios_in_range() {
        let pool = Arc::new(ConnectionPoolGauge::new(20));
        pool.acquire();
        let gauges = ProcessGauges::new(pool);

        let sample = gauges.sample();
        assert_eq!(sample.connection_pool_active, 1);
        assert_eq!(sample.connection_pool_max, 20);
        assert!((0.0..=1.0).contains(&sample.heap_usage_ratio));
        assert!((0.0..=1.0).contains(&sample.cpu_usage_ratio));
    }
}
