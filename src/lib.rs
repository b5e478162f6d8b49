pub mod config;
pub mod error;
pub mod transactions;
pub mod metrics;
pub mod hub;
pub mod monitor;
pub mod server;

pub use crate::config::{HubConfig, MonitorConfig, PublisherConfig};
pub use crate::hub::BroadcastHub;
pub use crate::metrics::MetricsPublisher;
pub use crate::monitor::TransactionMonitor;
pub use crate::transactions::{TransactionStore, WaitForGraphDetector};
