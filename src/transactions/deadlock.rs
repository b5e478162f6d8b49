// 死锁检测模块
//
// 基于等待图（Wait-for Graph）的死锁检测：
// - 从实时的等待/持有表按需重建等待图
// - 深度优先搜索（DFS）环检测
// - 按回滚代价选择受害者

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Keys;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::transactions::model::{ResourceId, TransactionId};

/// 死锁类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlockType {
    /// 循环等待
    CircularWait,
}

impl Default for DeadlockType {
    fn default() -> Self {
        Self::CircularWait
    }
}

/// 等待链上的一环：waiter 等待 holder 持有的 resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockChainLink {
    pub waiter: TransactionId,
    pub resource: ResourceId,
    pub holder: TransactionId,
}

impl fmt::Display for LockChainLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.waiter, self.holder, self.resource)
    }
}

/// 死锁事件
#[derive(Debug, Clone, PartialEq)]
pub struct DeadlockEvent {
    /// 事件ID
    pub id: String,
    /// 环中的事务，按发现顺序
    pub participants: Vec<TransactionId>,
    /// 死锁类型
    pub deadlock_type: DeadlockType,
    /// 建议回滚的事务
    pub victim: TransactionId,
    /// 检测时间
    pub detected_at: DateTime<Utc>,
    /// 等待链
    pub lock_chain: Vec<LockChainLink>,
}

impl DeadlockEvent {
    /// 环长度
    pub fn cycle_length(&self) -> usize {
        self.participants.len()
    }

    /// 参与者集合
    pub fn participant_set(&self) -> BTreeSet<TransactionId> {
        self.participants.iter().cloned().collect()
    }

    pub fn involves(&self, transaction_id: &str) -> bool {
        self.participants.iter().any(|p| p == transaction_id)
    }
}

/// 等待图（Wait-for Graph）
///
/// 表示事务之间的等待关系，边上记录造成等待的资源
#[derive(Debug, Clone, Default)]
pub struct WaitGraph {
    /// 邻接表：tx -> (被等待的 tx -> 资源)
    adjacency: BTreeMap<TransactionId, BTreeMap<TransactionId, ResourceId>>,
}

impl WaitGraph {
    /// 创建新的等待图
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加等待边（waiter 等待 holder）；同一对事务只保留第一个资源
    pub fn add_wait_edge(&mut self, waiter: &str, holder: &str, resource: &str) {
        if waiter == holder {
            return;
        }
        self.adjacency
            .entry(waiter.to_string())
            .or_default()
            .entry(holder.to_string())
            .or_insert_with(|| resource.to_string());
    }

    /// 边上的资源
    pub fn edge_resource(&self, waiter: &str, holder: &str) -> Option<&ResourceId> {
        self.adjacency.get(waiter)?.get(holder)
    }

    /// 检测环（使用DFS）
    ///
    /// 返回从环入口开始、沿等待方向排列的事务序列
    pub fn detect_cycle(&self) -> Option<Vec<TransactionId>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for start_tx in self.adjacency.keys() {
            if !visited.contains(start_tx.as_str()) {
                if let Some(cycle) =
                    self.dfs_find_cycle(start_tx, &mut visited, &mut rec_stack, &mut path)
                {
                    return Some(cycle);
                }
            }
        }

        None
    }

    /// 深度优先搜索检测环
    ///
    /// 使用显式栈，深度不受线程栈大小限制；邻居按 BTreeMap 顺序访问
    fn dfs_find_cycle<'a>(
        &'a self,
        start: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<TransactionId>> {
        let mut frames: Vec<(&'a str, Option<Keys<'a, TransactionId, ResourceId>>)> = Vec::new();

        visited.insert(start);
        rec_stack.insert(start);
        path.push(start);
        frames.push((start, self.adjacency.get(start).map(|n| n.keys())));

        loop {
            let Some((_, neighbors)) = frames.last_mut() else {
                return None;
            };

            match neighbors.as_mut().and_then(|keys| keys.next()) {
                Some(neighbor) => {
                    let neighbor = neighbor.as_str();
                    if !visited.contains(neighbor) {
                        visited.insert(neighbor);
                        rec_stack.insert(neighbor);
                        path.push(neighbor);
                        frames.push((neighbor, self.adjacency.get(neighbor).map(|n| n.keys())));
                    } else if rec_stack.contains(neighbor) {
                        // 回边：从 path 中 neighbor 的位置截取出环
                        if let Some(pos) = path.iter().position(|&x| x == neighbor) {
                            return Some(path[pos..].iter().map(|s| s.to_string()).collect());
                        }
                    }
                }
                None => {
                    // 邻居已访问完，出栈
                    if let Some((tx, _)) = frames.pop() {
                        path.pop();
                        rec_stack.remove(tx);
                    }
                }
            }
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> WaitGraphStats {
        WaitGraphStats {
            transaction_count: self.adjacency.len(),
            edge_count: self.adjacency.values().map(|v| v.len()).sum(),
        }
    }
}

/// 等待图统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitGraphStats {
    /// 有出边的事务数
    pub transaction_count: usize,
    /// 等待边数量
    pub edge_count: usize,
}

/// 等待图死锁检测器
///
/// 等待/持有/所有者三张表在所有调用线程间共享；
/// 同一资源的所有权变更是原子的，整图检测读取的是某一时刻的近似快照
pub struct WaitForGraphDetector {
    /// 事务等待的资源
    waiting: DashMap<TransactionId, HashSet<ResourceId>>,
    /// 事务持有的资源
    holding: DashMap<TransactionId, HashSet<ResourceId>>,
    /// 资源所有者
    owners: DashMap<ResourceId, TransactionId>,
    /// 回滚代价，未设置时为 0
    costs: DashMap<TransactionId, i64>,
    /// 最近一次锁事件的时间
    last_activity: DashMap<TransactionId, Instant>,
    /// 死锁历史记录
    history: Mutex<VecDeque<DeadlockEvent>>,
    /// 最大历史记录数
    max_history_size: usize,
    /// 检测次数
    detection_count: AtomicU64,
    /// 检测到的死锁数
    deadlocks_found: AtomicU64,
}

impl WaitForGraphDetector {
    /// 创建新的死锁检测器
    pub fn new() -> Self {
        Self {
            waiting: DashMap::new(),
            holding: DashMap::new(),
            owners: DashMap::new(),
            costs: DashMap::new(),
            last_activity: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(100)),
            max_history_size: 100,
            detection_count: AtomicU64::new(0),
            deadlocks_found: AtomicU64::new(0),
        }
    }

    /// 设置最大历史记录数
    pub fn with_max_history_size(mut self, size: usize) -> Self {
        self.max_history_size = size;
        self.history = Mutex::new(VecDeque::with_capacity(size));
        self
    }

    /// 设置事务的回滚代价（仅用于受害者选择）
    pub fn set_rollback_cost(&self, tx: &str, cost: i64) {
        self.touch(tx);
        self.costs.insert(tx.to_string(), cost);
    }

    /// 回滚代价
    pub fn rollback_cost(&self, tx: &str) -> i64 {
        self.costs.get(tx).map(|c| *c).unwrap_or(0)
    }

    /// 记录锁请求
    pub fn on_lock_requested(&self, tx: &str, resource: &str) {
        self.touch(tx);
        self.waiting
            .entry(tx.to_string())
            .or_default()
            .insert(resource.to_string());
    }

    /// 记录锁获取
    ///
    /// 资源已被其他事务持有时拒绝，返回 false 且不修改任何状态
    pub fn on_lock_acquired(&self, tx: &str, resource: &str) -> bool {
        let granted = match self.owners.entry(resource.to_string()) {
            Entry::Occupied(owner) => owner.get() == tx,
            Entry::Vacant(slot) => {
                slot.insert(tx.to_string());
                true
            }
        };

        if !granted {
            debug!(tx, resource, "lock acquire ignored, resource owned by another transaction");
            return false;
        }

        self.touch(tx);
        if let Some(mut waits) = self.waiting.get_mut(tx) {
            waits.remove(resource);
        }
        self.waiting.remove_if(tx, |_, waits| waits.is_empty());
        self.holding
            .entry(tx.to_string())
            .or_default()
            .insert(resource.to_string());
        true
    }

    /// 记录锁释放；只有当前持有者可以释放
    pub fn on_lock_released(&self, tx: &str, resource: &str) {
        self.touch(tx);
        if let Some(mut holds) = self.holding.get_mut(tx) {
            holds.remove(resource);
        }
        self.holding.remove_if(tx, |_, holds| holds.is_empty());
        self.owners.remove_if(resource, |_, owner| owner == tx);
    }

    /// 事务结束：释放所有持有的资源并清除等待和代价
    pub fn on_transaction_completed(&self, tx: &str) {
        if let Some((_, holds)) = self.holding.remove(tx) {
            for resource in &holds {
                self.owners.remove_if(resource, |_, owner| owner == tx);
            }
        }
        self.waiting.remove(tx);
        self.costs.remove(tx);
        self.last_activity.remove(tx);
    }

    /// 释放超过 `max_age` 没有锁事件、且 `is_live` 判定为已失联的事务
    ///
    /// 只通过锁事件出现、从未在事务存储登记的事务靠这里回收
    pub fn sweep_idle(&self, max_age: Duration, is_live: impl Fn(&str) -> bool) -> Vec<TransactionId> {
        let stale: Vec<TransactionId> = self
            .last_activity
            .iter()
            .filter(|entry| entry.value().elapsed() > max_age && !is_live(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for tx in &stale {
            warn!(transaction_id = %tx, "releasing locks of idle untracked transaction");
            self.on_transaction_completed(tx);
        }
        stale
    }

    /// 有锁事件记录的事务数
    pub fn tracked_transactions(&self) -> usize {
        self.last_activity.len()
    }

    fn touch(&self, tx: &str) {
        self.last_activity.insert(tx.to_string(), Instant::now());
    }

    /// 当前持有资源的事务
    pub fn owner_of(&self, resource: &str) -> Option<TransactionId> {
        self.owners.get(resource).map(|owner| owner.value().clone())
    }

    /// 从实时状态重建等待图
    pub fn wait_graph(&self) -> WaitGraph {
        let mut graph = WaitGraph::new();
        for entry in self.waiting.iter() {
            let waiter = entry.key();
            for resource in entry.value() {
                if let Some(owner) = self.owners.get(resource) {
                    graph.add_wait_edge(waiter, owner.value(), resource);
                }
            }
        }
        graph
    }

    /// 检测死锁
    ///
    /// 受害者为回滚代价最低的参与者，代价相同时取发现顺序中的第一个
    pub fn check_for_deadlock(&self) -> Option<DeadlockEvent> {
        self.detection_count.fetch_add(1, Ordering::Relaxed);

        let graph = self.wait_graph();
        let cycle = graph.detect_cycle()?;

        let victim = cycle
            .iter()
            .min_by_key(|tx| self.rollback_cost(tx))
            .cloned()?;

        let lock_chain = cycle
            .iter()
            .zip(cycle.iter().cycle().skip(1))
            .filter_map(|(waiter, holder)| {
                graph
                    .edge_resource(waiter, holder)
                    .map(|resource| LockChainLink {
                        waiter: waiter.clone(),
                        resource: resource.clone(),
                        holder: holder.clone(),
                    })
            })
            .collect();

        let event = DeadlockEvent {
            id: uuid::Uuid::new_v4().to_string(),
            participants: cycle,
            deadlock_type: DeadlockType::CircularWait,
            victim,
            detected_at: Utc::now(),
            lock_chain,
        };

        info!(
            deadlock_id = %event.id,
            participants = ?event.participants,
            victim = %event.victim,
            "deadlock detected"
        );

        self.deadlocks_found.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        if history.len() >= self.max_history_size {
            history.pop_front();
        }
        if self.max_history_size > 0 {
            history.push_back(event.clone());
        }

        Some(event)
    }

    /// 获取死锁历史
    pub fn history(&self) -> Vec<DeadlockEvent> {
        self.history.lock().iter().cloned().collect()
    }

    /// 清除历史记录
    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// 获取死锁统计
    pub fn stats(&self) -> DeadlockStats {
        DeadlockStats {
            detection_count: self.detection_count.load(Ordering::Relaxed),
            deadlocks_detected: self.deadlocks_found.load(Ordering::Relaxed),
            waiting_transactions: self.waiting.len(),
            holding_transactions: self.holding.len(),
            owned_resources: self.owners.len(),
        }
    }
}

impl Default for WaitForGraphDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// 死锁统计信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadlockStats {
    /// 总检测次数
    pub detection_count: u64,
    /// 检测到的死锁数
    pub deadlocks_detected: u64,
    /// 当前等待中的事务数
    pub waiting_transactions: usize,
    /// 当前持有资源的事务数
    pub holding_transactions: usize,
    /// 被持有的资源数
    pub owned_resources: usize,
}
