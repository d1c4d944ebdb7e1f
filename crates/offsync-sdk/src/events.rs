//! 事件系统模块 - 同步引擎对外的通知通道
//!
//! 功能包括：
//! - 逻辑表变更事件（本地写、远端变更、对账、确认）
//! - Outbox 条目生命周期事件（确认、重试、停放、丢弃）
//! - 订阅断开/恢复、网络状态、在线成员变化
//! - 广播订阅 + 按表注册回调，回调句柄 drop 时自动注销

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::debug;

use crate::network::NetworkStatus;
use crate::presence::PresenceEntry;
use crate::storage::entities::RecordKey;
use crate::utils::now_millis;

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// 本地 mutate
    Local,
    /// 实时变更流
    Remote,
    /// 全表对账
    Reconcile,
    /// 远端确认后写回的提交值
    Confirmed,
    /// 停放条目被丢弃或重提后的本地回滚/改写
    Resolution,
}

/// 一次逻辑表变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChange {
    pub table: String,
    pub keys: Vec<RecordKey>,
    pub origin: ChangeOrigin,
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncEvent {
    /// 本地表内容发生变化
    TableChanged(TableChange),
    /// 条目被远端确认并移出 outbox
    EntryConfirmed {
        entry_id: i64,
        table: String,
        key: RecordKey,
    },
    /// 临时失败，等待退避后重试
    EntryRetryScheduled {
        entry_id: i64,
        table: String,
        key: RecordKey,
        attempts: u32,
        retry_at: i64,
        error: String,
    },
    /// 条目停放，需要调用方决定丢弃或重提
    EntryParked {
        entry_id: i64,
        table: String,
        key: RecordKey,
        reason: String,
    },
    /// 停放条目被丢弃
    EntryDiscarded {
        entry_id: i64,
        table: String,
        key: RecordKey,
    },
    /// 同步状态摘要变化（用于状态指示）
    SyncStatusChanged {
        pending_count: u64,
        parked_count: usize,
        is_online: bool,
    },
    /// 实时变更流断开（会自动重连）
    SubscriptionDropped { table: String, reason: String },
    /// 实时变更流恢复
    SubscriptionRestored { table: String },
    /// 在线成员变化
    PresenceChanged {
        joined: Vec<PresenceEntry>,
        left: Vec<PresenceEntry>,
    },
    /// 网络状态变化
    NetworkChanged {
        old_status: NetworkStatus,
        new_status: NetworkStatus,
    },
}

impl SyncEvent {
    /// 事件类型名
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::TableChanged(_) => "table_changed",
            SyncEvent::EntryConfirmed { .. } => "entry_confirmed",
            SyncEvent::EntryRetryScheduled { .. } => "entry_retry_scheduled",
            SyncEvent::EntryParked { .. } => "entry_parked",
            SyncEvent::EntryDiscarded { .. } => "entry_discarded",
            SyncEvent::SyncStatusChanged { .. } => "sync_status_changed",
            SyncEvent::SubscriptionDropped { .. } => "subscription_dropped",
            SyncEvent::SubscriptionRestored { .. } => "subscription_restored",
            SyncEvent::PresenceChanged { .. } => "presence_changed",
            SyncEvent::NetworkChanged { .. } => "network_changed",
        }
    }

    /// 事件关联的逻辑表（如果有）
    pub fn table(&self) -> Option<&str> {
        match self {
            SyncEvent::TableChanged(change) => Some(&change.table),
            SyncEvent::EntryConfirmed { table, .. }
            | SyncEvent::EntryRetryScheduled { table, .. }
            | SyncEvent::EntryParked { table, .. }
            | SyncEvent::EntryDiscarded { table, .. }
            | SyncEvent::SubscriptionDropped { table, .. }
            | SyncEvent::SubscriptionRestored { table } => Some(table),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 逻辑表过滤器
    pub tables: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(tables) = &self.tables {
            match event.table() {
                Some(table) if tables.iter().any(|t| t == table) => {}
                _ => return false,
            }
        }
        true
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

type ChangeCallback = Arc<dyn Fn(&TableChange) + Send + Sync + 'static>;
type ListenerMap = HashMap<String, Vec<(u64, ChangeCallback)>>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
#[derive(Clone)]
pub struct EventManager {
    sender: broadcast::Sender<SyncEvent>,
    listeners: Arc<RwLock<ListenerMap>>,
    next_listener_id: Arc<AtomicU64>,
    stats: Arc<RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener_id: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SyncEvent) {
        debug!("发布事件: {}", event.event_type());
        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(now_millis());
        }

        if let SyncEvent::TableChanged(change) = &event {
            // 先拷出回调再调用，回调里注册/注销监听不会死锁
            let callbacks: Vec<ChangeCallback> = self
                .listeners
                .read()
                .get(&change.table)
                .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            for callback in callbacks {
                callback(change);
            }
        }

        // 无订阅者时 send 会失败，属正常场景
        if self.sender.send(event).is_err() {
            debug!("事件没有活跃的订阅者");
        }
    }

    /// 便捷方法：发布表变更
    pub fn emit_table_change(&self, table: &str, keys: Vec<RecordKey>, origin: ChangeOrigin) {
        if keys.is_empty() {
            return;
        }
        self.emit(SyncEvent::TableChanged(TableChange {
            table: table.to_string(),
            keys,
            origin,
        }));
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型/表的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 注册逻辑表变更回调，返回的句柄 drop 时自动注销
    pub fn on_change<F>(&self, table: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&TableChange) + Send + Sync + 'static,
    {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.listeners.write();
            listeners
                .entry(table.to_string())
                .or_default()
                .push((id, Arc::new(callback)));
        }
        self.refresh_listener_count();
        debug!("注册表变更监听: table={}, id={}", table, id);
        ListenerHandle {
            id,
            table: table.to_string(),
            manager: Arc::downgrade(&self.listeners),
            stats: Arc::downgrade(&self.stats),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(|v| v.len()).sum()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 移除所有监听器
    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.refresh_listener_count();
    }

    fn refresh_listener_count(&self) {
        let count = self.listener_count();
        self.stats.write().listener_count = count;
    }
}

/// 变更回调句柄
///
/// 句柄存活期间回调有效；drop 即注销，不需要手动调用 unregister。
#[must_use = "dropping the handle unregisters the listener"]
pub struct ListenerHandle {
    id: u64,
    table: String,
    manager: Weak<RwLock<ListenerMap>>,
    stats: Weak<RwLock<EventStats>>,
}

impl ListenerHandle {
    pub fn table(&self) -> &str {
        &self.table
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("id", &self.id)
            .field("table", &self.table)
            .finish()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        let Some(listeners) = self.manager.upgrade() else { return };
        let count = {
            let mut map = listeners.write();
            if let Some(list) = map.get_mut(&self.table) {
                list.retain(|(id, _)| *id != self.id);
                if list.is_empty() {
                    map.remove(&self.table);
                }
            }
            map.values().map(|v| v.len()).sum()
        };
        if let Some(stats) = self.stats.upgrade() {
            stats.write().listener_count = count;
        }
        debug!("注销表变更监听: table={}, id={}", self.table, self.id);
    }
}
