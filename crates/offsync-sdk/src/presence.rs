//! 在线状态模块
//!
//! 功能包括：
//! - track/untrack 本会话的在线状态（临时数据，不落盘，不进 outbox）
//! - 维护通道当前成员表的本地投影，通知成员加入/离开
//! - 心跳刷新 last_seen，清理超时未刷新的幽灵成员
//! - 通道重连后重新 track 并从成员表重建投影，不做重放

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, Result, SyncSDKError};
use crate::events::{EventManager, SyncEvent};
use crate::utils::now_millis;

/// 在线状态配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// 心跳间隔（毫秒），每次心跳重新 track 以刷新 last_seen
    pub heartbeat_interval_ms: u64,
    /// 超过这个时间没有刷新的成员视为已离开（毫秒）
    pub stale_after_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 15_000,
            stale_after_ms: 45_000,
        }
    }
}

/// 通道中的一个成员
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub member_key: String,
    /// 展示字段（昵称、正在查看的页面等）
    pub fields: Value,
    /// 最后一次刷新时间（UTC 毫秒）
    pub last_seen: i64,
}

/// 通道推送的成员变化
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceDiff {
    Changed {
        joined: Vec<PresenceEntry>,
        left: Vec<PresenceEntry>,
    },
    /// 通道断开后已重连，成员表需要重建
    Reconnected,
}

/// 在线状态通道
#[async_trait]
pub trait PresenceTransport: Send + Sync + fmt::Debug {
    /// 宣告或更新成员的在线状态
    async fn track(&self, member_key: &str, fields: Value) -> std::result::Result<(), RemoteError>;

    /// 移除成员
    async fn untrack(&self, member_key: &str) -> std::result::Result<(), RemoteError>;

    /// 通道当前的成员表
    async fn members(&self) -> std::result::Result<Vec<PresenceEntry>, RemoteError>;

    fn subscribe(&self) -> broadcast::Receiver<PresenceDiff>;
}

type MembersCallback = Arc<dyn Fn(&[PresenceEntry], &[PresenceEntry]) + Send + Sync + 'static>;
type CallbackList = Vec<(u64, MembersCallback)>;

#[derive(Debug, Clone)]
struct Tracked {
    member_key: String,
    fields: Value,
    generation: u64,
}

/// 在线状态管理器
pub struct PresenceManager {
    transport: Arc<dyn PresenceTransport>,
    events: EventManager,
    config: PresenceConfig,
    /// 通道成员表的本地投影
    members: RwLock<HashMap<String, PresenceEntry>>,
    tracked: Mutex<Option<Tracked>>,
    generation: AtomicU64,
    callbacks: Arc<RwLock<CallbackList>>,
    next_callback_id: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for PresenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceManager")
            .field("transport", &self.transport)
            .field("members", &self.members.read().len())
            .field("tracked", &self.tracked.lock().as_ref().map(|t| t.member_key.clone()))
            .finish()
    }
}

impl PresenceManager {
    pub fn new(transport: Arc<dyn PresenceTransport>, events: EventManager, config: PresenceConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            events,
            config,
            members: RwLock::new(HashMap::new()),
            tracked: Mutex::new(None),
            generation: AtomicU64::new(0),
            callbacks: Arc::new(RwLock::new(Vec::new())),
            next_callback_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 启动通道监听与心跳；同时从通道成员表建立初始投影
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self.transport.subscribe();
        self.resync().await?;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().run_listener(receiver)));
        tasks.push(tokio::spawn(self.clone().run_heartbeat()));
        info!("在线状态通道已启动");
        Ok(())
    }

    /// 停止后台任务（不会 untrack，调用方需要先 untrack）
    pub fn stop(&self) {
        self.cancel.cancel();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// 宣告本会话在线；返回的会话句柄 drop 时自动 untrack
    pub async fn track(self: &Arc<Self>, member_key: impl Into<String>, fields: Value) -> Result<PresenceSession> {
        let member_key = member_key.into();
        if member_key.is_empty() {
            return Err(SyncSDKError::InvalidArgument("member_key 不能为空".to_string()));
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.tracked.lock().replace(Tracked {
            member_key: member_key.clone(),
            fields: fields.clone(),
            generation,
        });
        if let Some(previous) = previous {
            if previous.member_key != member_key {
                self.transport.untrack(&previous.member_key).await?;
            }
        }
        self.transport.track(&member_key, fields).await?;
        debug!("track: {}", member_key);
        Ok(PresenceSession {
            manager: Arc::downgrade(self),
            member_key,
            generation,
            released: AtomicBool::new(false),
        })
    }

    /// 更新本会话的展示字段
    pub async fn update(&self, fields: Value) -> Result<()> {
        let member_key = {
            let mut tracked = self.tracked.lock();
            let Some(tracked) = tracked.as_mut() else {
                return Err(SyncSDKError::NotInitialized("尚未 track".to_string()));
            };
            tracked.fields = fields.clone();
            tracked.member_key.clone()
        };
        self.transport.track(&member_key, fields).await?;
        Ok(())
    }

    /// 移除本会话的在线状态；未 track 时直接返回
    pub async fn untrack(&self) -> Result<()> {
        let tracked = self.tracked.lock().take();
        let Some(tracked) = tracked else {
            return Ok(());
        };
        self.transport.untrack(&tracked.member_key).await?;
        debug!("untrack: {}", tracked.member_key);
        Ok(())
    }

    async fn untrack_generation(&self, generation: u64) -> Result<()> {
        let tracked = {
            let mut slot = self.tracked.lock();
            match slot.as_ref() {
                Some(t) if t.generation == generation => slot.take(),
                _ => None,
            }
        };
        if let Some(tracked) = tracked {
            self.transport.untrack(&tracked.member_key).await?;
        }
        Ok(())
    }

    pub fn is_tracking(&self) -> bool {
        self.tracked.lock().is_some()
    }

    /// 当前成员（按 member_key 排序）
    pub fn members(&self) -> Vec<PresenceEntry> {
        let mut members: Vec<PresenceEntry> = self.members.read().values().cloned().collect();
        members.sort_by(|a, b| a.member_key.cmp(&b.member_key));
        members
    }

    /// 注册成员变化回调：`(joined, left)`
    pub fn on_members_changed<F>(&self, callback: F) -> MembersListenerHandle
    where
        F: Fn(&[PresenceEntry], &[PresenceEntry]) + Send + Sync + 'static,
    {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));
        MembersListenerHandle {
            id,
            callbacks: Arc::downgrade(&self.callbacks),
        }
    }

    /// 合并一次成员变化，只通知实际发生变化的部分
    fn apply_diff(&self, joined: Vec<PresenceEntry>, left: Vec<PresenceEntry>) {
        let mut really_joined = Vec::new();
        let mut really_left = Vec::new();
        {
            let mut members = self.members.write();
            for entry in joined {
                match members.get_mut(&entry.member_key) {
                    // 仅 last_seen 变化的心跳不通知
                    Some(existing) if existing.fields == entry.fields => {
                        existing.last_seen = existing.last_seen.max(entry.last_seen);
                    }
                    _ => {
                        members.insert(entry.member_key.clone(), entry.clone());
                        really_joined.push(entry);
                    }
                }
            }
            for entry in left {
                if let Some(removed) = members.remove(&entry.member_key) {
                    really_left.push(removed);
                }
            }
        }
        self.notify(really_joined, really_left);
    }

    fn notify(&self, joined: Vec<PresenceEntry>, left: Vec<PresenceEntry>) {
        if joined.is_empty() && left.is_empty() {
            return;
        }
        let callbacks: Vec<MembersCallback> = self.callbacks.read().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in callbacks {
            callback(&joined, &left);
        }
        self.events.emit(SyncEvent::PresenceChanged { joined, left });
    }

    /// 从通道成员表重建投影
    async fn resync(&self) -> Result<()> {
        let current = self.transport.members().await?;
        let mut joined = Vec::new();
        let mut left = Vec::new();
        {
            let mut members = self.members.write();
            let fresh: HashMap<String, PresenceEntry> = current
                .into_iter()
                .map(|entry| (entry.member_key.clone(), entry))
                .collect();
            for (key, entry) in &fresh {
                if members.get(key).map_or(true, |old| old.fields != entry.fields) {
                    joined.push(entry.clone());
                }
            }
            for (key, entry) in members.iter() {
                if !fresh.contains_key(key) {
                    left.push(entry.clone());
                }
            }
            *members = fresh;
        }
        self.notify(joined, left);
        Ok(())
    }

    /// 重连后重新宣告本会话
    async fn retrack(&self) -> Result<()> {
        let tracked = self.tracked.lock().clone();
        if let Some(tracked) = tracked {
            self.transport.track(&tracked.member_key, tracked.fields).await?;
            debug!("重连后重新 track: {}", tracked.member_key);
        }
        Ok(())
    }

    /// 清理超时未刷新的成员；本会话自己不会被清理
    fn prune_stale(&self, now: i64) {
        let own = self.tracked.lock().as_ref().map(|t| t.member_key.clone());
        let cutoff = now - self.config.stale_after_ms as i64;
        let stale: Vec<PresenceEntry> = {
            let mut members = self.members.write();
            let keys: Vec<String> = members
                .values()
                .filter(|e| e.last_seen < cutoff && Some(&e.member_key) != own.as_ref())
                .map(|e| e.member_key.clone())
                .collect();
            keys.iter().filter_map(|k| members.remove(k)).collect()
        };
        if !stale.is_empty() {
            debug!("清理 {} 个超时成员", stale.len());
            self.notify(Vec::new(), stale);
        }
    }

    async fn run_listener(self: Arc<Self>, mut receiver: broadcast::Receiver<PresenceDiff>) {
        loop {
            let diff = tokio::select! {
                _ = self.cancel.cancelled() => break,
                diff = receiver.recv() => diff,
            };
            match diff {
                Ok(PresenceDiff::Changed { joined, left }) => self.apply_diff(joined, left),
                Ok(PresenceDiff::Reconnected) => {
                    info!("在线状态通道已重连，重建成员表");
                    if let Err(e) = self.retrack().await {
                        warn!("重新 track 失败: {}", e);
                    }
                    if let Err(e) = self.resync().await {
                        warn!("重建成员表失败: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("成员变化滞后 {} 条，重建成员表", n);
                    if let Err(e) = self.resync().await {
                        warn!("重建成员表失败: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn run_heartbeat(self: Arc<Self>) {
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.retrack().await {
                        warn!("在线状态心跳失败: {}", e);
                    }
                    self.prune_stale(now_millis());
                }
            }
        }
    }
}

/// 成员变化回调句柄，drop 即注销
#[must_use = "dropping the handle unregisters the callback"]
pub struct MembersListenerHandle {
    id: u64,
    callbacks: Weak<RwLock<CallbackList>>,
}

impl fmt::Debug for MembersListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MembersListenerHandle").field("id", &self.id).finish()
    }
}

impl Drop for MembersListenerHandle {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.write().retain(|(id, _)| *id != self.id);
        }
    }
}

/// 在线会话句柄
///
/// 调用 `untrack` 或直接 drop 都会移除在线状态；drop 时在当前 tokio 运行时上异步执行。
/// 之后又 track 了新会话时，旧句柄的 drop 不会影响新会话。
pub struct PresenceSession {
    manager: Weak<PresenceManager>,
    member_key: String,
    generation: u64,
    released: AtomicBool,
}

impl PresenceSession {
    pub fn member_key(&self) -> &str {
        &self.member_key
    }

    pub async fn untrack(self) -> Result<()> {
        self.released.store(true, Ordering::SeqCst);
        match self.manager.upgrade() {
            Some(manager) => manager.untrack_generation(self.generation).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PresenceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceSession")
            .field("member_key", &self.member_key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PresenceSession {
    fn drop(&mut self) {
        if self.released.load(Ordering::SeqCst) {
            return;
        }
        let Some(manager) = self.manager.upgrade() else { return };
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = manager.untrack_generation(generation).await {
                        warn!("会话释放时 untrack 失败: {}", e);
                    }
                });
            }
            Err(_) => warn!("没有可用的运行时，{} 的在线状态将由通道超时清理", self.member_key),
        }
    }
}

/// 进程内在线状态通道（多个管理器可以共享同一个 hub）
#[derive(Debug, Clone)]
pub struct MemoryPresence {
    inner: Arc<MemoryPresenceInner>,
}

#[derive(Debug)]
struct MemoryPresenceInner {
    members: Mutex<BTreeMap<String, PresenceEntry>>,
    sender: broadcast::Sender<PresenceDiff>,
    offline: AtomicBool,
}

impl Default for MemoryPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPresence {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(MemoryPresenceInner {
                members: Mutex::new(BTreeMap::new()),
                sender,
                offline: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// 模拟通道断开重连：服务端成员表丢失，所有订阅者收到 Reconnected
    pub fn simulate_reconnect(&self) {
        self.inner.members.lock().clear();
        let _ = self.inner.sender.send(PresenceDiff::Reconnected);
    }

    /// 模拟通道的存活超时移除某个成员
    pub fn expire(&self, member_key: &str) {
        let removed = self.inner.members.lock().remove(member_key);
        if let Some(entry) = removed {
            let _ = self.inner.sender.send(PresenceDiff::Changed {
                joined: Vec::new(),
                left: vec![entry],
            });
        }
    }

    fn check_online(&self) -> std::result::Result<(), RemoteError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            Err(RemoteError::transient("presence channel unreachable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PresenceTransport for MemoryPresence {
    async fn track(&self, member_key: &str, fields: Value) -> std::result::Result<(), RemoteError> {
        self.check_online()?;
        let entry = PresenceEntry {
            member_key: member_key.to_string(),
            fields,
            last_seen: now_millis(),
        };
        self.inner
            .members
            .lock()
            .insert(member_key.to_string(), entry.clone());
        let _ = self.inner.sender.send(PresenceDiff::Changed {
            joined: vec![entry],
            left: Vec::new(),
        });
        Ok(())
    }

    async fn untrack(&self, member_key: &str) -> std::result::Result<(), RemoteError> {
        self.check_online()?;
        let removed = self.inner.members.lock().remove(member_key);
        if let Some(entry) = removed {
            let _ = self.inner.sender.send(PresenceDiff::Changed {
                joined: Vec::new(),
                left: vec![entry],
            });
        }
        Ok(())
    }

    async fn members(&self) -> std::result::Result<Vec<PresenceEntry>, RemoteError> {
        self.check_online()?;
        Ok(self.inner.members.lock().values().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceDiff> {
        self.inner.sender.subscribe()
    }
}
