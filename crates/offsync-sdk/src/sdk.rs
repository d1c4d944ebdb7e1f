//! 统一 SDK 接口 - OffsyncSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! OffsyncSDK (会话层)
//!   ├── LocalStore (本地存储层，唯一的共享可变资源)
//!   ├── SyncCoordinator (同步编排层：排空 / 合并 / 对账)
//!   ├── RemoteClient (远端适配层)
//!   ├── PresenceManager (在线状态，可选)
//!   ├── EventManager (事件系统层)
//!   └── NetworkMonitor (网络监控层)
//! ```
//!
//! 设计原则：
//! - 离线优先：mutate 只碰本地，立即返回；远端同步在后台完成
//! - 原子写入：本地写与 outbox 追加在同一个事务里
//! - 显式依赖：没有全局单例，所有组件由会话构造并持有

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncSDKError};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, ListenerHandle, SyncEvent, TableChange};
use crate::lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
use crate::network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
use crate::presence::{PresenceManager, PresenceTransport};
use crate::remote::RemoteClient;
use crate::storage::entities::{extract_key, merge_patch, validate_table_name, Record, RecordKey};
use crate::storage::kv::KvStore;
use crate::storage::queue::{DiscardOutcome, MutationOp, Outbox, OutboxEntry, PendingMutation};
use crate::storage::LocalStore;
use crate::sync::{ReconcileReport, SyncCoordinator, SyncCursorStore, SyncStatus};
use crate::version::{GIT_SHA, SDK_VERSION};

/// 离线优先同步会话
pub struct OffsyncSDK {
    config: SyncConfig,
    store: LocalStore,
    kv: KvStore,
    events: EventManager,
    network: NetworkMonitor,
    coordinator: Arc<SyncCoordinator>,
    presence: Option<Arc<PresenceManager>>,
    lifecycle: RwLock<LifecycleManager>,
    cancel: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for OffsyncSDK {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsyncSDK")
            .field("data_dir", &self.config.data_dir)
            .field("tables", &self.config.tables)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl OffsyncSDK {
    /// 初始化会话：打开本地存储（含 migration）、KV，构建并启动同步协调器
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteClient>,
        presence_transport: Option<Arc<dyn PresenceTransport>>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 OffsyncSDK {} ({})", SDK_VERSION, GIT_SHA);
        config.validate()?;

        // === 第1层：本地存储 ===
        let store = LocalStore::open(config.db_path(), &config.primary_key_field).await?;
        let kv = KvStore::open(&config.kv_path()).await?;

        // === 第2层：网络监控与事件 ===
        let initial = if config.start_online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        let network = NetworkMonitor::new(initial);
        let events = EventManager::new(config.event_capacity);

        // === 第3层：同步协调器 ===
        let coordinator = SyncCoordinator::new(
            &config,
            store.clone(),
            remote,
            events.clone(),
            network.clone(),
            SyncCursorStore::new(kv.clone()),
        );

        // === 第4层：在线状态（可选） ===
        let presence = match presence_transport {
            Some(transport) => {
                let manager = PresenceManager::new(transport, events.clone(), config.presence.clone());
                if let Err(e) = manager.start().await {
                    // 在线状态不影响持久同步，通道恢复后会重建
                    warn!("在线状态通道启动失败: {}", e);
                }
                Some(manager)
            }
            None => None,
        };

        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(SyncLifecycleHook::new(&coordinator)));

        coordinator.start();
        let pending = coordinator.outbox().pending_count().await?;
        info!("OffsyncSDK 初始化完成，待同步条目 {} 个", pending);

        Ok(Arc::new(Self {
            config,
            store,
            kv,
            events,
            network,
            coordinator,
            presence,
            lifecycle: RwLock::new(lifecycle),
            cancel: CancellationToken::new(),
            background: parking_lot::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn check_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SyncSDKError::ShuttingDown("OffsyncSDK 正在关闭".to_string()));
        }
        Ok(())
    }

    // ========== 写入 ==========

    /// 本地写入并入队，返回 outbox 条目 id
    ///
    /// - insert：本地已存在该键时报错
    /// - update：浅合并进本地行，outbox 中保存 patch 本身；本地不存在时报错
    /// - upsert：浅合并进本地行（不存在则新建）
    /// - delete：删除本地行，不携带负载
    ///
    /// 本地写与入队在同一事务中；任何一步失败都整体回滚。
    pub async fn mutate(
        &self,
        table: &str,
        operation: MutationOp,
        key: RecordKey,
        data: Option<Value>,
    ) -> Result<i64> {
        self.check_running()?;
        validate_table_name(table)?;

        let mutation = PendingMutation {
            operation,
            table: table.to_string(),
            key: key.clone(),
            data,
        };
        let id = self
            .store
            .transact(move |txn| {
                let id = Outbox::enqueue(txn, &mutation)?;
                let existing = txn.get(&mutation.table, &mutation.key)?;
                match (mutation.operation, mutation.data) {
                    (MutationOp::Insert, Some(data)) => {
                        if existing.is_some() {
                            return Err(SyncSDKError::InvalidArgument(format!(
                                "记录已存在: {}/{}",
                                mutation.table, mutation.key
                            )));
                        }
                        txn.put_local(&mutation.table, &mutation.key, data)?;
                    }
                    (MutationOp::Update, Some(patch)) => {
                        let Some(existing) = existing else {
                            return Err(SyncSDKError::NotFound(format!(
                                "记录不存在: {}/{}",
                                mutation.table, mutation.key
                            )));
                        };
                        txn.put_local(&mutation.table, &mutation.key, merge_patch(&existing.data, &patch))?;
                    }
                    (MutationOp::Upsert, Some(data)) => {
                        let merged = match existing {
                            Some(existing) => merge_patch(&existing.data, &data),
                            None => data,
                        };
                        txn.put_local(&mutation.table, &mutation.key, merged)?;
                    }
                    (MutationOp::Delete, _) => {
                        txn.delete(&mutation.table, &mutation.key)?;
                    }
                    // enqueue 已经校验过负载
                    (_, None) => {}
                }
                Ok(id)
            })
            .await?;

        debug!(entry_id = id, table = %table, key = %key, op = %operation, "本地写入已提交");
        self.coordinator.notify_local_write(table, key).await?;
        Ok(id)
    }

    /// 新建一条记录；负载中带主键时沿用，否则生成 UUID
    pub async fn create(&self, table: &str, data: Value) -> Result<RecordKey> {
        let key = extract_key(&data, &self.config.primary_key_field).unwrap_or_else(RecordKey::generate);
        self.mutate(table, MutationOp::Insert, key.clone(), Some(data)).await?;
        Ok(key)
    }

    pub async fn update(&self, table: &str, key: RecordKey, patch: Value) -> Result<i64> {
        self.mutate(table, MutationOp::Update, key, Some(patch)).await
    }

    pub async fn upsert(&self, table: &str, key: RecordKey, data: Value) -> Result<i64> {
        self.mutate(table, MutationOp::Upsert, key, Some(data)).await
    }

    pub async fn delete(&self, table: &str, key: RecordKey) -> Result<i64> {
        self.mutate(table, MutationOp::Delete, key, None).await
    }

    // ========== 读取 ==========

    pub async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        self.store.get(table, key).await
    }

    pub async fn list(&self, table: &str) -> Result<Vec<Record>> {
        self.store.list(table).await
    }

    // ========== 事件 ==========

    /// 注册逻辑表变更回调；句柄 drop 即注销
    pub fn on_change<F>(&self, table: &str, callback: F) -> ListenerHandle
    where
        F: Fn(&TableChange) + Send + Sync + 'static,
    {
        self.events.on_change(table, callback)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    // ========== 同步状态与停放条目 ==========

    pub async fn get_sync_status(&self) -> Result<SyncStatus> {
        self.coordinator.get_sync_status().await
    }

    pub async fn list_outbox(&self) -> Result<Vec<OutboxEntry>> {
        self.coordinator.outbox().list().await
    }

    pub async fn discard_parked(&self, entry_id: i64) -> Result<DiscardOutcome> {
        self.check_running()?;
        self.coordinator.discard_parked(entry_id).await
    }

    pub async fn resubmit_parked(&self, entry_id: i64, data: Option<Value>) -> Result<OutboxEntry> {
        self.check_running()?;
        self.coordinator.resubmit_parked(entry_id, data).await
    }

    pub async fn force_reconcile(&self, table: Option<&str>) -> Result<Vec<ReconcileReport>> {
        self.check_running()?;
        self.coordinator.force_reconcile(table).await
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    // ========== 网络与生命周期 ==========

    pub fn set_online(&self, online: bool) {
        self.coordinator.set_online(online);
    }

    pub fn network_status(&self) -> NetworkStatus {
        self.network.get_status()
    }

    /// 接入平台网络监听器（Android/iOS/浏览器 online 事件）
    pub async fn attach_network_listener(&self, listener: Arc<dyn NetworkStatusListener>) -> Result<()> {
        self.check_running()?;
        let handle = self
            .network
            .attach_listener(listener, self.cancel.child_token())
            .await?;
        self.background.lock().push(handle);
        Ok(())
    }

    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.lifecycle.write().await.register_hook(hook);
    }

    pub async fn on_app_background(&self) -> Result<()> {
        self.lifecycle.read().await.notify_background().await
    }

    pub async fn on_app_foreground(&self) -> Result<()> {
        self.check_running()?;
        self.lifecycle.read().await.notify_foreground().await
    }

    // ========== 在线状态 ==========

    pub fn presence(&self) -> Option<&Arc<PresenceManager>> {
        self.presence.as_ref()
    }

    // ========== 关闭 ==========

    /// 关闭会话
    ///
    /// 顺序：拒绝新写入 → 等待已排队的本地事务 → 停止同步任务（受超时约束）
    /// → untrack 在线状态 → 关闭 KV 与本地存储。重复调用无效果。
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 OffsyncSDK...");
        let timeout = self.config.shutdown_timeout();

        // 事务在 DB Actor 上串行执行，空事务返回即表示之前的事务都已提交
        self.store.transact(|_| Ok(())).await?;

        self.coordinator.stop(timeout).await;

        if let Some(presence) = &self.presence {
            match tokio::time::timeout(timeout, presence.untrack()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("untrack 失败，等待通道超时清理: {}", e),
                Err(_) => warn!("untrack 超时，等待通道超时清理"),
            }
            presence.stop();
        }

        self.cancel.cancel();
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }

        self.kv.flush().await?;
        self.store.close().await?;
        self.events.clear_listeners();
        info!("OffsyncSDK 关闭完成");
        Ok(())
    }
}
