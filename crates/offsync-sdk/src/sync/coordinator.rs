//! 同步协调器 - 编排排空、实时合并与周期对账
//!
//! 后台任务：
//! - 排空循环：被本地写、网络恢复、停放条目处理唤醒；离线时休眠
//! - 对账定时器：启动时立即对账一次，之后按固定间隔（仅在线时）
//! - 每张表一个变更流监听：断流按重连限流器的节奏重订阅，恢复后补一次对账
//! - 网络监听：恢复在线时唤醒排空并对账所有表
//!
//! `stop` 取消所有任务；正在进行的那一步排空允许做完，但受关闭超时约束。

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ChangeApplier, DrainStep, DrainWorker, InFlightTracker, ReconcileReport, Reconciler,
    SyncCursorStore, SyncStatus,
};
use crate::config::SyncConfig;
use crate::error::{Result, SyncSDKError};
use crate::events::{ChangeOrigin, EventManager, SyncEvent};
use crate::feed_backoff::{FeedBackoff, FeedBackoffConfig};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::remote::{FeedSignal, RemoteClient};
use crate::storage::entities::RecordKey;
use crate::storage::queue::{DiscardOutcome, Outbox, OutboxEntry, RetryPolicy};
use crate::storage::LocalStore;

/// 排空出错后的休眠时间
const DRAIN_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct SyncCoordinator {
    tables: Vec<String>,
    reconcile_interval: Duration,
    reconnect: FeedBackoffConfig,
    outbox: Outbox,
    remote: Arc<dyn RemoteClient>,
    events: EventManager,
    network: NetworkMonitor,
    drain: DrainWorker,
    applier: ChangeApplier,
    reconciler: Reconciler,
    in_flight: Arc<InFlightTracker>,
    wake: Notify,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        config: &SyncConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteClient>,
        events: EventManager,
        network: NetworkMonitor,
        cursors: SyncCursorStore,
    ) -> Arc<Self> {
        let outbox = Outbox::new(store.clone());
        let in_flight = Arc::new(InFlightTracker::default());
        let ts_field = config.timestamp_field.clone();
        let drain = DrainWorker::new(
            store.clone(),
            outbox.clone(),
            remote.clone(),
            events.clone(),
            network.clone(),
            RetryPolicy::from(config),
            in_flight.clone(),
            ts_field.clone(),
        );
        let applier = ChangeApplier::new(store.clone(), events.clone(), ts_field.clone());
        let reconciler = Reconciler::new(store, remote.clone(), events.clone(), cursors, ts_field);

        Arc::new(Self {
            tables: config.tables.clone(),
            reconcile_interval: config.reconciliation_interval(),
            reconnect: config.reconnect.clone(),
            outbox,
            remote,
            events,
            network,
            drain,
            applier,
            reconciler,
            in_flight,
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动所有后台任务（重复调用无效果）
    pub fn start(self: &Arc<Self>) {
        if self.cancel.is_cancelled() || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.clone().run_drain_loop()));
        tasks.push(tokio::spawn(self.clone().run_reconcile_timer()));
        let network_events = self.network.subscribe();
        tasks.push(tokio::spawn(self.clone().run_network_watcher(network_events)));
        for table in &self.tables {
            tasks.push(tokio::spawn(self.clone().run_listener(table.clone())));
        }
        info!("同步协调器已启动，表: {:?}", self.tables);
    }

    /// 停止后台任务；超过 `timeout` 仍未结束的任务被强制中止
    pub async fn stop(&self, timeout: Duration) {
        self.cancel.cancel();
        self.wake.notify_one();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return;
        }
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!("后台任务在 {:?} 内未结束，强制中止", timeout);
            for abort in aborts {
                abort.abort();
            }
        }
        self.in_flight.clear();
        self.running.store(false, Ordering::SeqCst);
        info!("同步协调器已停止");
    }

    /// 唤醒排空循环
    pub fn wake_drain(&self) {
        self.wake.notify_one();
    }

    /// 手动推进一步排空
    pub async fn drain_once(&self) -> Result<DrainStep> {
        self.drain.drain_once().await
    }

    /// 本地写已提交：通知监听者并唤醒排空
    pub async fn notify_local_write(&self, table: &str, key: RecordKey) -> Result<()> {
        self.events
            .emit_table_change(table, vec![key], ChangeOrigin::Local);
        self.drain.emit_status().await?;
        self.wake_drain();
        Ok(())
    }

    /// 立即对账；`table` 为 None 时对账所有注册的表
    pub async fn force_reconcile(&self, table: Option<&str>) -> Result<Vec<ReconcileReport>> {
        if self.cancel.is_cancelled() {
            return Err(SyncSDKError::ShuttingDown("同步协调器已停止".to_string()));
        }
        let targets: Vec<String> = match table {
            Some(table) => vec![table.to_string()],
            None => self.tables.clone(),
        };
        let mut reports = Vec::with_capacity(targets.len());
        for table in targets {
            reports.push(self.reconciler.reconcile_table(&table).await?);
        }
        Ok(reports)
    }

    pub async fn get_sync_status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            pending_count: self.outbox.pending_count().await?,
            parked_entries: self.outbox.list_parked().await?,
            is_online: self.network.check_connection(),
            in_flight: self.in_flight.get().map(|f| f.entry_id),
            last_reconciled_at: self.reconciler.cursors().all().await?,
        })
    }

    pub fn set_online(&self, online: bool) {
        self.network.set_status(if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        });
    }

    /// 丢弃停放条目，同一键上排在后面的条目随之解除阻塞
    pub async fn discard_parked(&self, id: i64) -> Result<DiscardOutcome> {
        let outcome = self.outbox.discard(id).await?;
        self.events.emit(SyncEvent::EntryDiscarded {
            entry_id: id,
            table: outcome.entry.table.clone(),
            key: outcome.entry.key.clone(),
        });
        if outcome.local_changed {
            self.events.emit_table_change(
                &outcome.entry.table,
                vec![outcome.entry.key.clone()],
                ChangeOrigin::Resolution,
            );
        }
        self.drain.emit_status().await?;
        self.wake_drain();
        Ok(outcome)
    }

    /// 重新提交停放条目（可附带修改后的负载）
    pub async fn resubmit_parked(&self, id: i64, data: Option<Value>) -> Result<OutboxEntry> {
        let edited = data.is_some();
        let entry = self.outbox.resubmit(id, data).await?;
        if edited {
            self.events
                .emit_table_change(&entry.table, vec![entry.key.clone()], ChangeOrigin::Resolution);
        }
        self.drain.emit_status().await?;
        self.wake_drain();
        Ok(entry)
    }

    // ---------- 后台任务 ----------

    async fn run_drain_loop(self: Arc<Self>) {
        debug!("排空循环启动");
        while !self.cancel.is_cancelled() {
            let idle_for = match self.drain.drain_once().await {
                Ok(DrainStep::Confirmed(_)) | Ok(DrainStep::Parked(_)) | Ok(DrainStep::Retry { .. }) => continue,
                Ok(DrainStep::Waiting(delay)) => Some(delay),
                Ok(DrainStep::Idle) | Ok(DrainStep::Offline) => None,
                Err(e) => {
                    error!("排空失败: {}", e);
                    Some(DRAIN_ERROR_BACKOFF)
                }
            };
            match idle_for {
                Some(delay) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
        debug!("排空循环退出");
    }

    async fn run_reconcile_timer(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.network.check_connection() {
                        self.reconcile_all().await;
                    }
                }
            }
        }
        debug!("对账定时器退出");
    }

    async fn run_network_watcher(
        self: Arc<Self>,
        mut receiver: broadcast::Receiver<crate::network::NetworkStatusEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = receiver.recv() => event,
            };
            match event {
                Ok(event) => {
                    self.events.emit(SyncEvent::NetworkChanged {
                        old_status: event.old_status,
                        new_status: event.new_status,
                    });
                    if let Err(e) = self.drain.emit_status().await {
                        warn!("读取同步状态失败: {}", e);
                    }
                    if event.new_status.is_online() && !event.old_status.is_online() {
                        info!("网络恢复，开始排空与对账");
                        self.wake_drain();
                        self.reconcile_all().await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("网络事件滞后 {} 条", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn run_listener(self: Arc<Self>, table: String) {
        let backoff = FeedBackoff::new(table.clone(), self.reconnect.clone());
        let mut connected_before = false;
        let mut retry_delay = None;

        loop {
            if let Some(delay) = retry_delay.take() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if !self.wait_online().await {
                break;
            }
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.remote.subscribe(&table) => result,
            };
            let mut feed = match subscribed {
                Ok(feed) => feed,
                Err(e) => {
                    warn!(table = %table, "订阅变更流失败: {}", e);
                    retry_delay = Some(backoff.next_delay());
                    continue;
                }
            };
            backoff.connected();
            if connected_before {
                self.events.emit(SyncEvent::SubscriptionRestored { table: table.clone() });
                self.reconcile_logged(&table).await;
            }
            connected_before = true;
            debug!(table = %table, "变更流已订阅");

            loop {
                let signal = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    signal = feed.recv() => signal,
                };
                match signal {
                    Some(FeedSignal::Event(event)) => {
                        if let Err(e) = self.applier.apply(event).await {
                            error!(table = %table, "合并远端变更失败: {}", e);
                        }
                    }
                    Some(FeedSignal::Dropped(reason)) => {
                        warn!(table = %table, "变更流断开: {}", reason);
                        self.events.emit(SyncEvent::SubscriptionDropped {
                            table: table.clone(),
                            reason,
                        });
                    }
                    Some(FeedSignal::Reconnected) => {
                        info!(table = %table, "变更流已恢复");
                        self.events.emit(SyncEvent::SubscriptionRestored { table: table.clone() });
                        self.reconcile_logged(&table).await;
                    }
                    None => {
                        warn!(table = %table, "变更流已结束，准备重新订阅");
                        self.events.emit(SyncEvent::SubscriptionDropped {
                            table: table.clone(),
                            reason: "feed closed".to_string(),
                        });
                        retry_delay = Some(backoff.next_delay());
                        break;
                    }
                }
            }
        }
        debug!(table = %table, "变更流监听退出");
    }

    /// 等到在线为止；被取消时返回 false
    async fn wait_online(&self) -> bool {
        let mut receiver = self.network.subscribe();
        loop {
            if self.network.check_connection() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                event = receiver.recv() => {
                    if let Err(broadcast::error::RecvError::Closed) = event {
                        return false;
                    }
                }
            }
        }
    }

    async fn reconcile_all(&self) {
        for table in &self.tables {
            if self.cancel.is_cancelled() {
                return;
            }
            self.reconcile_logged(table).await;
        }
    }

    async fn reconcile_logged(&self, table: &str) {
        if let Err(e) = self.reconciler.reconcile_table(table).await {
            warn!(table = %table, "对账失败，等待下一轮: {}", e);
        }
    }
}
