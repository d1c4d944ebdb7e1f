//! Outbox 排空
//!
//! 单飞：任何时刻至多一个条目在发往远端的路上，条目严格按 id 顺序处理。
//! 每次 `drain_once` 推进一个条目：确认、安排重试或停放。

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::InFlightTracker;
use crate::error::{RemoteError, Result};
use crate::events::{ChangeOrigin, EventManager, SyncEvent};
use crate::network::NetworkMonitor;
use crate::remote::RemoteClient;
use crate::storage::entities::Record;
use crate::storage::queue::{MutationOp, Outbox, OutboxEntry, RetryDecision, RetryPolicy};
use crate::storage::LocalStore;
use crate::utils::now_millis;

/// 一次排空的结果
#[derive(Debug, Clone, PartialEq)]
pub enum DrainStep {
    /// outbox 里没有可发送的条目
    Idle,
    /// 网络离线，不发送
    Offline,
    /// 队首条目还在退避等待中
    Waiting(Duration),
    /// 条目已被远端确认并移出 outbox
    Confirmed(i64),
    /// 临时失败，已安排重试
    Retry { id: i64, delay: Duration },
    /// 条目已停放
    Parked(i64),
}

/// 排空统计
#[derive(Debug, Clone, Default)]
pub struct DrainMetrics {
    pub attempt_total: u64,
    pub confirmed_total: u64,
    pub retry_total: u64,
    pub parked_total: u64,
}

pub struct DrainWorker {
    store: LocalStore,
    outbox: Outbox,
    remote: Arc<dyn RemoteClient>,
    events: EventManager,
    network: NetworkMonitor,
    policy: RetryPolicy,
    in_flight: Arc<InFlightTracker>,
    ts_field: Option<String>,
    /// 单飞锁：同一时刻只有一个 drain_once 在推进
    step_lock: Mutex<()>,
    metrics: parking_lot::Mutex<DrainMetrics>,
}

impl std::fmt::Debug for DrainWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainWorker")
            .field("policy", &self.policy)
            .field("in_flight", &self.in_flight.get())
            .finish()
    }
}

impl DrainWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: LocalStore,
        outbox: Outbox,
        remote: Arc<dyn RemoteClient>,
        events: EventManager,
        network: NetworkMonitor,
        policy: RetryPolicy,
        in_flight: Arc<InFlightTracker>,
        ts_field: Option<String>,
    ) -> Self {
        Self {
            store,
            outbox,
            remote,
            events,
            network,
            policy,
            in_flight,
            ts_field,
            step_lock: Mutex::new(()),
            metrics: parking_lot::Mutex::new(DrainMetrics::default()),
        }
    }

    pub fn metrics(&self) -> DrainMetrics {
        self.metrics.lock().clone()
    }

    /// 推进一个条目
    #[instrument(skip(self))]
    pub async fn drain_once(&self) -> Result<DrainStep> {
        let _guard = self.step_lock.lock().await;

        if !self.network.check_connection() {
            return Ok(DrainStep::Offline);
        }
        let Some(entry) = self.outbox.peek_next().await? else {
            return Ok(DrainStep::Idle);
        };
        let now = now_millis();
        if let Some(at) = entry.next_attempt_at {
            if at > now {
                return Ok(DrainStep::Waiting(Duration::from_millis((at - now) as u64)));
            }
        }

        debug!(
            entry_id = entry.id,
            table = %entry.table,
            key = %entry.key,
            op = %entry.operation,
            attempts = entry.attempts,
            "发送 outbox 条目"
        );
        self.in_flight.set(&entry);
        self.metrics.lock().attempt_total += 1;
        let result = self.remote.apply(&entry).await;
        let step = match result {
            Ok(row) => self.confirm(&entry, row).await,
            Err(error) => self.handle_failure(&entry, error).await,
        };
        self.in_flight.clear();

        let step = step?;
        self.emit_status().await?;
        Ok(step)
    }

    /// 确认成功：同一事务内移除条目并写回远端提交值
    async fn confirm(&self, entry: &OutboxEntry, row: Option<Value>) -> Result<DrainStep> {
        let id = entry.id;
        let table = entry.table.clone();
        let key = entry.key.clone();
        let operation = entry.operation;
        let ts_field = self.ts_field.clone();

        let local_changed = self
            .store
            .transact(move |txn| {
                txn.outbox().delete(id)?;
                if operation == MutationOp::Delete {
                    // 远端已删除，不再有可回滚的确认值
                    txn.records(&table)?.set_confirmed(&key, None)?;
                    return Ok(false);
                }
                let Some(row) = row else {
                    return Ok(false);
                };
                let confirmed = Record::from_remote_row(&row, txn.pk_field(), ts_field.as_deref())?;
                if txn.outbox().has_entries_for(&table, &key)? {
                    // 后面还有本地写排队，本地值保持不动，只记下远端确认值
                    txn.records(&table)?.set_confirmed(&key, Some(&confirmed.data))?;
                    return Ok(false);
                }
                let changed = txn
                    .get(&table, &key)?
                    .map_or(true, |existing| existing.data != confirmed.data);
                txn.records(&table)?.put_confirmed(&confirmed)?;
                Ok(changed)
            })
            .await?;

        info!(entry_id = id, table = %entry.table, key = %entry.key, "outbox 条目已确认");
        self.metrics.lock().confirmed_total += 1;

        if local_changed {
            self.events
                .emit_table_change(&entry.table, vec![entry.key.clone()], ChangeOrigin::Confirmed);
        }
        self.events.emit(SyncEvent::EntryConfirmed {
            entry_id: id,
            table: entry.table.clone(),
            key: entry.key.clone(),
        });
        Ok(DrainStep::Confirmed(id))
    }

    async fn handle_failure(&self, entry: &OutboxEntry, error: RemoteError) -> Result<DrainStep> {
        let outcome = self.outbox.record_failure(entry.id, &error, &self.policy).await?;
        let attempts = outcome.attempts;
        match outcome.decision {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    entry_id = entry.id,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    "发送失败，等待重试: {}",
                    error
                );
                self.metrics.lock().retry_total += 1;
                self.events.emit(SyncEvent::EntryRetryScheduled {
                    entry_id: entry.id,
                    table: entry.table.clone(),
                    key: entry.key.clone(),
                    attempts,
                    retry_at: outcome.retry_at.unwrap_or_else(now_millis),
                    error: error.to_string(),
                });
                Ok(DrainStep::Retry { id: entry.id, delay })
            }
            RetryDecision::Park(reason) => {
                warn!(entry_id = entry.id, attempts, "outbox 条目已停放: {}", reason);
                self.metrics.lock().parked_total += 1;
                self.events.emit(SyncEvent::EntryParked {
                    entry_id: entry.id,
                    table: entry.table.clone(),
                    key: entry.key.clone(),
                    reason,
                });
                Ok(DrainStep::Parked(entry.id))
            }
        }
    }

    /// 广播最新的同步状态摘要
    pub async fn emit_status(&self) -> Result<()> {
        let pending_count = self.outbox.pending_count().await?;
        let parked_count = self.outbox.list_parked().await?.len();
        self.events.emit(SyncEvent::SyncStatusChanged {
            pending_count,
            parked_count,
            is_online: self.network.check_connection(),
        });
        Ok(())
    }
}
