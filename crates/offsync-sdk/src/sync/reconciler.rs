//! 全表对账
//!
//! 拉取远端快照与本地表比对，补上实时变更流漏掉的插入/更新/删除。
//! 有未确认本地写的键一律跳过；快照开始之后才被写过的本地行也跳过，
//! 避免一个较旧的快照覆盖更新的变更事件。

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::SyncCursorStore;
use crate::error::Result;
use crate::events::{ChangeOrigin, EventManager};
use crate::remote::RemoteClient;
use crate::storage::entities::{Record, RecordKey};
use crate::storage::LocalStore;
use crate::utils::now_millis;

/// 一次对账的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub table: String,
    /// 新增或被远端值覆盖的行
    pub upserted: usize,
    /// 远端已不存在而被删除的本地行
    pub deleted: usize,
    /// 因存在未确认本地写而跳过的键
    pub skipped_pending: usize,
    /// 快照开始时间（UTC 毫秒），同时作为对账游标
    pub started_at: i64,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    store: LocalStore,
    remote: Arc<dyn RemoteClient>,
    events: EventManager,
    cursors: SyncCursorStore,
    ts_field: Option<String>,
}

impl Reconciler {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteClient>,
        events: EventManager,
        cursors: SyncCursorStore,
        ts_field: Option<String>,
    ) -> Self {
        Self {
            store,
            remote,
            events,
            cursors,
            ts_field,
        }
    }

    pub fn cursors(&self) -> &SyncCursorStore {
        &self.cursors
    }

    #[instrument(skip(self))]
    pub async fn reconcile_table(&self, table: &str) -> Result<ReconcileReport> {
        let started_at = now_millis();
        let rows = self.remote.fetch_snapshot(table).await?;
        debug!("远端快照 {} 行", rows.len());

        let ts_field = self.ts_field.clone();
        let table_name = table.to_string();
        let (report, changed) = self
            .store
            .transact(move |txn| {
                let mut report = ReconcileReport {
                    table: table_name.clone(),
                    started_at,
                    ..Default::default()
                };
                let mut changed: Vec<RecordKey> = Vec::new();

                let pending: std::collections::HashSet<RecordKey> =
                    txn.outbox().pending_keys_for(&table_name)?.into_iter().collect();
                let mut local: HashMap<RecordKey, Record> = txn
                    .list(&table_name)?
                    .into_iter()
                    .map(|record| (record.key.clone(), record))
                    .collect();

                for row in &rows {
                    let incoming = Record::from_remote_row(row, txn.pk_field(), ts_field.as_deref())?;
                    let existing = local.remove(&incoming.key);
                    if pending.contains(&incoming.key) {
                        report.skipped_pending += 1;
                        continue;
                    }
                    if let Some(existing) = existing {
                        if existing.updated_at >= started_at || existing.data == incoming.data {
                            continue;
                        }
                        if let (Some(local_ts), Some(remote_ts)) =
                            (existing.remote_updated_at, incoming.remote_updated_at)
                        {
                            if remote_ts < local_ts {
                                continue;
                            }
                        }
                    }
                    txn.records(&table_name)?.put_confirmed(&incoming)?;
                    report.upserted += 1;
                    changed.push(incoming.key);
                }

                // 剩下的本地行远端已不存在
                for (key, record) in local {
                    if pending.contains(&key) {
                        report.skipped_pending += 1;
                        continue;
                    }
                    if record.updated_at >= started_at {
                        continue;
                    }
                    if txn.records(&table_name)?.remove_confirmed(&key)? {
                        report.deleted += 1;
                        changed.push(key);
                    }
                }
                Ok((report, changed))
            })
            .await?;

        self.cursors.set(table, started_at).await?;
        if !changed.is_empty() {
            info!(
                upserted = report.upserted,
                deleted = report.deleted,
                skipped_pending = report.skipped_pending,
                "对账完成: {}",
                table
            );
        }
        self.events
            .emit_table_change(table, changed, ChangeOrigin::Reconcile);
        Ok(report)
    }
}
