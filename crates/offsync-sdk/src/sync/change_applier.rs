//! 变更事件合并器 - 将实时变更流的事件写入本地表
//!
//! 规则（带本地优先的最后写入者胜出）：
//! - 该键上还有未确认的本地写（pending / in_flight / parked）时，事件被忽略
//! - insert/update：远端时间戳比本地已知的更旧时忽略（迟到的事件）
//! - delete：删除本地行
//!
//! 检查与写入在同一个本地事务中完成，不会与 mutate 交错。

use tracing::{debug, warn};

use crate::error::Result;
use crate::events::{ChangeOrigin, EventManager};
use crate::remote::{ChangeEvent, ChangeEventType};
use crate::storage::entities::{extract_key, Record};
use crate::storage::LocalStore;

/// 合并结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// 本地表已更新
    Applied,
    /// 该键有未确认的本地写，本地值保留
    SkippedPending,
    /// 事件比本地已知的远端值更旧
    SkippedStale,
    /// 本地已经是这个值（例如自己写入的回显）
    Unchanged,
    /// 事件缺少主键，无法定位
    Ignored,
}

#[derive(Debug, Clone)]
pub struct ChangeApplier {
    store: LocalStore,
    events: EventManager,
    ts_field: Option<String>,
}

impl ChangeApplier {
    pub fn new(store: LocalStore, events: EventManager, ts_field: Option<String>) -> Self {
        Self {
            store,
            events,
            ts_field,
        }
    }

    pub async fn apply(&self, event: ChangeEvent) -> Result<MergeOutcome> {
        let pk_field = self.store.pk_field().to_string();
        let Some(key) = event.keyed_row().and_then(|row| extract_key(row, &pk_field)) else {
            warn!("变更事件缺少主键字段 {}: table={}", pk_field, event.table);
            return Ok(MergeOutcome::Ignored);
        };

        let ts_field = self.ts_field.clone();
        let table = event.table.clone();
        let merge_key = key.clone();
        let outcome = self
            .store
            .transact(move |txn| {
                if txn.outbox().has_entries_for(&event.table, &merge_key)? {
                    return Ok(MergeOutcome::SkippedPending);
                }
                let existing = txn.get(&event.table, &merge_key)?;

                match event.event_type {
                    ChangeEventType::Insert | ChangeEventType::Update => {
                        let Some(row) = event.new_record.as_ref() else {
                            return Ok(MergeOutcome::Ignored);
                        };
                        let incoming = Record::from_remote_row(row, txn.pk_field(), ts_field.as_deref())?;
                        if let Some(existing) = &existing {
                            if let (Some(local_ts), Some(remote_ts)) =
                                (existing.remote_updated_at, incoming.remote_updated_at)
                            {
                                if remote_ts < local_ts {
                                    return Ok(MergeOutcome::SkippedStale);
                                }
                            }
                            if existing.data == incoming.data {
                                return Ok(MergeOutcome::Unchanged);
                            }
                        }
                        txn.records(&event.table)?.put_confirmed(&incoming)?;
                        Ok(MergeOutcome::Applied)
                    }
                    ChangeEventType::Delete => {
                        if txn.records(&event.table)?.remove_confirmed(&merge_key)? {
                            Ok(MergeOutcome::Applied)
                        } else {
                            Ok(MergeOutcome::Unchanged)
                        }
                    }
                }
            })
            .await?;

        debug!(table = %table, key = %key, ?outcome, "合并远端变更");
        if outcome == MergeOutcome::Applied {
            self.events
                .emit_table_change(&table, vec![key], ChangeOrigin::Remote);
        }
        Ok(outcome)
    }
}
