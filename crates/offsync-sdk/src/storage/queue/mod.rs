//! Outbox - 待确认远端写操作的持久化有序队列
//!
//! - 条目只能在 `LocalStore::transact` 内追加，与对应的本地写同一事务提交
//! - 严格按 id（单调递增）FIFO 排空
//! - 失败条目不会被自动丢弃：达到上限后停放，由调用方决定丢弃或修改后重提

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, Result, SyncSDKError};
use crate::storage::entities::{ensure_key_matches, merge_patch, validate_table_name, RecordKey};
use crate::storage::{LocalStore, StoreTxn};
use crate::utils::now_millis;

pub mod outbox_entry;
pub mod retry_policy;

pub use outbox_entry::{EntryState, EntryStatus, MutationOp, OutboxEntry, PendingMutation};
pub use retry_policy::{RetryDecision, RetryPolicy};

/// 丢弃停放条目的结果
#[derive(Debug, Clone)]
pub struct DiscardOutcome {
    pub entry: OutboxEntry,
    /// 本地行是否被回滚（恢复为远端确认值，或删除从未确认过的行）
    pub local_changed: bool,
}

/// 一次失败尝试落盘后的结果
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub attempts: u32,
    pub decision: RetryDecision,
    /// 安排重试时的下一次尝试时间（UTC 毫秒）
    pub retry_at: Option<i64>,
}

/// Outbox 队列
///
/// 由会话构造一次，显式传给同步协调器，没有全局状态。
#[derive(Debug, Clone)]
pub struct Outbox {
    store: LocalStore,
}

impl Outbox {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// 追加条目（只能在事务内调用），返回条目 id
    pub fn enqueue(txn: &mut StoreTxn<'_>, mutation: &PendingMutation) -> Result<i64> {
        validate_table_name(&mutation.table)?;
        if mutation.key.is_empty() {
            return Err(SyncSDKError::InvalidArgument("记录主键不能为空".to_string()));
        }
        match (&mutation.data, mutation.operation.requires_data()) {
            (Some(Value::Object(_)), true) | (None, false) => {}
            (_, true) => {
                return Err(SyncSDKError::InvalidArgument(format!(
                    "{} 操作需要对象负载",
                    mutation.operation
                )))
            }
            (Some(_), false) => {
                return Err(SyncSDKError::InvalidArgument("delete 操作不携带负载".to_string()))
            }
        }
        if let Some(data) = &mutation.data {
            ensure_key_matches(data, txn.pk_field(), &mutation.key)?;
        }
        let id = txn.outbox().insert(mutation)?;
        debug!(
            entry_id = id,
            table = %mutation.table,
            key = %mutation.key,
            op = %mutation.operation,
            "outbox 条目已入队"
        );
        Ok(id)
    }

    /// 下一个可排空的条目（id 最小的 pending 条目）
    pub async fn peek_next(&self) -> Result<Option<OutboxEntry>> {
        self.store.transact(|txn| txn.outbox().next_pending()).await
    }

    /// 记录一次失败的尝试：attempts + 1，写入 last_error；返回新的 attempts
    pub async fn mark_attempt(&self, id: i64, error: Option<String>) -> Result<u32> {
        self.store
            .transact(move |txn| {
                txn.outbox()
                    .increment_attempts(id, error.as_deref())?
                    .ok_or_else(|| SyncSDKError::NotFound(format!("outbox 条目 {}", id)))
            })
            .await
    }

    /// 设置下一次允许尝试的时间（UTC 毫秒）
    pub async fn schedule_retry(&self, id: i64, at: i64) -> Result<()> {
        self.store
            .transact(move |txn| {
                txn.outbox().set_next_attempt(id, Some(at))?;
                Ok(())
            })
            .await
    }

    /// 记录一次失败并按策略决定去向，计数与重试时间（或停放）在同一事务内落盘
    pub async fn record_failure(
        &self,
        id: i64,
        error: &RemoteError,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        let error = error.clone();
        let policy = policy.clone();
        self.store
            .transact(move |txn| {
                let attempts = txn
                    .outbox()
                    .increment_attempts(id, Some(&error.to_string()))?
                    .ok_or_else(|| SyncSDKError::NotFound(format!("outbox 条目 {}", id)))?;
                let decision = policy.decide(attempts, &error);
                let retry_at = match &decision {
                    RetryDecision::RetryAfter(delay) => {
                        let at = now_millis() + delay.as_millis() as i64;
                        txn.outbox().set_next_attempt(id, Some(at))?;
                        Some(at)
                    }
                    RetryDecision::Park(reason) => {
                        txn.outbox().park(id, reason)?;
                        None
                    }
                };
                Ok(FailureOutcome {
                    attempts,
                    decision,
                    retry_at,
                })
            })
            .await
    }

    /// 停放条目，退出排空循环
    pub async fn park(&self, id: i64, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        self.store
            .transact(move |txn| {
                if !txn.outbox().park(id, &reason)? {
                    return Err(SyncSDKError::NotFound(format!("outbox 条目 {}", id)));
                }
                Ok(())
            })
            .await?;
        warn!(entry_id = id, "outbox 条目已停放");
        Ok(())
    }

    /// 确认成功后移除条目
    pub async fn remove(&self, id: i64) -> Result<bool> {
        self.store.transact(move |txn| txn.outbox().delete(id)).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        self.store.transact(move |txn| txn.outbox().get(id)).await
    }

    /// 全部条目，按 id 排序
    pub async fn list(&self) -> Result<Vec<OutboxEntry>> {
        self.store.transact(|txn| txn.outbox().list()).await
    }

    pub async fn list_parked(&self) -> Result<Vec<OutboxEntry>> {
        self.store
            .transact(|txn| txn.outbox().list_by_status(EntryStatus::Parked))
            .await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.store
            .transact(|txn| txn.outbox().count_by_status(EntryStatus::Pending))
            .await
    }

    /// 某个 (table, key) 是否还有未确认的写（pending、in_flight 或 parked）
    pub async fn has_pending_for(&self, table: &str, key: &RecordKey) -> Result<bool> {
        let table = table.to_string();
        let key = key.clone();
        self.store
            .transact(move |txn| txn.outbox().has_entries_for(&table, &key))
            .await
    }

    /// 丢弃停放条目
    ///
    /// 同一键上没有其它未确认写时回滚本地行：有远端确认值则恢复，
    /// 从未被远端确认过则删除本地行。
    pub async fn discard(&self, id: i64) -> Result<DiscardOutcome> {
        let outcome = self
            .store
            .transact(move |txn| {
                let entry = txn
                    .outbox()
                    .get(id)?
                    .ok_or_else(|| SyncSDKError::NotFound(format!("outbox 条目 {}", id)))?;
                if !entry.is_parked() {
                    return Err(SyncSDKError::InvalidArgument(format!(
                        "只能丢弃已停放的条目: {}",
                        id
                    )));
                }
                txn.outbox().delete(id)?;

                let mut local_changed = false;
                if !txn.outbox().has_entries_for(&entry.table, &entry.key)? {
                    let confirmed = txn.records(&entry.table)?.confirmed(&entry.key)?;
                    local_changed = match confirmed {
                        Some(data) => {
                            let mut record = txn
                                .get(&entry.table, &entry.key)?
                                .unwrap_or_else(|| {
                                    crate::storage::Record::local(
                                        entry.key.clone(),
                                        data.clone(),
                                        txn.pk_field(),
                                    )
                                });
                            record.data = data;
                            record.updated_at = crate::utils::now_millis();
                            txn.put(&entry.table, &record)?;
                            true
                        }
                        None => txn.delete(&entry.table, &entry.key)?,
                    };
                }
                Ok(DiscardOutcome {
                    entry,
                    local_changed,
                })
            })
            .await?;
        info!(
            entry_id = id,
            table = %outcome.entry.table,
            key = %outcome.entry.key,
            local_changed = outcome.local_changed,
            "已丢弃停放条目"
        );
        Ok(outcome)
    }

    /// 重新提交停放条目
    ///
    /// attempts 归零，保持原 id（顺序不变）。`data` 不为空时同时替换条目负载并写入本地：
    /// update 条目把新 patch 合并进本地行，insert/upsert 条目直接替换本地行。
    pub async fn resubmit(&self, id: i64, data: Option<Value>) -> Result<OutboxEntry> {
        let entry = self
            .store
            .transact(move |txn| {
                let entry = txn
                    .outbox()
                    .get(id)?
                    .ok_or_else(|| SyncSDKError::NotFound(format!("outbox 条目 {}", id)))?;
                if !entry.is_parked() {
                    return Err(SyncSDKError::InvalidArgument(format!(
                        "只能重新提交已停放的条目: {}",
                        id
                    )));
                }
                if let Some(data) = &data {
                    if !entry.operation.requires_data() {
                        return Err(SyncSDKError::InvalidArgument(
                            "delete 条目不能携带负载重提".to_string(),
                        ));
                    }
                    if !data.is_object() {
                        return Err(SyncSDKError::InvalidArgument(
                            "重提负载必须是对象".to_string(),
                        ));
                    }
                    ensure_key_matches(data, txn.pk_field(), &entry.key)?;
                    let local = match entry.operation {
                        MutationOp::Update => {
                            let base = txn
                                .get(&entry.table, &entry.key)?
                                .map(|r| r.data)
                                .unwrap_or_else(|| Value::Object(Default::default()));
                            merge_patch(&base, data)
                        }
                        _ => data.clone(),
                    };
                    txn.put_local(&entry.table, &entry.key, local)?;
                }
                txn.outbox().reset_for_resubmit(id, data.as_ref())?;
                txn.outbox()
                    .get(id)?
                    .ok_or_else(|| SyncSDKError::NotFound(format!("outbox 条目 {}", id)))
            })
            .await?;
        info!(entry_id = id, table = %entry.table, key = %entry.key, "停放条目已重新提交");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Record, DB_FILE_NAME};
    use serde_json::json;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, LocalStore, Outbox) {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join(DB_FILE_NAME), "id").await.unwrap();
        let outbox = Outbox::new(store.clone());
        (dir, store, outbox)
    }

    fn upsert(key: &str, data: Value) -> PendingMutation {
        PendingMutation {
            operation: MutationOp::Upsert,
            table: "goals".to_string(),
            key: key.into(),
            data: Some(data),
        }
    }

    async fn write(store: &LocalStore, mutation: PendingMutation) -> i64 {
        store
            .transact(move |txn| {
                if let Some(data) = mutation.data.clone() {
                    txn.put_local(&mutation.table, &mutation.key, data)?;
                }
                Outbox::enqueue(txn, &mutation)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_validates_payload() {
        let (_dir, store, _outbox) = setup().await;
        let bad = PendingMutation {
            operation: MutationOp::Delete,
            table: "goals".to_string(),
            key: "a".into(),
            data: Some(json!({"x": 1})),
        };
        let result = store.transact(move |txn| Outbox::enqueue(txn, &bad)).await;
        assert!(matches!(result, Err(SyncSDKError::InvalidArgument(_))));

        let scalar = upsert("a", json!(5));
        let result = store.transact(move |txn| Outbox::enqueue(txn, &scalar)).await;
        assert!(matches!(result, Err(SyncSDKError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_payload_with_different_key() {
        let (_dir, store, outbox) = setup().await;
        let insert = PendingMutation {
            operation: MutationOp::Insert,
            table: "goals".to_string(),
            key: "r1".into(),
            data: Some(json!({"id": "other", "title": "x"})),
        };
        let result = store.transact(move |txn| Outbox::enqueue(txn, &insert)).await;
        assert!(matches!(result, Err(SyncSDKError::InvalidArgument(_))));

        let patch = PendingMutation {
            operation: MutationOp::Update,
            table: "goals".to_string(),
            key: "r1".into(),
            data: Some(json!({"id": "r2"})),
        };
        let result = store.transact(move |txn| Outbox::enqueue(txn, &patch)).await;
        assert!(matches!(result, Err(SyncSDKError::InvalidArgument(_))));
        assert!(outbox.list().await.unwrap().is_empty());

        // 与记录键一致的主键字段可以出现在负载里
        write(&store, upsert("r1", json!({"id": "r1", "count": 1}))).await;
        assert_eq!(outbox.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_failure_persists_attempt_and_schedule_together() {
        let (_dir, store, outbox) = setup().await;
        let policy = RetryPolicy {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let id = write(&store, upsert("a", json!({"count": 1}))).await;

        let before = now_millis();
        let outcome = outbox
            .record_failure(id, &RemoteError::transient("timeout"), &policy)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.decision, RetryDecision::RetryAfter(_)));
        let entry = outbox.get(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.next_attempt_at, outcome.retry_at);
        assert!(entry.next_attempt_at.unwrap() >= before + 60_000);
        assert_eq!(entry.last_error.as_deref(), Some(RemoteError::transient("timeout").to_string().as_str()));

        let outcome = outbox
            .record_failure(id, &RemoteError::transient("timeout"), &policy)
            .await
            .unwrap();
        assert!(matches!(outcome.decision, RetryDecision::Park(_)));
        assert_eq!(outcome.retry_at, None);
        let entry = outbox.get(id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert!(entry.is_parked());
        assert_eq!(entry.next_attempt_at, None);

        let missing = outbox
            .record_failure(999, &RemoteError::transient("timeout"), &policy)
            .await;
        assert!(matches!(missing, Err(SyncSDKError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fifo_and_lifecycle() {
        let (_dir, store, outbox) = setup().await;
        let first = write(&store, upsert("a", json!({"count": 1}))).await;
        let second = write(&store, upsert("a", json!({"count": 2}))).await;

        assert_eq!(outbox.pending_count().await.unwrap(), 2);
        assert_eq!(outbox.peek_next().await.unwrap().unwrap().id, first);
        assert!(outbox.has_pending_for("goals", &"a".into()).await.unwrap());

        assert_eq!(outbox.mark_attempt(first, Some("timeout".into())).await.unwrap(), 1);
        outbox.schedule_retry(first, 42).await.unwrap();
        let entry = outbox.get(first).await.unwrap().unwrap();
        assert_eq!(entry.next_attempt_at, Some(42));

        assert!(outbox.remove(first).await.unwrap());
        assert_eq!(outbox.peek_next().await.unwrap().unwrap().id, second);
        assert!(outbox.remove(second).await.unwrap());
        assert!(outbox.list().await.unwrap().is_empty());
        assert!(!outbox.has_pending_for("goals", &"a".into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_discard_restores_confirmed_value() {
        let (_dir, store, outbox) = setup().await;
        store
            .transact(|txn| {
                let mut record = Record::local("a".into(), json!({"count": 1}), "id");
                record.remote_updated_at = Some(10);
                txn.records("goals")?.put_confirmed(&record)
            })
            .await
            .unwrap();

        let id = write(&store, upsert("a", json!({"count": -1}))).await;
        outbox.park(id, "rejected").await.unwrap();
        assert_eq!(outbox.list_parked().await.unwrap().len(), 1);

        let outcome = outbox.discard(id).await.unwrap();
        assert!(outcome.local_changed);
        let record = store.get("goals", &"a".into()).await.unwrap().unwrap();
        assert_eq!(record.data["count"], 1);
        assert!(outbox.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_parked_delete_restores_confirmed_row() {
        let (_dir, store, outbox) = setup().await;
        store
            .transact(|txn| {
                let mut record = Record::local("a".into(), json!({"count": 1}), "id");
                record.remote_updated_at = Some(10);
                txn.records("goals")?.put_confirmed(&record)
            })
            .await
            .unwrap();

        let id = store
            .transact(|txn| {
                txn.delete("goals", &"a".into())?;
                Outbox::enqueue(
                    txn,
                    &PendingMutation {
                        operation: MutationOp::Delete,
                        table: "goals".to_string(),
                        key: "a".into(),
                        data: None,
                    },
                )
            })
            .await
            .unwrap();
        assert!(store.get("goals", &"a".into()).await.unwrap().is_none());
        outbox.park(id, "forbidden").await.unwrap();

        let outcome = outbox.discard(id).await.unwrap();
        assert!(outcome.local_changed);
        let record = store.get("goals", &"a".into()).await.unwrap().unwrap();
        assert_eq!(record.data, json!({"id": "a", "count": 1}));
        assert!(outbox.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_discard_never_confirmed_insert_removes_row() {
        let (_dir, store, outbox) = setup().await;
        let id = write(
            &store,
            PendingMutation {
                operation: MutationOp::Insert,
                table: "goals".to_string(),
                key: "new".into(),
                data: Some(json!({"title": "x"})),
            },
        )
        .await;

        assert!(outbox.discard(id).await.is_err(), "pending entries cannot be discarded");
        outbox.park(id, "duplicate").await.unwrap();
        outbox.discard(id).await.unwrap();
        assert!(store.get("goals", &"new".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resubmit_with_edits() {
        let (_dir, store, outbox) = setup().await;
        let id = write(
            &store,
            PendingMutation {
                operation: MutationOp::Update,
                table: "goals".to_string(),
                key: "a".into(),
                data: Some(json!({"count": -5})),
            },
        )
        .await;
        outbox.mark_attempt(id, Some("invalid".into())).await.unwrap();
        outbox.park(id, "invalid").await.unwrap();

        let entry = outbox.resubmit(id, Some(json!({"count": 5}))).await.unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.data, Some(json!({"count": 5})));

        let record = store.get("goals", &"a".into()).await.unwrap().unwrap();
        assert_eq!(record.data["count"], 5);
        assert_eq!(outbox.peek_next().await.unwrap().unwrap().id, id);
    }
}
