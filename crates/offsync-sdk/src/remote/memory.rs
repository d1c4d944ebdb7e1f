//! 进程内远端实现
//!
//! 完整的内存后端：按表存行、每张表一个按提交顺序广播的变更流、upsert 按主键去重。
//! 带故障注入（N 次临时失败、按键永久拒绝、离线开关、暂停写入、模拟断流），
//! 以及已应用操作日志，供测试与无服务端嵌入使用。

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use super::{ChangeEvent, ChangeEventType, ChangeFeed, FeedSignal, RemoteClient};
use crate::error::RemoteError;
use crate::storage::entities::{extract_key, merge_patch, with_key_field, RecordKey};
use crate::storage::queue::{MutationOp, OutboxEntry};
use crate::utils::now_millis;

const FEED_CAPACITY: usize = 256;

/// 已应用到远端的一次写操作
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    pub entry_id: i64,
    pub operation: MutationOp,
    pub table: String,
    pub key: RecordKey,
    pub data: Option<Value>,
}

#[derive(Debug)]
struct Inner {
    pk_field: String,
    ts_field: Option<String>,
    tables: Mutex<HashMap<String, BTreeMap<String, Value>>>,
    feeds: Mutex<HashMap<String, broadcast::Sender<FeedSignal>>>,
    clock: AtomicI64,
    offline: AtomicBool,
    transient_failures: AtomicU32,
    rejected: Mutex<HashSet<(String, String)>>,
    applied: Mutex<Vec<AppliedOp>>,
    apply_calls: AtomicU64,
    paused: watch::Sender<bool>,
}

/// 内存远端
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new("id", Some("updated_at"))
    }
}

impl MemoryRemote {
    /// `ts_field` 不为空时每次提交都会盖上单调递增的毫秒时间戳
    pub fn new(pk_field: &str, ts_field: Option<&str>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pk_field: pk_field.to_string(),
                ts_field: ts_field.map(str::to_string),
                tables: Mutex::new(HashMap::new()),
                feeds: Mutex::new(HashMap::new()),
                clock: AtomicI64::new(0),
                offline: AtomicBool::new(false),
                transient_failures: AtomicU32::new(0),
                rejected: Mutex::new(HashSet::new()),
                applied: Mutex::new(Vec::new()),
                apply_calls: AtomicU64::new(0),
                paused,
            }),
        }
    }

    // ---------- 故障注入 ----------

    /// 离线：所有调用返回临时错误
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// 接下来 n 次 apply 返回 503
    pub fn fail_next(&self, n: u32) {
        self.inner.transient_failures.store(n, Ordering::SeqCst);
    }

    /// 对某个键的写入返回 422
    pub fn reject_key(&self, table: &str, key: &str) {
        self.inner
            .rejected
            .lock()
            .insert((table.to_string(), key.to_string()));
    }

    pub fn allow_key(&self, table: &str, key: &str) {
        self.inner
            .rejected
            .lock()
            .remove(&(table.to_string(), key.to_string()));
    }

    /// 暂停：apply 在进入后阻塞，直到 `resume`（用于观察 in_flight 窗口）
    pub fn pause(&self) {
        self.inner.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.inner.paused.send_replace(false);
    }

    /// 模拟所有变更流断开后重连
    pub fn drop_feeds(&self, reason: &str) {
        for sender in self.inner.feeds.lock().values() {
            let _ = sender.send(FeedSignal::Dropped(reason.to_string()));
            let _ = sender.send(FeedSignal::Reconnected);
        }
    }

    // ---------- 其它写入者 ----------

    /// 以另一个客户端的身份写入一行，并广播变更
    pub fn external_upsert(&self, table: &str, row: Value) -> Option<Value> {
        let key = extract_key(&row, &self.inner.pk_field)?;
        let (old, new) = self.commit_upsert(table, &key, &row, true);
        self.publish(table, old, Some(new.clone()));
        Some(new)
    }

    /// 以另一个客户端的身份删除一行，并广播变更
    pub fn external_delete(&self, table: &str, key: &str) -> bool {
        let old = self
            .inner
            .tables
            .lock()
            .get_mut(table)
            .and_then(|rows| rows.remove(key));
        match old {
            Some(old) => {
                self.publish(table, Some(old), None);
                true
            }
            None => false,
        }
    }

    /// 不改动表内容，直接往变更流里推一个事件（迟到、重复的事件）
    pub fn inject_event(&self, event: ChangeEvent) {
        let sender = self.feed_sender(&event.table);
        let _ = sender.send(FeedSignal::Event(event));
    }

    /// 预置数据，不广播
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut tables = self.inner.tables.lock();
        let entries = tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Some(key) = extract_key(&row, &self.inner.pk_field) {
                let row = self.stamp(row);
                entries.insert(key.into_string(), row);
            }
        }
    }

    // ---------- 观察 ----------

    pub fn row(&self, table: &str, key: &str) -> Option<Value> {
        self.inner
            .tables
            .lock()
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .tables
            .lock()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn applied_ops(&self) -> Vec<AppliedOp> {
        self.inner.applied.lock().clone()
    }

    /// apply 被调用的总次数（包括失败的）
    pub fn apply_calls(&self) -> u64 {
        self.inner.apply_calls.load(Ordering::SeqCst)
    }

    // ---------- 内部 ----------

    fn next_timestamp(&self) -> i64 {
        let now = now_millis();
        let mut current = self.inner.clock.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self
                .inner
                .clock
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn stamp(&self, row: Value) -> Value {
        match (&self.inner.ts_field, row) {
            (Some(field), Value::Object(mut map)) => {
                map.insert(field.clone(), Value::from(self.next_timestamp()));
                Value::Object(map)
            }
            (_, row) => row,
        }
    }

    /// 写入一行；`merge` 为 true 时与已有行浅合并。返回 (旧行, 新行)
    fn commit_upsert(&self, table: &str, key: &RecordKey, row: &Value, merge: bool) -> (Option<Value>, Value) {
        let mut tables = self.inner.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let old = rows.get(key.as_str()).cloned();
        let merged = match (&old, merge) {
            (Some(old), true) => merge_patch(old, row),
            _ => row.clone(),
        };
        let new = self.stamp(with_key_field(merged, &self.inner.pk_field, key));
        rows.insert(key.as_str().to_string(), new.clone());
        (old, new)
    }

    fn feed_sender(&self, table: &str) -> broadcast::Sender<FeedSignal> {
        self.inner
            .feeds
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .clone()
    }

    fn publish(&self, table: &str, old: Option<Value>, new: Option<Value>) {
        let event_type = match (&old, &new) {
            (_, None) => ChangeEventType::Delete,
            (None, Some(_)) => ChangeEventType::Insert,
            (Some(_), Some(_)) => ChangeEventType::Update,
        };
        let event = ChangeEvent {
            table: table.to_string(),
            event_type,
            new_record: new,
            old_record: old,
        };
        let _ = self.feed_sender(table).send(FeedSignal::Event(event));
    }

    async fn wait_if_paused(&self) {
        let mut rx = self.inner.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn apply(&self, entry: &OutboxEntry) -> Result<Option<Value>, RemoteError> {
        self.wait_if_paused().await;
        self.inner.apply_calls.fetch_add(1, Ordering::SeqCst);

        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("network unreachable"));
        }
        let injected = self
            .inner
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(RemoteError::from_status(503, "service unavailable"));
        }
        if self
            .inner
            .rejected
            .lock()
            .contains(&(entry.table.clone(), entry.key.as_str().to_string()))
        {
            return Err(RemoteError::from_status(422, "validation failed"));
        }

        let table = entry.table.as_str();
        let key = &entry.key;
        let result = match entry.operation {
            MutationOp::Insert => {
                // 键由客户端生成，同键已存在说明是上次提交后的重放
                if let Some(existing) = self.row(table, key.as_str()) {
                    debug!(entry_id = entry.id, table = %entry.table, key = %entry.key, "插入重放，按已提交处理");
                    return Ok(Some(existing));
                }
                let row = entry.row_with_key(&self.inner.pk_field).unwrap_or(Value::Null);
                let (old, new) = self.commit_upsert(table, key, &row, false);
                self.publish(table, old, Some(new.clone()));
                Some(new)
            }
            MutationOp::Upsert => {
                let row = entry.row_with_key(&self.inner.pk_field).unwrap_or(Value::Null);
                let (old, new) = self.commit_upsert(table, key, &row, true);
                self.publish(table, old, Some(new.clone()));
                Some(new)
            }
            MutationOp::Update => {
                if self.row(table, key.as_str()).is_none() {
                    None
                } else {
                    let patch = entry.data.clone().unwrap_or(Value::Null);
                    let (old, new) = self.commit_upsert(table, key, &patch, true);
                    self.publish(table, old, Some(new.clone()));
                    Some(new)
                }
            }
            MutationOp::Delete => {
                let old = self
                    .inner
                    .tables
                    .lock()
                    .get_mut(table)
                    .and_then(|rows| rows.remove(key.as_str()));
                if let Some(old) = old {
                    self.publish(table, Some(old), None);
                }
                None
            }
        };

        self.inner.applied.lock().push(AppliedOp {
            entry_id: entry.id,
            operation: entry.operation,
            table: entry.table.clone(),
            key: entry.key.clone(),
            data: entry.data.clone(),
        });
        debug!(entry_id = entry.id, table = %entry.table, key = %entry.key, "内存远端已提交");
        Ok(result)
    }

    async fn fetch_snapshot(&self, table: &str) -> Result<Vec<Value>, RemoteError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("network unreachable"));
        }
        Ok(self.rows(table))
    }

    async fn subscribe(&self, table: &str) -> Result<ChangeFeed, RemoteError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::transient("network unreachable"));
        }
        let mut source = self.feed_sender(table).subscribe();
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        let task = tokio::spawn(async move {
            loop {
                let signal = match source.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        if tx.send(FeedSignal::Dropped(format!("lagged {} events", n))).await.is_err() {
                            break;
                        }
                        FeedSignal::Reconnected
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(signal).await.is_err() {
                    break;
                }
            }
        });
        Ok(ChangeFeed::new(table, rx, Some(task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::EntryStatus;
    use serde_json::json;
    use std::time::Duration;

    fn entry(id: i64, operation: MutationOp, key: &str, data: Option<Value>) -> OutboxEntry {
        OutboxEntry {
            id,
            operation,
            table: "goals".to_string(),
            key: key.into(),
            data,
            attempts: 0,
            status: EntryStatus::Pending,
            created_at: 0,
            last_error: None,
            next_attempt_at: None,
            parked_at: None,
        }
    }

    #[tokio::test]
    async fn test_apply_operations_and_feed() {
        let remote = MemoryRemote::default();
        let mut feed = remote.subscribe("goals").await.unwrap();

        let row = remote
            .apply(&entry(1, MutationOp::Insert, "g1", Some(json!({"count": 1}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["id"], "g1");
        assert!(row["updated_at"].as_i64().is_some());

        let replay = remote
            .apply(&entry(2, MutationOp::Insert, "g1", Some(json!({"count": 1}))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replay, row);

        remote
            .apply(&entry(3, MutationOp::Update, "g1", Some(json!({"count": 2}))))
            .await
            .unwrap();
        assert_eq!(remote.row("goals", "g1").unwrap()["count"], 2);

        remote.apply(&entry(4, MutationOp::Delete, "g1", None)).await.unwrap();
        assert!(remote.row("goals", "g1").is_none());

        let mut types = Vec::new();
        for _ in 0..3 {
            match tokio::time::timeout(Duration::from_secs(1), feed.recv()).await.unwrap() {
                Some(FeedSignal::Event(e)) => types.push(e.event_type),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            types,
            vec![ChangeEventType::Insert, ChangeEventType::Update, ChangeEventType::Delete]
        );
        assert_eq!(remote.applied_ops().len(), 3);
        assert_eq!(remote.apply_calls(), 4);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let remote = MemoryRemote::default();
        remote.fail_next(2);
        let e = entry(1, MutationOp::Upsert, "g1", Some(json!({"count": 1})));
        assert!(remote.apply(&e).await.unwrap_err().is_retryable());
        assert!(remote.apply(&e).await.unwrap_err().is_retryable());
        assert!(remote.apply(&e).await.is_ok());

        remote.reject_key("goals", "g1");
        assert!(!remote.apply(&e).await.unwrap_err().is_retryable());
        remote.allow_key("goals", "g1");

        remote.set_offline(true);
        assert!(remote.fetch_snapshot("goals").await.is_err());
        assert!(remote.subscribe("goals").await.is_err());
        remote.set_offline(false);
        assert_eq!(remote.fetch_snapshot("goals").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timestamps_are_monotonic() {
        let remote = MemoryRemote::default();
        let a = remote.external_upsert("goals", json!({"id": "a"})).unwrap();
        let b = remote.external_upsert("goals", json!({"id": "a", "x": 1})).unwrap();
        assert!(b["updated_at"].as_i64() > a["updated_at"].as_i64());
        assert!(remote.external_delete("goals", "a"));
        assert!(!remote.external_delete("goals", "a"));
    }

    #[tokio::test]
    async fn test_pause_blocks_apply() {
        let remote = MemoryRemote::default();
        remote.pause();
        let task = {
            let remote = remote.clone();
            tokio::spawn(async move {
                remote
                    .apply(&entry(1, MutationOp::Upsert, "g1", Some(json!({}))))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(remote.apply_calls(), 0);
        remote.resume();
        task.await.unwrap().unwrap();
        assert_eq!(remote.apply_calls(), 1);
    }
}
