//! 端到端场景：会话 + 内存远端

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::events::{ChangeOrigin, EventFilter, SyncEvent};
use crate::presence::MemoryPresence;
use crate::remote::memory::MemoryRemote;
use crate::remote::RemoteClient;
use crate::storage::queue::MutationOp;
use crate::{init_test_tracing, OffsyncSDK, SyncConfig, SyncConfigBuilder};

fn base_config(dir: &TempDir, online: bool) -> SyncConfigBuilder {
    SyncConfig::builder()
        .data_dir(dir.path())
        .table("goals")
        .start_online(online)
        .reconciliation_interval_ms(60_000)
        .backoff(10, 50)
        .shutdown_timeout_ms(1_000)
}

async fn open(config: SyncConfig, remote: &MemoryRemote) -> Arc<OffsyncSDK> {
    OffsyncSDK::initialize(config, Arc::new(remote.clone()), None)
        .await
        .unwrap()
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn wait_drained(sdk: &Arc<OffsyncSDK>) {
    wait_until(|| {
        let sdk = sdk.clone();
        async move { sdk.list_outbox().await.unwrap().is_empty() }
    })
    .await;
}

async fn local_count(sdk: &OffsyncSDK, key: &str) -> Option<Value> {
    sdk.get("goals", &key.into())
        .await
        .unwrap()
        .map(|record| record.data["count"].clone())
}

#[tokio::test]
async fn test_offline_create_syncs_after_reconnect() {
    init_test_tracing();
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, false).build(), &remote).await;

    let key = sdk.create("goals", json!({"title": "read", "count": 0})).await.unwrap();
    assert_eq!(local_count(&sdk, key.as_str()).await, Some(json!(0)));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(remote.row("goals", key.as_str()).is_none());
    assert_eq!(sdk.get_sync_status().await.unwrap().pending_count, 1);

    sdk.set_online(true);
    wait_drained(&sdk).await;

    let row = remote.row("goals", key.as_str()).unwrap();
    assert_eq!(row["title"], "read");
    assert_eq!(row["id"], key.as_str());
    assert_eq!(sdk.get_sync_status().await.unwrap().pending_count, 0);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queued_updates_apply_in_order() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, false).build(), &remote).await;

    let key = sdk.create("goals", json!({"count": 1})).await.unwrap();
    sdk.update("goals", key.clone(), json!({"count": 2})).await.unwrap();
    sdk.update("goals", key.clone(), json!({"count": 3})).await.unwrap();

    sdk.set_online(true);
    wait_drained(&sdk).await;

    let ops = remote.applied_ops();
    let kinds: Vec<MutationOp> = ops.iter().map(|op| op.operation).collect();
    assert_eq!(kinds, vec![MutationOp::Insert, MutationOp::Update, MutationOp::Update]);
    assert!(ops.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
    assert_eq!(remote.row("goals", key.as_str()).unwrap()["count"], 3);
    assert_eq!(local_count(&sdk, key.as_str()).await, Some(json!(3)));
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_local_write_wins_while_in_flight() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).build(), &remote).await;

    remote.pause();
    sdk.upsert("goals", "g".into(), json!({"count": 1})).await.unwrap();
    wait_until(|| {
        let sdk = sdk.clone();
        async move { sdk.get_sync_status().await.unwrap().in_flight.is_some() }
    })
    .await;

    // 其它客户端在确认之前写了同一行
    remote.external_upsert("goals", json!({"id": "g", "count": 99}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(local_count(&sdk, "g").await, Some(json!(1)));

    remote.resume();
    wait_drained(&sdk).await;
    assert_eq!(remote.row("goals", "g").unwrap()["count"], 1);
    assert_eq!(local_count(&sdk, "g").await, Some(json!(1)));
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_failures_park_after_max_attempts() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).max_attempts(3).build(), &remote).await;
    let mut parked_events = sdk.subscribe_filtered(
        EventFilter::new().with_event_types(vec!["entry_parked".to_string()]),
    );

    remote.fail_next(100);
    let key = sdk.create("goals", json!({"count": 1})).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), parked_events.recv())
        .await
        .unwrap()
        .unwrap();
    let entry_id = match event {
        SyncEvent::EntryParked { entry_id, .. } => entry_id,
        other => panic!("unexpected event {:?}", other),
    };
    assert_eq!(remote.apply_calls(), 3);

    let status = sdk.get_sync_status().await.unwrap();
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.parked_entries.len(), 1);
    assert_eq!(status.parked_entries[0].attempts, 3);

    // 从未被确认过的插入，丢弃后本地行随之消失
    let outcome = sdk.discard_parked(entry_id).await.unwrap();
    assert!(outcome.local_changed);
    assert!(sdk.get("goals", &key).await.unwrap().is_none());
    assert!(sdk.list_outbox().await.unwrap().is_empty());
    assert_eq!(remote.apply_calls(), 3);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_rejected_entry_resubmitted_with_edit() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).build(), &remote).await;

    remote.reject_key("goals", "bad");
    sdk.upsert("goals", "bad".into(), json!({"count": -1})).await.unwrap();
    sdk.upsert("goals", "fine".into(), json!({"count": 1})).await.unwrap();

    // 被拒绝的键停放，不阻塞其它键
    wait_until(|| {
        let remote = remote.clone();
        async move { remote.row("goals", "fine").is_some() }
    })
    .await;
    let parked = sdk.get_sync_status().await.unwrap().parked_entries;
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].key.as_str(), "bad");
    assert!(parked[0].last_error.is_some());

    remote.allow_key("goals", "bad");
    let entry = sdk
        .resubmit_parked(parked[0].id, Some(json!({"count": 0})))
        .await
        .unwrap();
    assert_eq!(entry.attempts, 0);
    assert_eq!(local_count(&sdk, "bad").await, Some(json!(0)));

    wait_drained(&sdk).await;
    assert_eq!(remote.row("goals", "bad").unwrap()["count"], 0);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outbox_and_attempts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();

    let sdk = open(base_config(&dir, true).backoff(300, 300).build(), &remote).await;
    remote.fail_next(1);
    let key = sdk.create("goals", json!({"count": 7})).await.unwrap();
    wait_until(|| {
        let sdk = sdk.clone();
        async move {
            sdk.list_outbox()
                .await
                .unwrap()
                .first()
                .map_or(false, |entry| entry.attempts == 1)
        }
    })
    .await;
    sdk.shutdown().await.unwrap();
    drop(sdk);

    let sdk = open(base_config(&dir, true).backoff(300, 300).build(), &remote).await;
    assert_eq!(local_count(&sdk, key.as_str()).await, Some(json!(7)));
    let entries = sdk.list_outbox().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts, 1);

    wait_drained(&sdk).await;
    assert_eq!(remote.row("goals", key.as_str()).unwrap()["count"], 7);
    assert_eq!(remote.apply_calls(), 2);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_drain_replay_after_crash_matches_uninterrupted_run() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();

    let sdk = open(base_config(&dir, false).build(), &remote).await;
    sdk.create("goals", json!({"id": "r1", "count": 1})).await.unwrap();
    sdk.update("goals", "r1".into(), json!({"count": 2})).await.unwrap();
    sdk.upsert("goals", "r2".into(), json!({"count": 5})).await.unwrap();
    sdk.delete("goals", "r2".into()).await.unwrap();
    let entries = sdk.list_outbox().await.unwrap();
    assert_eq!(entries.len(), 4);
    sdk.shutdown().await.unwrap();
    drop(sdk);

    // 每个条目都已在远端提交，但进程在本地确认前退出
    for entry in &entries {
        remote.apply(entry).await.unwrap();
    }
    let committed_ops = remote.applied_ops().len();

    let sdk = open(base_config(&dir, true).build(), &remote).await;
    wait_drained(&sdk).await;

    let status = sdk.get_sync_status().await.unwrap();
    assert!(status.parked_entries.is_empty());
    assert_eq!(remote.row("goals", "r1").unwrap()["count"], 2);
    assert!(remote.row("goals", "r2").is_none());
    wait_until(|| {
        let sdk = sdk.clone();
        async move {
            local_count(&sdk, "r1").await == Some(json!(2))
                && sdk.get("goals", &"r2".into()).await.unwrap().is_none()
        }
    })
    .await;
    // 重放的插入不会再次落到远端
    let replayed: Vec<MutationOp> = remote.applied_ops()[committed_ops..]
        .iter()
        .map(|op| op.operation)
        .collect();
    assert!(!replayed.contains(&MutationOp::Insert));
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_payload_cannot_change_record_key() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).build(), &remote).await;

    let result = sdk
        .mutate("goals", MutationOp::Insert, "r1".into(), Some(json!({"id": "other", "count": 1})))
        .await;
    assert!(matches!(result, Err(crate::SyncSDKError::InvalidArgument(_))));
    assert!(sdk.get("goals", &"r1".into()).await.unwrap().is_none());
    assert!(sdk.list_outbox().await.unwrap().is_empty());

    sdk.upsert("goals", "r1".into(), json!({"count": 1})).await.unwrap();
    let result = sdk.update("goals", "r1".into(), json!({"id": "other"})).await;
    assert!(matches!(result, Err(crate::SyncSDKError::InvalidArgument(_))));

    wait_drained(&sdk).await;
    sdk.force_reconcile(Some("goals")).await.unwrap();
    let keys: Vec<String> = sdk
        .list("goals")
        .await
        .unwrap()
        .into_iter()
        .map(|record| record.key.into_string())
        .collect();
    assert_eq!(keys, vec!["r1".to_string()]);
    assert_eq!(remote.row("goals", "r1").unwrap()["id"], "r1");
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discarding_rejected_delete_restores_row() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).build(), &remote).await;

    sdk.upsert("goals", "keep".into(), json!({"count": 3})).await.unwrap();
    wait_drained(&sdk).await;

    remote.reject_key("goals", "keep");
    sdk.delete("goals", "keep".into()).await.unwrap();
    assert!(sdk.get("goals", &"keep".into()).await.unwrap().is_none());
    wait_until(|| {
        let sdk = sdk.clone();
        async move { sdk.get_sync_status().await.unwrap().parked_entries.len() == 1 }
    })
    .await;

    let parked = sdk.get_sync_status().await.unwrap().parked_entries;
    let outcome = sdk.discard_parked(parked[0].id).await.unwrap();
    assert!(outcome.local_changed);
    assert_eq!(local_count(&sdk, "keep").await, Some(json!(3)));
    assert_eq!(remote.row("goals", "keep").unwrap()["count"], 3);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reconcile_repairs_missed_changes() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    remote.seed("goals", vec![json!({"id": "a", "count": 1}), json!({"id": "b", "count": 2})]);

    let sdk = open(base_config(&dir, true).build(), &remote).await;
    wait_until(|| {
        let sdk = sdk.clone();
        async move { sdk.list("goals").await.unwrap().len() == 2 }
    })
    .await;
    sdk.shutdown().await.unwrap();
    drop(sdk);

    // 会话关闭期间发生的变更，变更流不会补发
    remote.external_delete("goals", "b");
    remote.external_upsert("goals", json!({"id": "a", "count": 5}));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let sdk = open(base_config(&dir, false).build(), &remote).await;
    sdk.create("goals", json!({"id": "draft", "count": 0})).await.unwrap();

    let reports = sdk.force_reconcile(Some("goals")).await.unwrap();
    assert_eq!(reports[0].deleted, 1);
    assert_eq!(reports[0].upserted, 1);
    assert_eq!(reports[0].skipped_pending, 1);

    assert_eq!(local_count(&sdk, "a").await, Some(json!(5)));
    assert!(sdk.get("goals", &"b".into()).await.unwrap().is_none());
    assert!(sdk.get("goals", &"draft".into()).await.unwrap().is_some());
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_feed_drop_triggers_reconcile() {
    let dir = TempDir::new().unwrap();
    let remote = MemoryRemote::default();
    let sdk = open(base_config(&dir, true).build(), &remote).await;
    let mut restored = sdk.subscribe_filtered(
        EventFilter::new().with_event_types(vec!["subscription_restored".to_string()]),
    );
    let mut changes = sdk.subscribe_filtered(
        EventFilter::new()
            .with_event_types(vec!["table_changed".to_string()])
            .with_tables(vec!["goals".to_string()]),
    );

    // 断流期间的写入只能靠恢复后的对账补上
    remote.seed("goals", vec![json!({"id": "missed", "count": 4})]);
    let mut seen = false;
    for _ in 0..100 {
        remote.drop_feeds("connection reset");
        if tokio::time::timeout(Duration::from_millis(20), restored.recv()).await.is_ok() {
            seen = true;
            break;
        }
    }
    assert!(seen);

    wait_until(|| {
        let sdk = sdk.clone();
        async move { sdk.get("goals", &"missed".into()).await.unwrap().is_some() }
    })
    .await;
    let mut reconciled = false;
    while let Ok(event) = changes.try_recv() {
        if let SyncEvent::TableChanged(change) = event {
            reconciled |= change.origin == ChangeOrigin::Reconcile
                && change.keys.iter().any(|k| k.as_str() == "missed");
        }
    }
    assert!(reconciled);
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_presence_across_sessions() {
    let hub = MemoryPresence::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let remote = MemoryRemote::default();

    let a = OffsyncSDK::initialize(
        base_config(&dir_a, true).build(),
        Arc::new(remote.clone()),
        Some(Arc::new(hub.clone())),
    )
    .await
    .unwrap();
    let b = OffsyncSDK::initialize(
        base_config(&dir_b, true).build(),
        Arc::new(remote.clone()),
        Some(Arc::new(hub.clone())),
    )
    .await
    .unwrap();

    let session = a
        .presence()
        .unwrap()
        .track("alice", json!({"viewing": "goals"}))
        .await
        .unwrap();
    let b_presence = b.presence().unwrap().clone();
    wait_until(|| {
        let b_presence = b_presence.clone();
        async move { b_presence.members().iter().any(|m| m.member_key == "alice") }
    })
    .await;

    session.untrack().await.unwrap();
    wait_until(|| {
        let b_presence = b_presence.clone();
        async move { b_presence.members().is_empty() }
    })
    .await;

    // 关闭会话时 untrack 当前成员
    let _again = a.presence().unwrap().track("alice", json!({})).await.unwrap();
    a.shutdown().await.unwrap();
    wait_until(|| {
        let b_presence = b_presence.clone();
        async move { b_presence.members().is_empty() }
    })
    .await;
    b.shutdown().await.unwrap();
}
