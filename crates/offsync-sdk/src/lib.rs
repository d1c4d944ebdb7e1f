//! Offsync SDK - 离线优先的数据同步 SDK
//!
//! 本 SDK 让应用在没有网络时照常读写，恢复连接后自动与远端对齐：
//! - 本地存储：SQLite 持久化，所有读取都由本地提供
//! - Outbox：本地写与入队同事务提交，按顺序排空，失败指数退避，超过上限停放
//! - 实时合并：订阅远端变更流，未确认的本地写优先
//! - 周期对账：全表快照比对，补上断流期间漏掉的变更
//! - 在线状态：临时的成员表，不落盘
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use offsync_sdk::{MemoryRemote, OffsyncSDK, SyncConfig};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::builder()
//!         .data_dir("/path/to/data")
//!         .table("goals")
//!         .build();
//!
//!     let sdk = OffsyncSDK::initialize(config, Arc::new(MemoryRemote::default()), None).await?;
//!
//!     // 回调句柄 drop 即注销
//!     let _handle = sdk.on_change("goals", |change| {
//!         println!("goals 变更: {:?} ({:?})", change.keys, change.origin);
//!     });
//!
//!     // 立即写入本地，后台同步
//!     let key = sdk.create("goals", json!({"title": "跑步", "count": 0})).await?;
//!     sdk.update("goals", key, json!({"count": 1})).await?;
//!
//!     let status = sdk.get_sync_status().await?;
//!     println!("待同步 {} 个修改", status.pending_count);
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod error;
pub mod events;
pub mod feed_backoff;
pub mod lifecycle;
pub mod network;
pub mod presence;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use config::{SyncConfig, SyncConfigBuilder};
pub use error::{RemoteError, Result, SyncSDKError};
pub use events::{ChangeOrigin, EventFilter, EventManager, ListenerHandle, SyncEvent, TableChange};
pub use lifecycle::{LifecycleHook, LifecycleManager};
pub use network::{NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use presence::{
    MemoryPresence, PresenceConfig, PresenceDiff, PresenceEntry, PresenceManager, PresenceSession,
    PresenceTransport,
};
pub use feed_backoff::{FeedBackoff, FeedBackoffConfig};
pub use remote::{
    ChangeEvent, ChangeEventType, ChangeFeed, FeedSignal, MemoryRemote, RemoteClient, RestRemoteClient,
    RestRemoteConfig,
};
pub use sdk::OffsyncSDK;
pub use storage::entities::{Record, RecordKey};
pub use storage::queue::{DiscardOutcome, EntryStatus, MutationOp, OutboxEntry};
pub use sync::{ReconcileReport, SyncStatus};

#[cfg(test)]
mod tests;

/// 测试用日志初始化（重复调用无效果）
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
