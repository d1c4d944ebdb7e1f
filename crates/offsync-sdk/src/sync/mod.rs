/// 同步模块
///
/// 职责：
/// - 按 id 顺序排空 outbox，带退避重试与停放（drain）
/// - 合并实时变更流事件，本地未确认写优先（change_applier）
/// - 周期性全表对账，兜底漏掉或重复的事件（reconciler）
/// - 编排以上后台任务的生命周期（coordinator）

pub mod change_applier;
pub mod coordinator;
pub mod cursor_store;
pub mod drain;
pub mod reconciler;

pub use change_applier::{ChangeApplier, MergeOutcome};
pub use coordinator::SyncCoordinator;
pub use cursor_store::SyncCursorStore;
pub use drain::{DrainStep, DrainWorker};
pub use reconciler::{ReconcileReport, Reconciler};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::storage::entities::RecordKey;
use crate::storage::queue::OutboxEntry;

/// 同步状态摘要（用于 "离线：N 个修改待同步" 一类的状态指示）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    /// pending 条目数（含等待重试的）
    pub pending_count: u64,
    /// 已停放、等待调用方决定的条目
    pub parked_entries: Vec<OutboxEntry>,
    pub is_online: bool,
    /// 正在发往远端的条目 id
    pub in_flight: Option<i64>,
    /// 每个逻辑表最后一次成功对账的时间（UTC 毫秒）
    pub last_reconciled_at: HashMap<String, i64>,
}

/// 正在发往远端的条目
#[derive(Debug, Clone, PartialEq)]
pub struct InFlight {
    pub entry_id: i64,
    pub table: String,
    pub key: RecordKey,
}

/// 单飞排空只有一个在途条目
#[derive(Debug, Default)]
pub struct InFlightTracker {
    current: Mutex<Option<InFlight>>,
}

impl InFlightTracker {
    pub fn set(&self, entry: &OutboxEntry) {
        *self.current.lock() = Some(InFlight {
            entry_id: entry.id,
            table: entry.table.clone(),
            key: entry.key.clone(),
        });
    }

    pub fn clear(&self) {
        *self.current.lock() = None;
    }

    pub fn get(&self) -> Option<InFlight> {
        self.current.lock().clone()
    }
}
