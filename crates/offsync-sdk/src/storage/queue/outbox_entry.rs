use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{Result, SyncSDKError};
use crate::storage::entities::{with_key_field, RecordKey};

/// 写操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Insert => "insert",
            MutationOp::Update => "update",
            MutationOp::Upsert => "upsert",
            MutationOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(MutationOp::Insert),
            "update" => Ok(MutationOp::Update),
            "upsert" => Ok(MutationOp::Upsert),
            "delete" => Ok(MutationOp::Delete),
            other => Err(SyncSDKError::Serialization(format!("未知的操作类型: {}", other))),
        }
    }

    /// delete 不携带负载，其余操作必须携带对象负载
    pub fn requires_data(&self) -> bool {
        !matches!(self, MutationOp::Delete)
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 条目持久化状态
///
/// in_flight / retry_wait 不落盘：重启后 in_flight 条目回到 pending 重新排空，
/// retry_wait 由 `next_attempt_at` 表达。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Parked,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Parked => "parked",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EntryStatus::Pending),
            "parked" => Ok(EntryStatus::Parked),
            other => Err(SyncSDKError::Serialization(format!("未知的条目状态: {}", other))),
        }
    }
}

/// 协调器视角的条目状态机
///
/// `pending → in_flight → (confirmed | retry_wait | parked)`，`retry_wait → in_flight`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Pending,
    InFlight,
    RetryWait,
    Parked,
    Confirmed,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryState::Pending => write!(f, "等待排空"),
            EntryState::InFlight => write!(f, "发送中"),
            EntryState::RetryWait => write!(f, "等待重试"),
            EntryState::Parked => write!(f, "已停放"),
            EntryState::Confirmed => write!(f, "已确认"),
        }
    }
}

/// 待写入 Outbox 的写操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub operation: MutationOp,
    pub table: String,
    pub key: RecordKey,
    pub data: Option<Value>,
}

/// Outbox 条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// 单调递增序号，排空严格按此顺序
    pub id: i64,
    pub operation: MutationOp,
    pub table: String,
    pub key: RecordKey,
    pub data: Option<Value>,
    /// 已尝试次数（重启后沿用，退避姿态不重置）
    pub attempts: u32,
    pub status: EntryStatus,
    pub created_at: i64,
    pub last_error: Option<String>,
    /// 下次允许尝试的时间（UTC 毫秒），None 表示立即可发
    pub next_attempt_at: Option<i64>,
    pub parked_at: Option<i64>,
}

impl OutboxEntry {
    pub fn is_parked(&self) -> bool {
        self.status == EntryStatus::Parked
    }

    /// 当前状态（in_flight 由协调器在内存中跟踪，需要调用方告知）
    pub fn state(&self, now: i64, in_flight: bool) -> EntryState {
        if self.is_parked() {
            EntryState::Parked
        } else if in_flight {
            EntryState::InFlight
        } else if self.next_attempt_at.map_or(false, |at| at > now) {
            EntryState::RetryWait
        } else {
            EntryState::Pending
        }
    }

    /// 发往远端的行：对象负载补上主键字段
    pub fn row_with_key(&self, pk_field: &str) -> Option<Value> {
        self.data
            .clone()
            .map(|data| with_key_field(data, pk_field, &self.key))
    }
}
