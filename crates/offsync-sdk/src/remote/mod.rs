//! 远端客户端 - 对远端关系型后端的薄适配层
//!
//! - `apply` 把一个 outbox 条目写到远端，返回远端提交后的行
//! - `fetch_snapshot` 拉取整张表，用于周期性对账
//! - `subscribe` 打开一个逐表的实时变更流，句柄 drop 即退订
//!
//! 适配器只负责错误分类（临时 / 永久拒绝），从不重试；重试策略全部在同步协调器里。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::RemoteError;
use crate::storage::queue::OutboxEntry;

pub mod memory;
pub mod rest;
pub mod sse;

pub use memory::{AppliedOp, MemoryRemote};
pub use rest::{RestRemoteClient, RestRemoteConfig};

/// 远端变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// 远端变更事件
///
/// 同一张表的事件按提交顺序到达；不同表之间、以及相对本地排空都没有顺序保证。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub table: String,
    pub event_type: ChangeEventType,
    #[serde(default)]
    pub new_record: Option<Value>,
    #[serde(default)]
    pub old_record: Option<Value>,
}

impl ChangeEvent {
    /// 事件中携带主键的那一行（delete 取旧行）
    pub fn keyed_row(&self) -> Option<&Value> {
        match self.event_type {
            ChangeEventType::Delete => self.old_record.as_ref().or(self.new_record.as_ref()),
            _ => self.new_record.as_ref(),
        }
    }
}

/// 变更流上的信号
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// 连接断开，适配器正在按自己的退避重连
    Dropped(String),
    /// 断开后已重连（期间可能漏掉事件，需要对账）
    Reconnected,
}

/// 实时变更流句柄
///
/// 拥有后台读取任务；drop 或 `close()` 时任务被中止，退订是结构化的。
pub struct ChangeFeed {
    table: String,
    receiver: mpsc::Receiver<FeedSignal>,
    task: Option<JoinHandle<()>>,
}

impl ChangeFeed {
    pub fn new(table: impl Into<String>, receiver: mpsc::Receiver<FeedSignal>, task: Option<JoinHandle<()>>) -> Self {
        Self {
            table: table.into(),
            receiver,
            task,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// 下一个信号；None 表示流已经结束
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        self.receiver.recv().await
    }

    pub fn close(self) {}
}

impl fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFeed").field("table", &self.table).finish()
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// 远端客户端
#[async_trait]
pub trait RemoteClient: Send + Sync + fmt::Debug {
    /// 把一个条目写到远端；成功时返回远端提交后的行（delete 或无回显时为 None）
    ///
    /// 同一条目可能被重复提交（远端已提交、本地确认前进程退出），实现必须按键幂等：
    /// 重复的 insert 视为已提交，delete 不存在的行视为成功。
    async fn apply(&self, entry: &OutboxEntry) -> Result<Option<Value>, RemoteError>;

    /// 拉取整张表的当前快照
    async fn fetch_snapshot(&self, table: &str) -> Result<Vec<Value>, RemoteError>;

    /// 打开逐表实时变更流
    async fn subscribe(&self, table: &str) -> Result<ChangeFeed, RemoteError>;
}
