use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 远端错误分类
///
/// 远端适配器只负责分类，不做重试；重试策略全部由同步协调器决定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RemoteError {
    /// 网络、超时、5xx → 可重试
    #[error("transient remote error{}: {message}", fmt_status(.status))]
    Transient { message: String, status: Option<u16> },
    /// 校验失败、冲突、4xx → 不重试，条目停放
    #[error("rejected by remote{}: {message}", fmt_status(.status))]
    Rejected { message: String, status: Option<u16> },
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" [{}]", s)).unwrap_or_default()
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError::Transient { message: message.into(), status: None }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::Rejected { message: message.into(), status: None }
    }

    /// 按 HTTP 状态码分类：5xx、408、429 可重试，其余 4xx 为永久拒绝
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 | 429 | 500..=599 => RemoteError::Transient { message, status: Some(status) },
            _ => RemoteError::Rejected { message, status: Some(status) },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Transient { status, .. } | RemoteError::Rejected { status, .. } => *status,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncSDKError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("KV store error: {0}")]
    KvStore(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not initialized: {0}")]
    NotInitialized(String),
    #[error("Shutting down: {0}")]
    ShuttingDown(String),
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<serde_json::Error> for SyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        SyncSDKError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for SyncSDKError {
    fn from(error: std::io::Error) -> Self {
        SyncSDKError::IO(error.to_string())
    }
}

impl From<sled::Error> for SyncSDKError {
    fn from(error: sled::Error) -> Self {
        SyncSDKError::KvStore(error.to_string())
    }
}

impl SyncSDKError {
    /// 本地存储类错误（配额、损坏、Actor 停止）：整个 mutation 已原子回滚
    pub fn is_storage_error(&self) -> bool {
        matches!(
            self,
            SyncSDKError::Sqlite(_)
                | SyncSDKError::Database(_)
                | SyncSDKError::Migration(_)
                | SyncSDKError::KvStore(_)
        )
    }

    /// 获取远端错误（如果这是一个远端错误）
    pub fn remote_error(&self) -> Option<&RemoteError> {
        match self {
            SyncSDKError::Remote(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncSDKError>;
