//! SDK 配置
//!
//! 所有字段都有默认值；配置文件只需写需要覆盖的字段。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncSDKError};
use crate::presence::PresenceConfig;
use crate::feed_backoff::FeedBackoffConfig;
use crate::storage::entities::validate_table_name;
use crate::storage::DB_FILE_NAME;

/// 同步引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 数据目录（SQLite 数据库与 KV 存储都在这里）
    pub data_dir: PathBuf,
    /// 需要订阅与对账的逻辑表
    pub tables: Vec<String>,
    /// 周期性全表对账间隔（毫秒）
    pub reconciliation_interval_ms: u64,
    /// 最大尝试次数，之后条目停放
    pub max_attempts: u32,
    /// 退避基础延迟（毫秒）
    pub backoff_base_ms: u64,
    /// 退避延迟上限（毫秒）
    pub backoff_cap_ms: u64,
    /// 退避倍数
    pub backoff_factor: f64,
    /// 抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
    /// 关闭时等待后台任务的上限（毫秒），超时后强制释放
    pub shutdown_timeout_ms: u64,
    /// 事件总线缓冲区大小
    pub event_capacity: usize,
    /// 记录负载中的主键字段名
    pub primary_key_field: String,
    /// 远端行的提交时间字段，用于"更新的远端时间戳覆盖本地"规则；None 表示不比较
    pub timestamp_field: Option<String>,
    /// 启动时假定的网络状态
    pub start_online: bool,
    /// 实时变更流重连节奏（与 outbox 退避独立）
    pub reconnect: FeedBackoffConfig,
    /// 在线状态
    pub presence: PresenceConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            tables: Vec::new(),
            reconciliation_interval_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
            shutdown_timeout_ms: 5_000,
            event_capacity: 1_024,
            primary_key_field: "id".to_string(),
            timestamp_field: Some("updated_at".to_string()),
            start_online: true,
            reconnect: FeedBackoffConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

/// 获取默认数据目录 ~/.offsync/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".offsync")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".offsync")
    } else {
        PathBuf::from("./offsync_data")
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }

    /// 从 JSON 配置文件加载，缺失字段取默认值
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncSDKError::Config(format!("读取配置文件 {} 失败: {}", path.display(), e)))?;
        let config: SyncConfig = serde_json::from_str(&content)
            .map_err(|e| SyncSDKError::Config(format!("解析配置文件 {} 失败: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(SyncSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(SyncSDKError::Config("max_attempts 必须大于 0".to_string()));
        }
        if self.backoff_base_ms > self.backoff_cap_ms {
            return Err(SyncSDKError::Config(format!(
                "backoff_base_ms ({}) 不能大于 backoff_cap_ms ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        if self.backoff_factor < 1.0 {
            return Err(SyncSDKError::Config("backoff_factor 不能小于 1.0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(SyncSDKError::Config("jitter_factor 必须在 [0, 1] 之间".to_string()));
        }
        if self.reconciliation_interval_ms == 0 {
            return Err(SyncSDKError::Config("reconciliation_interval_ms 不能为 0".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(SyncSDKError::Config("event_capacity 不能为 0".to_string()));
        }
        if self.primary_key_field.is_empty() {
            return Err(SyncSDKError::Config("primary_key_field 不能为空".to_string()));
        }
        for table in &self.tables {
            validate_table_name(table).map_err(|e| SyncSDKError::Config(e.to_string()))?;
        }
        if self.presence.heartbeat_interval_ms == 0 {
            return Err(SyncSDKError::Config("presence.heartbeat_interval_ms 不能为 0".to_string()));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE_NAME)
    }

    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("kv")
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// 添加一个需要同步的逻辑表
    pub fn table<S: Into<String>>(mut self, table: S) -> Self {
        self.config.tables.push(table.into());
        self
    }

    pub fn tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn reconciliation_interval_ms(mut self, ms: u64) -> Self {
        self.config.reconciliation_interval_ms = ms;
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.config.backoff_base_ms = base_ms;
        self.config.backoff_cap_ms = cap_ms;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.config.backoff_factor = factor;
        self
    }

    pub fn jitter_factor(mut self, jitter: f64) -> Self {
        self.config.jitter_factor = jitter;
        self
    }

    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn primary_key_field<S: Into<String>>(mut self, field: S) -> Self {
        self.config.primary_key_field = field.into();
        self
    }

    pub fn timestamp_field(mut self, field: Option<String>) -> Self {
        self.config.timestamp_field = field;
        self
    }

    pub fn start_online(mut self, online: bool) -> Self {
        self.config.start_online = online;
        self
    }

    pub fn reconnect(mut self, config: FeedBackoffConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    pub fn presence(mut self, config: PresenceConfig) -> Self {
        self.config.presence = config;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.reconciliation_interval_ms, 5_000);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1_000);
        assert_eq!(config.backoff_cap_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            SyncConfig::builder().max_attempts(0).build(),
            SyncConfig::builder().backoff(5_000, 1_000).build(),
            SyncConfig::builder().backoff_factor(0.5).build(),
            SyncConfig::builder().jitter_factor(1.5).build(),
            SyncConfig::builder().reconciliation_interval_ms(0).build(),
            SyncConfig::builder().table("not a table").build(),
        ];
        for config in bad {
            assert!(matches!(config.validate(), Err(SyncSDKError::Config(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsync.json");
        std::fs::write(
            &path,
            r#"{ "data_dir": "/tmp/offsync", "tables": ["goals"], "max_attempts": 5 }"#,
        )
        .unwrap();

        let config = SyncConfig::from_json_file(&path).unwrap();
        assert_eq!(config.tables, vec!["goals".to_string()]);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_cap_ms, 30_000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/offsync").join(DB_FILE_NAME));
    }
}
