//! 本地存储实体定义
//!
//! 记录（Record）是不透明的 JSON 负载加元信息，属于且只属于一个逻辑表。
//! 主键由客户端生成，创建后不再改变。

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::OnceLock;

use crate::error::{Result, SyncSDKError};
use crate::utils::{now_millis, parse_timestamp_millis};

/// 当前本地负载的 schema 版本；新增字段无需升级版本，JSON 负载天然兼容
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// 物理表名前缀，避免与 outbox 等内部表冲突
pub const LOCAL_TABLE_PREFIX: &str = "lt_";

/// 记录主键（客户端生成，全局唯一）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    /// 生成新的主键（UUID v4），离线创建无需服务端往返
    pub fn generate() -> Self {
        RecordKey(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(key: impl Into<String>) -> Self {
        RecordKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey(value)
    }
}

/// 本地记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    /// 不透明负载（字段名 → 标量/JSON）
    pub data: Value,
    /// 负载 schema 版本
    pub schema_version: u32,
    /// 本地最后写入时间（UTC 毫秒）
    pub updated_at: i64,
    /// 远端提交时间（来自远端行的时间戳字段），未确认过的本地记录为 None
    pub remote_updated_at: Option<i64>,
}

impl Record {
    /// 构造本地写入的记录；负载中会补上主键字段
    pub fn local(key: RecordKey, data: Value, pk_field: &str) -> Self {
        Self {
            data: with_key_field(data, pk_field, &key),
            key,
            schema_version: CURRENT_SCHEMA_VERSION,
            updated_at: now_millis(),
            remote_updated_at: None,
        }
    }

    /// 从远端行构造记录
    ///
    /// 主键取 `pk_field`（字符串或数字）；时间戳字段缺失或无法解析时 `remote_updated_at` 为 None。
    pub fn from_remote_row(row: &Value, pk_field: &str, ts_field: Option<&str>) -> Result<Self> {
        let key = extract_key(row, pk_field).ok_or_else(|| {
            SyncSDKError::InvalidArgument(format!("远端行缺少主键字段 {}", pk_field))
        })?;
        let remote_updated_at = ts_field
            .and_then(|f| row.get(f))
            .and_then(parse_timestamp_millis);
        Ok(Self {
            key,
            data: row.clone(),
            schema_version: CURRENT_SCHEMA_VERSION,
            updated_at: now_millis(),
            remote_updated_at,
        })
    }
}

/// 从 JSON 行提取主键
pub fn extract_key(row: &Value, pk_field: &str) -> Option<RecordKey> {
    match row.get(pk_field)? {
        Value::String(s) if !s.is_empty() => Some(RecordKey::new(s.clone())),
        Value::Number(n) => Some(RecordKey::new(n.to_string())),
        _ => None,
    }
}

/// 确保对象负载中的主键字段等于记录键；非对象负载原样返回
///
/// 已有的主键值能解析成同一个键时保持原样（数字主键不会被改写成字符串）。
pub fn with_key_field(data: Value, pk_field: &str, key: &RecordKey) -> Value {
    if extract_key(&data, pk_field).as_ref() == Some(key) {
        return data;
    }
    match data {
        Value::Object(mut map) => {
            map.insert(pk_field.to_string(), Value::String(key.as_str().to_string()));
            Value::Object(map)
        }
        other => other,
    }
}

/// 负载若带主键字段，必须与记录键一致：记录键创建后不可改变
pub fn ensure_key_matches(data: &Value, pk_field: &str, key: &RecordKey) -> Result<()> {
    if data.get(pk_field).is_none() || extract_key(data, pk_field).as_ref() == Some(key) {
        return Ok(());
    }
    Err(SyncSDKError::InvalidArgument(format!(
        "负载主键字段 {} 与记录键 {} 不一致",
        pk_field, key
    )))
}

/// 浅合并：patch 中的字段覆盖 base 的同名字段
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            let mut merged = b.clone();
            for (k, v) in p {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => patch.clone(),
    }
}

fn table_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("table name regex is valid")
    })
}

/// 校验逻辑表名（会成为 SQL 标识符的一部分）
pub fn validate_table_name(name: &str) -> Result<()> {
    if table_name_regex().is_match(name) {
        Ok(())
    } else {
        Err(SyncSDKError::InvalidArgument(format!("无效的表名: {:?}", name)))
    }
}

/// 逻辑表名 → 物理表名
pub fn physical_table_name(name: &str) -> String {
    format!("{}{}", LOCAL_TABLE_PREFIX, name)
}
