//! 时间处理工具
//!
//! - **存储层**: 所有时间字段使用 UTC 毫秒时间戳（INTEGER）
//! - **远端行**: 时间戳字段可能是毫秒整数，也可能是 RFC3339 字符串，统一转成毫秒

use chrono::{DateTime, Utc};
use serde_json::Value;

/// 当前 UTC 毫秒时间戳
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 从远端行的时间戳字段解析毫秒时间戳
///
/// 支持毫秒数字、数字字符串与 RFC3339 字符串；无法识别时返回 None。
pub fn parse_timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
            .ok()
            .or_else(|| s.parse::<i64>().ok()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_variants() {
        assert_eq!(parse_timestamp_millis(&json!(1700000000123i64)), Some(1700000000123));
        assert_eq!(
            parse_timestamp_millis(&json!("2024-01-01T00:00:00Z")),
            Some(1704067200000)
        );
        assert_eq!(parse_timestamp_millis(&json!("1704067200000")), Some(1704067200000));
        assert_eq!(parse_timestamp_millis(&json!("yesterday")), None);
        assert_eq!(parse_timestamp_millis(&json!(null)), None);
    }
}
