//! 对账游标存储
//!
//! 格式：reconcile_cursor:{table} → 最后一次成功对账的开始时间（UTC 毫秒）

use std::collections::HashMap;

use crate::error::Result;
use crate::storage::kv::KvStore;

const PREFIX: &str = "reconcile_cursor:";

#[derive(Debug, Clone)]
pub struct SyncCursorStore {
    kv: KvStore,
}

impl SyncCursorStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn key(table: &str) -> String {
        format!("{}{}", PREFIX, table)
    }

    pub async fn get(&self, table: &str) -> Result<Option<i64>> {
        self.kv.get::<_, i64>(Self::key(table).as_str()).await
    }

    pub async fn set(&self, table: &str, reconciled_at: i64) -> Result<()> {
        self.kv.set(Self::key(table).as_str(), &reconciled_at).await
    }

    /// 所有逻辑表的游标
    pub async fn all(&self) -> Result<HashMap<String, i64>> {
        let entries: Vec<(Vec<u8>, i64)> = self.kv.scan_prefix(PREFIX.as_bytes()).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, at)| {
                let key = String::from_utf8(key).ok()?;
                Some((key.strip_prefix(PREFIX)?.to_string(), at))
            })
            .collect())
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cursor_key_format() {
        assert_eq!(SyncCursorStore::key("goals"), "reconcile_cursor:goals");
    }

    #[tokio::test]
    async fn test_cursor_round_trip() {
        let dir = TempDir::new().unwrap();
        let cursors = SyncCursorStore::new(KvStore::open(dir.path()).await.unwrap());
        assert_eq!(cursors.get("goals").await.unwrap(), None);

        cursors.set("goals", 10).await.unwrap();
        cursors.set("points", 20).await.unwrap();
        cursors.set("goals", 30).await.unwrap();

        let all = cursors.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["goals"], 30);
        assert_eq!(all["points"], 20);
    }
}
