//! 逻辑表数据访问层 - 每个逻辑表对应一张 lt_{name} 物理表

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{Result, SyncSDKError};
use crate::storage::entities::{physical_table_name, validate_table_name, Record, RecordKey};
use crate::utils::now_millis;

pub struct RecordDao<'a> {
    conn: &'a Connection,
    table: String,
    physical: String,
}

impl<'a> RecordDao<'a> {
    pub fn new(conn: &'a Connection, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            conn,
            table: table.to_string(),
            physical: physical_table_name(table),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// 逻辑表是否已建立
    pub fn exists(&self) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM local_tables WHERE name = ?1",
                params![self.table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 建表（幂等）并登记到 local_tables
    pub fn ensure_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                record_key         TEXT PRIMARY KEY NOT NULL,
                data               TEXT NOT NULL,
                schema_version     INTEGER NOT NULL DEFAULT 1,
                updated_at         INTEGER NOT NULL,
                remote_updated_at  INTEGER
            )",
            self.physical
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| SyncSDKError::Database(format!("创建表 {} 失败: {}", self.physical, e)))?;
        self.conn.execute(
            "INSERT OR IGNORE INTO local_tables (name, created_at) VALUES (?1, ?2)",
            params![self.table, now_millis()],
        )?;
        Ok(())
    }

    pub fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        if !self.exists()? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT record_key, data, schema_version, updated_at, remote_updated_at FROM {} WHERE record_key = ?1",
            self.physical
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let raw = stmt
            .query_row(params![key.as_str()], Self::read_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    /// 写入记录（插入或覆盖）；不改动远端确认值
    pub fn put(&self, record: &Record) -> Result<()> {
        self.ensure_table()?;
        let sql = format!(
            "INSERT INTO {} (record_key, data, schema_version, updated_at, remote_updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(record_key) DO UPDATE SET
                data = excluded.data,
                schema_version = excluded.schema_version,
                updated_at = excluded.updated_at,
                remote_updated_at = COALESCE(excluded.remote_updated_at, remote_updated_at)",
            self.physical
        );
        self.conn.execute(
            &sql,
            params![
                record.key.as_str(),
                serde_json::to_string(&record.data)?,
                record.schema_version,
                record.updated_at,
                record.remote_updated_at,
            ],
        )?;
        Ok(())
    }

    /// 写入远端确认过的记录，同时更新远端确认值
    pub fn put_confirmed(&self, record: &Record) -> Result<()> {
        self.put(record)?;
        self.set_confirmed(&record.key, Some(&record.data))?;
        Ok(())
    }

    /// 记录远端最后确认的负载（用于丢弃停放条目时回滚）；None 表示远端已没有这一行
    ///
    /// 存在 confirmed_rows 里，本地删除行不会带走它。
    pub fn set_confirmed(&self, key: &RecordKey, data: Option<&Value>) -> Result<bool> {
        let changed = match data {
            Some(data) => self.conn.execute(
                "INSERT INTO confirmed_rows (table_name, record_key, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(table_name, record_key) DO UPDATE SET data = excluded.data",
                params![self.table, key.as_str(), serde_json::to_string(data)?],
            )?,
            None => self.conn.execute(
                "DELETE FROM confirmed_rows WHERE table_name = ?1 AND record_key = ?2",
                params![self.table, key.as_str()],
            )?,
        };
        Ok(changed > 0)
    }

    pub fn confirmed(&self, key: &RecordKey) -> Result<Option<Value>> {
        let encoded: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM confirmed_rows WHERE table_name = ?1 AND record_key = ?2",
                params![self.table, key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        encoded
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(Into::into)
    }

    /// 删除本地行（本地写）；远端确认值保留
    pub fn delete(&self, key: &RecordKey) -> Result<bool> {
        if !self.exists()? {
            return Ok(false);
        }
        let sql = format!("DELETE FROM {} WHERE record_key = ?1", self.physical);
        let changed = self.conn.execute(&sql, params![key.as_str()])?;
        Ok(changed > 0)
    }

    /// 远端已删除：本地行与远端确认值一起删除，返回本地行是否存在
    pub fn remove_confirmed(&self, key: &RecordKey) -> Result<bool> {
        self.set_confirmed(key, None)?;
        self.delete(key)
    }

    pub fn list(&self) -> Result<Vec<Record>> {
        if !self.exists()? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT record_key, data, schema_version, updated_at, remote_updated_at FROM {} ORDER BY record_key",
            self.physical
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::read_row)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    pub fn list_keys(&self) -> Result<Vec<RecordKey>> {
        if !self.exists()? {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT record_key FROM {} ORDER BY record_key", self.physical);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(RecordKey::new(key?));
        }
        Ok(keys)
    }

    pub fn count(&self) -> Result<u64> {
        if !self.exists()? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", self.physical);
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        Ok(RawRecord {
            key: row.get(0)?,
            data: row.get(1)?,
            schema_version: row.get(2)?,
            updated_at: row.get(3)?,
            remote_updated_at: row.get(4)?,
        })
    }
}

struct RawRecord {
    key: String,
    data: String,
    schema_version: u32,
    updated_at: i64,
    remote_updated_at: Option<i64>,
}

impl RawRecord {
    fn into_record(self) -> Result<Record> {
        Ok(Record {
            key: RecordKey::new(self.key),
            data: serde_json::from_str(&self.data)?,
            schema_version: self.schema_version,
            updated_at: self.updated_at,
            remote_updated_at: self.remote_updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrate;
    use serde_json::json;

    fn conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate::init_db(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_reads_on_missing_table_are_empty() {
        let conn = conn();
        let dao = RecordDao::new(&conn, "goals").unwrap();
        assert!(!dao.exists().unwrap());
        assert!(dao.get(&"g1".into()).unwrap().is_none());
        assert!(dao.list().unwrap().is_empty());
        assert!(!dao.delete(&"g1".into()).unwrap());
    }

    #[test]
    fn test_put_get_delete() {
        let conn = conn();
        let dao = RecordDao::new(&conn, "goals").unwrap();
        let record = Record::local("g1".into(), json!({"title": "run"}), "id");
        dao.put(&record).unwrap();

        let loaded = dao.get(&"g1".into()).unwrap().unwrap();
        assert_eq!(loaded.data, json!({"id": "g1", "title": "run"}));
        assert_eq!(dao.count().unwrap(), 1);
        assert_eq!(dao.list_keys().unwrap(), vec![RecordKey::from("g1")]);

        assert!(dao.delete(&"g1".into()).unwrap());
        assert!(dao.get(&"g1".into()).unwrap().is_none());
    }

    #[test]
    fn test_local_put_keeps_remote_timestamp_and_confirmed() {
        let conn = conn();
        let dao = RecordDao::new(&conn, "goals").unwrap();
        let mut remote = Record::local("g1".into(), json!({"count": 1}), "id");
        remote.remote_updated_at = Some(1000);
        dao.put_confirmed(&remote).unwrap();

        let local = Record::local("g1".into(), json!({"count": 2}), "id");
        dao.put(&local).unwrap();

        let loaded = dao.get(&"g1".into()).unwrap().unwrap();
        assert_eq!(loaded.data["count"], 2);
        assert_eq!(loaded.remote_updated_at, Some(1000));
        assert_eq!(dao.confirmed(&"g1".into()).unwrap().unwrap()["count"], 1);
    }

    #[test]
    fn test_local_delete_keeps_confirmed_value() {
        let conn = conn();
        let dao = RecordDao::new(&conn, "goals").unwrap();
        let mut remote = Record::local("g1".into(), json!({"count": 1}), "id");
        remote.remote_updated_at = Some(1000);
        dao.put_confirmed(&remote).unwrap();

        assert!(dao.delete(&"g1".into()).unwrap());
        assert!(dao.get(&"g1".into()).unwrap().is_none());
        assert_eq!(dao.confirmed(&"g1".into()).unwrap().unwrap()["count"], 1);

        // 其它逻辑表的同名键互不影响
        let other = RecordDao::new(&conn, "notes").unwrap();
        assert!(other.confirmed(&"g1".into()).unwrap().is_none());

        dao.put_confirmed(&remote).unwrap();
        assert!(dao.remove_confirmed(&"g1".into()).unwrap());
        assert!(dao.confirmed(&"g1".into()).unwrap().is_none());
        assert!(!dao.remove_confirmed(&"g1".into()).unwrap());
    }
}
