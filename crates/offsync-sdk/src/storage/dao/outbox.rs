//! Outbox 数据访问层

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::storage::entities::RecordKey;
use crate::storage::queue::outbox_entry::{EntryStatus, MutationOp, OutboxEntry, PendingMutation};
use crate::utils::now_millis;

const ENTRY_COLUMNS: &str = "id, operation, table_name, record_key, data, attempts, status, \
                             created_at, last_error, next_attempt_at, parked_at";
const ENTRY_COLUMNS_O: &str = "o.id, o.operation, o.table_name, o.record_key, o.data, o.attempts, \
                               o.status, o.created_at, o.last_error, o.next_attempt_at, o.parked_at";

pub struct OutboxDao<'a> {
    conn: &'a Connection,
}

impl<'a> OutboxDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 追加条目，返回单调递增的 id
    pub fn insert(&self, mutation: &PendingMutation) -> Result<i64> {
        let data = mutation
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO outbox (operation, table_name, record_key, data, attempts, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
            params![
                mutation.operation.as_str(),
                mutation.table,
                mutation.key.as_str(),
                data,
                EntryStatus::Pending.as_str(),
                now_millis(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<OutboxEntry>> {
        let sql = format!("SELECT {} FROM outbox WHERE id = ?1", ENTRY_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, params![id], Self::read_row)
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// 下一个可排空的条目
    ///
    /// id 最小的 pending 条目，但跳过那些同一 (table, key) 上存在更早停放条目的：
    /// 停放条目只阻塞同一个键，其它键照常排空。
    pub fn next_pending(&self) -> Result<Option<OutboxEntry>> {
        let sql = format!(
            "SELECT {} FROM outbox o
             WHERE o.status = 'pending'
               AND NOT EXISTS (
                   SELECT 1 FROM outbox p
                   WHERE p.status = 'parked'
                     AND p.table_name = o.table_name
                     AND p.record_key = o.record_key
                     AND p.id < o.id
               )
             ORDER BY o.id ASC
             LIMIT 1",
            ENTRY_COLUMNS_O
        );
        let raw = self.conn.query_row(&sql, [], Self::read_row).optional()?;
        raw.map(RawEntry::into_entry).transpose()
    }

    /// attempts + 1，记录错误；返回新的 attempts
    pub fn increment_attempts(&self, id: i64, error: Option<&str>) -> Result<Option<u32>> {
        let changed = self.conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, last_error = COALESCE(?1, last_error) WHERE id = ?2",
            params![error, id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        let attempts: u32 = self.conn.query_row(
            "SELECT attempts FROM outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(Some(attempts))
    }

    pub fn set_next_attempt(&self, id: i64, at: Option<i64>) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE outbox SET next_attempt_at = ?1 WHERE id = ?2",
            params![at, id],
        )?;
        Ok(changed > 0)
    }

    pub fn park(&self, id: i64, reason: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE outbox SET status = ?1, last_error = ?2, parked_at = ?3, next_attempt_at = NULL
             WHERE id = ?4",
            params![EntryStatus::Parked.as_str(), reason, now_millis(), id],
        )?;
        Ok(changed > 0)
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn list(&self) -> Result<Vec<OutboxEntry>> {
        let sql = format!("SELECT {} FROM outbox ORDER BY id ASC", ENTRY_COLUMNS);
        self.query_entries(&sql, [])
    }

    pub fn list_by_status(&self, status: EntryStatus) -> Result<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {} FROM outbox WHERE status = ?1 ORDER BY id ASC",
            ENTRY_COLUMNS
        );
        self.query_entries(&sql, params![status.as_str()])
    }

    pub fn count_by_status(&self, status: EntryStatus) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM outbox WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// 某个 (table, key) 是否还有未确认的条目（pending 或 parked）
    pub fn has_entries_for(&self, table: &str, key: &RecordKey) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM outbox WHERE table_name = ?1 AND record_key = ?2 LIMIT 1",
                params![table, key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 除 `except_id` 之外，某个 (table, key) 是否还有其它条目
    pub fn has_other_entries_for(&self, table: &str, key: &RecordKey, except_id: i64) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM outbox WHERE table_name = ?1 AND record_key = ?2 AND id != ?3 LIMIT 1",
                params![table, key.as_str(), except_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// 某个逻辑表上所有存在未确认条目的键
    pub fn pending_keys_for(&self, table: &str) -> Result<Vec<RecordKey>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT record_key FROM outbox WHERE table_name = ?1",
        )?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(RecordKey::new(key?));
        }
        Ok(keys)
    }

    /// 停放条目重新入队：attempts 归零，保持原 id（原有顺序不变）
    pub fn reset_for_resubmit(&self, id: i64, data: Option<&serde_json::Value>) -> Result<bool> {
        let changed = match data {
            Some(data) => self.conn.execute(
                "UPDATE outbox SET status = ?1, attempts = 0, last_error = NULL, parked_at = NULL,
                        next_attempt_at = NULL, data = ?2
                 WHERE id = ?3 AND status = 'parked'",
                params![EntryStatus::Pending.as_str(), serde_json::to_string(data)?, id],
            )?,
            None => self.conn.execute(
                "UPDATE outbox SET status = ?1, attempts = 0, last_error = NULL, parked_at = NULL,
                        next_attempt_at = NULL
                 WHERE id = ?2 AND status = 'parked'",
                params![EntryStatus::Pending.as_str(), id],
            )?,
        };
        Ok(changed > 0)
    }

    fn query_entries<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::read_row)?;
        let mut entries = Vec::new();
        for raw in rows {
            entries.push(raw?.into_entry()?);
        }
        Ok(entries)
    }

    fn read_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            operation: row.get(1)?,
            table: row.get(2)?,
            key: row.get(3)?,
            data: row.get(4)?,
            attempts: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            last_error: row.get(8)?,
            next_attempt_at: row.get(9)?,
            parked_at: row.get(10)?,
        })
    }
}

struct RawEntry {
    id: i64,
    operation: String,
    table: String,
    key: String,
    data: Option<String>,
    attempts: u32,
    status: String,
    created_at: i64,
    last_error: Option<String>,
    next_attempt_at: Option<i64>,
    parked_at: Option<i64>,
}

impl RawEntry {
    fn into_entry(self) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: self.id,
            operation: MutationOp::parse(&self.operation)?,
            table: self.table,
            key: RecordKey::new(self.key),
            data: self.data.as_deref().map(serde_json::from_str).transpose()?,
            attempts: self.attempts,
            status: EntryStatus::parse(&self.status)?,
            created_at: self.created_at,
            last_error: self.last_error,
            next_attempt_at: self.next_attempt_at,
            parked_at: self.parked_at,
        })
    }
}
