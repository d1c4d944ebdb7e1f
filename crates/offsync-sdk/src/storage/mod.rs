//! 存储模块 - 离线优先同步引擎的数据持久化层
//!
//! 采用分层架构设计：
//! - LocalStore: 本地存储门面，所有读写都经过 DB Actor 串行执行
//! - StoreTxn: 一个原子单元，本地写与 outbox 追加要么一起提交，要么都不生效
//! - DAO Layer: 数据访问层，每张表一个专门的操作模块
//! - Entities: 数据实体定义
//! - KvStore: sled 键值存储，保存同步游标等轻量状态

use rusqlite::Connection;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;

pub mod dao;
pub mod db_actor;
pub mod entities;
pub mod kv;
pub mod migrate;
pub mod queue;

pub use dao::{DaoFactory, OutboxDao, RecordDao, TransactionManager};
pub use db_actor::DbActorHandle;
pub use entities::*;
pub use kv::KvStore;

/// 数据库文件名
pub const DB_FILE_NAME: &str = "offsync.db";

/// 本地存储
///
/// 克隆开销很小，所有克隆共享同一个 DB Actor。
#[derive(Debug, Clone)]
pub struct LocalStore {
    actor: Arc<DbActorHandle>,
    pk_field: Arc<str>,
}

impl LocalStore {
    /// 打开（或创建）本地存储
    pub async fn open(db_path: PathBuf, pk_field: &str) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let actor = DbActorHandle::open(db_path).await?;
        Ok(Self {
            actor: Arc::new(actor),
            pk_field: Arc::from(pk_field),
        })
    }

    /// 记录负载中的主键字段名
    pub fn pk_field(&self) -> &str {
        &self.pk_field
    }

    pub fn db_path(&self) -> &PathBuf {
        self.actor.db_path()
    }

    pub async fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        let table = table.to_string();
        let key = key.clone();
        self.actor
            .call(move |conn| DaoFactory::record_dao(conn, &table)?.get(&key))
            .await
    }

    /// 直接写入记录（不入 outbox）；需要同步到远端的写入请走 `transact`
    pub async fn put(&self, table: &str, record: Record) -> Result<()> {
        self.transact({
            let table = table.to_string();
            move |txn| txn.put(&table, &record)
        })
        .await
    }

    pub async fn delete(&self, table: &str, key: &RecordKey) -> Result<bool> {
        self.transact({
            let table = table.to_string();
            let key = key.clone();
            move |txn| txn.delete(&table, &key)
        })
        .await
    }

    pub async fn list(&self, table: &str) -> Result<Vec<Record>> {
        let table = table.to_string();
        self.actor
            .call(move |conn| DaoFactory::record_dao(conn, &table)?.list())
            .await
    }

    pub async fn list_keys(&self, table: &str) -> Result<Vec<RecordKey>> {
        let table = table.to_string();
        self.actor
            .call(move |conn| DaoFactory::record_dao(conn, &table)?.list_keys())
            .await
    }

    pub async fn count(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.actor
            .call(move |conn| DaoFactory::record_dao(conn, &table)?.count())
            .await
    }

    /// 在一个原子单元中执行闭包
    ///
    /// 闭包内的所有写入（包括 `Outbox::enqueue`）在闭包返回 `Ok` 时一起提交；
    /// 返回 `Err` 或存储失败时整体回滚，外部永远看不到部分写入。
    pub async fn transact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut StoreTxn<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let pk_field = self.pk_field.clone();
        self.actor
            .call(move |conn| {
                TransactionManager::new(conn).execute(|conn| {
                    let mut txn = StoreTxn {
                        conn,
                        pk_field: &*pk_field,
                    };
                    f(&mut txn)
                })
            })
            .await
    }

    /// 关闭：等待已排队的事务全部落盘后释放连接
    pub async fn close(&self) -> Result<()> {
        debug!("关闭本地存储: {}", self.db_path().display());
        self.actor.shutdown().await?;
        info!("本地存储已关闭");
        Ok(())
    }
}

/// 事务内的存储视图
pub struct StoreTxn<'a> {
    conn: &'a Connection,
    pk_field: &'a str,
}

impl<'a> StoreTxn<'a> {
    pub fn pk_field(&self) -> &str {
        self.pk_field
    }

    pub fn get(&self, table: &str, key: &RecordKey) -> Result<Option<Record>> {
        DaoFactory::record_dao(self.conn, table)?.get(key)
    }

    pub fn put(&mut self, table: &str, record: &Record) -> Result<()> {
        DaoFactory::record_dao(self.conn, table)?.put(record)
    }

    /// 以本地写入的方式保存负载，返回写入的记录
    pub fn put_local(&mut self, table: &str, key: &RecordKey, data: Value) -> Result<Record> {
        let record = Record::local(key.clone(), data, self.pk_field);
        self.put(table, &record)?;
        Ok(record)
    }

    pub fn delete(&mut self, table: &str, key: &RecordKey) -> Result<bool> {
        DaoFactory::record_dao(self.conn, table)?.delete(key)
    }

    pub fn list(&self, table: &str) -> Result<Vec<Record>> {
        DaoFactory::record_dao(self.conn, table)?.list()
    }

    pub(crate) fn records(&self, table: &str) -> Result<RecordDao<'_>> {
        DaoFactory::record_dao(self.conn, table)
    }

    pub(crate) fn outbox(&self) -> OutboxDao<'_> {
        DaoFactory::outbox_dao(self.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncSDKError;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_crud_through_actor() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join(DB_FILE_NAME), "id").await.unwrap();

        let record = Record::local("r1".into(), json!({"count": 1}), "id");
        store.put("goals", record).await.unwrap();

        let loaded = store.get("goals", &"r1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.data, json!({"id": "r1", "count": 1}));
        assert_eq!(store.count("goals").await.unwrap(), 1);
        assert_eq!(store.list("goals").await.unwrap().len(), 1);

        assert!(store.delete("goals", &"r1".into()).await.unwrap());
        assert!(store.list_keys("goals").await.unwrap().is_empty());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transact_rolls_back_on_error() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join(DB_FILE_NAME), "id").await.unwrap();

        let result: Result<()> = store
            .transact(|txn| {
                txn.put_local("goals", &"a".into(), json!({"v": 1}))?;
                txn.put_local("goals", &"b".into(), json!({"v": 2}))?;
                Err(SyncSDKError::Database("quota exceeded".into()))
            })
            .await;
        assert!(result.unwrap_err().is_storage_error());
        assert_eq!(store.count("goals").await.unwrap(), 0);

        store
            .transact(|txn| {
                txn.put_local("goals", &"a".into(), json!({"v": 1}))?;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(store.count("goals").await.unwrap(), 1);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        {
            let store = LocalStore::open(path.clone(), "id").await.unwrap();
            store
                .put("goals", Record::local("r1".into(), json!({"count": 3}), "id"))
                .await
                .unwrap();
            store.close().await.unwrap();
        }
        let store = LocalStore::open(path, "id").await.unwrap();
        let loaded = store.get("goals", &"r1".into()).await.unwrap().unwrap();
        assert_eq!(loaded.data["count"], 3);
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_table_name_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join(DB_FILE_NAME), "id").await.unwrap();
        let err = store.get("bad name", &"k".into()).await.unwrap_err();
        assert!(matches!(err, SyncSDKError::InvalidArgument(_)));
        store.close().await.unwrap();
    }
}
