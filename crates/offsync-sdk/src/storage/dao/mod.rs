//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! 所有 DAO 只借用一个 `&Connection`，由 DB Actor 线程在事务内调用，
//! 因此跨表操作（本地写 + outbox 追加）天然处在同一个事务中。

pub mod outbox;
pub mod record;

pub use outbox::OutboxDao;
pub use record::RecordDao;

use rusqlite::Connection;

use crate::error::{Result, SyncSDKError};

/// DAO 工厂 - 统一创建各种 DAO 实例
pub struct DaoFactory;

impl DaoFactory {
    /// 创建逻辑表 DAO（校验表名）
    pub fn record_dao<'a>(conn: &'a Connection, table: &str) -> Result<RecordDao<'a>> {
        RecordDao::new(conn, table)
    }

    /// 创建 Outbox DAO
    pub fn outbox_dao(conn: &Connection) -> OutboxDao<'_> {
        OutboxDao::new(conn)
    }
}

/// 事务管理器 - 统一管理跨表操作的事务
///
/// 闭包返回错误时事务随 `Transaction` 的 drop 回滚，不会留下部分写入。
pub struct TransactionManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// 执行事务操作
    pub fn execute<F, R>(self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| SyncSDKError::Database(format!("开始事务失败: {}", e)))?;

        let result = f(&tx)?;

        tx.commit()
            .map_err(|e| SyncSDKError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}
