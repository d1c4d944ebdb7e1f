//! 数据库 Actor - 单线程数据库访问模型
//!
//! 核心设计：
//! - SQLite Connection 永远只在一个专用线程中
//! - 所有数据库操作通过 channel 发送到该线程，按到达顺序串行执行
//! - 本地存储唯一的共享可变资源，所有组件的写入都汇聚到这里

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

use crate::error::{Result, SyncSDKError};
use crate::storage::migrate;

type DbJob = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

/// 数据库命令
pub enum DbCommand {
    /// 在 Actor 线程上执行一个作业（作业自行回传结果）
    Run(DbJob),
    /// 关闭：先处理完队列中已有的命令，再关闭连接
    Shutdown {
        respond_to: tokio::sync::oneshot::Sender<()>,
    },
}

/// 数据库 Actor 句柄
#[derive(Debug)]
pub struct DbActorHandle {
    sender: Sender<DbCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
    db_path: PathBuf,
}

impl DbActorHandle {
    /// 启动 Actor 线程并打开数据库（pragmas → migrate → 版本校验）
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<Result<()>>();
        let path = db_path.clone();

        let thread = thread::Builder::new()
            .name("offsync-db-actor".to_string())
            .spawn(move || {
                let conn = match open_connection(&path) {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                run(conn, receiver);
            })
            .map_err(|e| SyncSDKError::IO(format!("无法启动 DB Actor 线程: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| SyncSDKError::Database("DB Actor 启动失败".to_string()))??;

        info!("✅ DB Actor 已启动: {}", db_path.display());

        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.db_path
    }

    /// 在 Actor 线程上执行闭包并等待结果
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let job: DbJob = Box::new(move |conn| {
            let _ = tx.send(f(conn));
        });

        self.sender
            .send(DbCommand::Run(job))
            .map_err(|_| SyncSDKError::Database("DB Actor 已停止".to_string()))?;

        rx.await
            .map_err(|_| SyncSDKError::Database("DB Actor 响应失败".to_string()))?
    }

    /// 关闭 Actor：已排队的作业全部执行完后关闭连接并回收线程
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.sender.send(DbCommand::Shutdown { respond_to: tx }).is_err() {
            debug!("DB Actor 已经停止");
            return Ok(());
        }
        let _ = rx.await;

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || {
                if handle.join().is_err() {
                    error!("DB Actor 线程异常退出");
                }
            })
            .await
            .map_err(|e| SyncSDKError::Database(format!("回收 DB Actor 线程失败: {}", e)))?;
        }
        info!("DB Actor 已关闭");
        Ok(())
    }
}

fn open_connection(path: &PathBuf) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .map_err(|e| SyncSDKError::Database(format!("打开数据库失败: {}", e)))?;
    migrate::init_db(&mut conn)?;
    Ok(conn)
}

fn run(mut conn: Connection, receiver: Receiver<DbCommand>) {
    while let Ok(command) = receiver.recv() {
        match command {
            DbCommand::Run(job) => job(&mut conn),
            DbCommand::Shutdown { respond_to } => {
                // 关闭前做一次 checkpoint，确保 WAL 中的数据落到主库
                if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                    error!("WAL checkpoint 失败: {}", e);
                }
                drop(conn);
                let _ = respond_to.send(());
                return;
            }
        }
    }
    debug!("DB Actor 命令通道已关闭");
}
