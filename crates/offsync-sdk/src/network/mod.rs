use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::utils::now_millis;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// 在线
    Online,
    /// 离线
    Offline,
    /// 连接中
    Connecting,
    /// 网络受限（仍尝试排空）
    Limited,
}

impl NetworkStatus {
    /// 是否可以尝试远端调用
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online | NetworkStatus::Limited)
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkStatus::Online => write!(f, "在线"),
            NetworkStatus::Offline => write!(f, "离线"),
            NetworkStatus::Connecting => write!(f, "连接中"),
            NetworkStatus::Limited => write!(f, "网络受限"),
        }
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络状态监听器trait（由平台层实现，如 Android/iOS/浏览器 online 事件）
#[async_trait]
pub trait NetworkStatusListener: Send + Sync + fmt::Debug {
    /// 获取当前网络状态
    async fn get_current_status(&self) -> NetworkStatus;

    /// 开始监听网络状态变化
    async fn start_monitoring(&self) -> Result<broadcast::Receiver<NetworkStatusEvent>>;

    /// 停止监听
    async fn stop_monitoring(&self);
}

/// 网络监控管理器
///
/// 同步协调器只认这里的状态：离线时排空循环休眠，恢复在线时唤醒并触发一次对账。
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            status_sender,
            current_status: Arc::new(RwLock::new(initial)),
        }
    }

    /// 接入平台监听器，把它的状态变化转发到本监控器
    pub async fn attach_listener(
        &self,
        listener: Arc<dyn NetworkStatusListener>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        self.set_status(listener.get_current_status().await);
        let mut receiver = listener.start_monitoring().await?;
        let monitor = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv() => match event {
                        Ok(event) => monitor.set_status(event.new_status),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("网络状态事件滞后 {} 条，读取最新状态", n);
                            monitor.set_status(listener.get_current_status().await);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            listener.stop_monitoring().await;
            debug!("网络状态监听已停止");
        });
        Ok(handle)
    }

    /// 获取当前网络状态
    pub fn get_status(&self) -> NetworkStatus {
        *self.current_status.read()
    }

    /// 手动设置网络状态；状态未变化时不广播
    pub fn set_status(&self, new_status: NetworkStatus) {
        let old_status = {
            let mut status = self.current_status.write();
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return;
        }
        info!("网络状态变化: {} -> {}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
    }

    /// 订阅网络状态变化
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }

    /// 检查网络连接（通过网络状态判断）
    pub fn check_connection(&self) -> bool {
        self.get_status().is_online()
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::DummyNetworkStatusListener;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_set_status_broadcasts_changes_only() {
        let monitor = NetworkMonitor::new(NetworkStatus::Offline);
        let mut rx = monitor.subscribe();

        monitor.set_status(NetworkStatus::Offline);
        monitor.set_status(NetworkStatus::Online);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.old_status, NetworkStatus::Offline);
        assert_eq!(event.new_status, NetworkStatus::Online);
        assert!(rx.try_recv().is_err());
        assert!(monitor.check_connection());
    }

    #[tokio::test]
    async fn test_attach_listener_forwards_events() {
        let monitor = NetworkMonitor::new(NetworkStatus::Online);
        let listener = Arc::new(DummyNetworkStatusListener::new(NetworkStatus::Offline));
        let cancel = CancellationToken::new();
        let handle = monitor
            .attach_listener(listener.clone(), cancel.clone())
            .await
            .unwrap();
        assert_eq!(monitor.get_status(), NetworkStatus::Offline);

        let mut rx = monitor.subscribe();
        listener.change(NetworkStatus::Online);
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.new_status, NetworkStatus::Online);

        cancel.cancel();
        handle.await.unwrap();
    }
}
