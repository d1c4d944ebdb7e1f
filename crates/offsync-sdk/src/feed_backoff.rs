//! 变更流重订阅退避
//!
//! 每张表一个，跟 outbox 的重试退避互不相干。首次订阅不等待；断开或订阅失败后
//! 等待时间指数增长，封顶后保持。连接只有稳定保持过 `stable_after_ms` 才把等待时间
//! 重置回初始值：刚连上就断的抖动连接会继续退避，而不是每次都立即重连。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 变更流重订阅节奏
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedBackoffConfig {
    /// 第一次断开后的等待（毫秒）
    pub initial_delay_ms: u64,
    /// 等待上限（毫秒）
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 连接保持多久算稳定（毫秒）
    pub stable_after_ms: u64,
}

impl Default for FeedBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            stable_after_ms: 60_000,
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    next_delay: Duration,
    connected_at: Option<Instant>,
    /// 上次稳定连接以来连续断开的次数
    drops: u32,
}

/// 单表变更流的重订阅退避
#[derive(Debug)]
pub struct FeedBackoff {
    table: String,
    config: FeedBackoffConfig,
    state: Mutex<BackoffState>,
}

impl FeedBackoff {
    pub fn new(table: impl Into<String>, config: FeedBackoffConfig) -> Self {
        Self {
            table: table.into(),
            state: Mutex::new(BackoffState {
                next_delay: Duration::from_millis(config.initial_delay_ms),
                connected_at: None,
                drops: 0,
            }),
            config,
        }
    }

    /// 订阅成功
    pub fn connected(&self) {
        self.state.lock().connected_at = Some(Instant::now());
    }

    /// 断开或订阅失败，返回重新订阅前应等待的时间
    pub fn next_delay(&self) -> Duration {
        let mut state = self.state.lock();
        if let Some(since) = state.connected_at.take() {
            if since.elapsed() >= Duration::from_millis(self.config.stable_after_ms) {
                state.next_delay = Duration::from_millis(self.config.initial_delay_ms);
                state.drops = 0;
            }
        }

        let delay = state.next_delay;
        let cap = Duration::from_millis(self.config.max_delay_ms);
        state.next_delay = delay.mul_f64(self.config.multiplier.max(1.0)).min(cap);
        state.drops += 1;

        if state.drops == 1 {
            debug!(table = %self.table, delay_ms = delay.as_millis() as u64, "变更流断开，稍后重新订阅");
        } else {
            info!(
                table = %self.table,
                drops = state.drops,
                delay_ms = delay.as_millis() as u64,
                "变更流连续断开，退避后重新订阅"
            );
        }
        delay
    }

    /// 上次稳定连接以来连续断开的次数
    pub fn drops(&self) -> u32 {
        self.state.lock().drops
    }
}
