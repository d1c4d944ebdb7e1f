use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::RemoteError;

/// 重试策略配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大尝试次数（第 max_attempts 次失败后停放）
    pub max_attempts: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&SyncConfig> for RetryPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.backoff_base_ms,
            max_delay_ms: config.backoff_cap_ms,
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
        }
    }
}

/// 一次失败之后的处理决定
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// 等待后重试
    RetryAfter(Duration),
    /// 停放，等待调用方决定（丢弃或修改后重提）
    Park(String),
}

impl RetryPolicy {
    /// 不带抖动的退避延迟：`min(cap, base * factor^(attempts-1))`
    ///
    /// `attempts` 为已失败的次数（≥1），取自持久化条目，进程重启后保持同样的退避姿态。
    pub fn base_backoff_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        delay.min(self.max_delay_ms as f64).max(0.0) as u64
    }

    /// 带对称抖动的退避延迟
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let base = self.base_backoff_ms(attempts) as f64;
        let jitter = base * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let delay = (base + jitter).max(0.0).min(self.max_delay_ms as f64);
        Duration::from_millis(delay as u64)
    }

    /// 失败后的决定
    ///
    /// - 永久拒绝：立即停放
    /// - 临时错误：未达上限则退避重试，达到 `max_attempts` 则停放
    pub fn decide(&self, attempts: u32, error: &RemoteError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Park(error.to_string());
        }
        if attempts >= self.max_attempts {
            return RetryDecision::Park(format!(
                "已达到最大尝试次数 {}: {}",
                self.max_attempts, error
            ));
        }
        RetryDecision::RetryAfter(self.backoff_delay(attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_backoff_ms(1), 1_000);
        assert_eq!(policy.base_backoff_ms(2), 2_000);
        assert_eq!(policy.base_backoff_ms(3), 4_000);
        assert_eq!(policy.base_backoff_ms(6), 30_000);
        assert_eq!(policy.base_backoff_ms(40), 30_000);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.backoff_delay(2).as_millis() as u64;
            assert!((1_900..=2_100).contains(&d), "delay {} out of band", d);
        }
        for _ in 0..100 {
            assert!(policy.backoff_delay(30).as_millis() as u64 <= 30_000);
        }
    }

    #[test]
    fn test_decide_bounded_retry() {
        let policy = RetryPolicy::default();
        let transient = RemoteError::transient("timeout");
        assert!(matches!(policy.decide(1, &transient), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.decide(2, &transient), RetryDecision::RetryAfter(_)));
        assert!(matches!(policy.decide(3, &transient), RetryDecision::Park(_)));
    }

    #[test]
    fn test_decide_rejected_parks_immediately() {
        let policy = RetryPolicy::default();
        let rejected = RemoteError::from_status(422, "invalid");
        assert!(matches!(policy.decide(1, &rejected), RetryDecision::Park(_)));
    }
}
