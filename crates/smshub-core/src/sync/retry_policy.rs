use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::SmsHubError;

/// 同步重试策略
///
/// 只有可重试的错误（供应商不可用、中继耗尽）才会退避重试；
/// 业务拒绝和解析失败重试也没用，直接返回。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最多尝试次数（包含第一次）
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
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            backoff_factor: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后（从 1 开始）是否还要再试
    pub fn should_retry(&self, attempt: u32, error: &SmsHubError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// 第 `attempt` 次失败后的等待时间
    ///
    /// base * factor^(attempt-1)，封顶 max，再加 ±jitter/2 的随机抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let base = self.base_delay_ms as f64 * self.backoff_factor.max(1.0).powf(exponent);
        let capped = base.min(self.max_delay_ms as f64);

        let jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        let jitter = capped * jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (capped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}
