//! 短信同步模块
//!
//! 职责：
//! - 按供应商身份选择拉取渠道（API 轮询 / 网页抓取）
//! - 驱动适配器拉取短信，写入去重存储
//! - 同一租用同时只有一个同步在跑，并发请求合并到进行中的那一个
//! - 可重试错误按退避策略重试

pub mod orchestrator;
pub mod retry_policy;

pub use orchestrator::SyncOrchestrator;
pub use retry_policy::RetryPolicy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SmsHubError};

/// 同步触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// 用户手动刷新（强制）
    UserRefresh,
    /// 打开短信视图（强制，保证人看到的是最新的）
    ViewOpened,
    /// 本地存储变更通知（只做本地读穿，不调用供应商）
    StoreChanged,
    /// 长时间隐藏后回到前台（尽力而为的强制刷新）
    Resumed,
}

impl SyncTrigger {
    pub fn calls_provider(&self) -> bool {
        !matches!(self, SyncTrigger::StoreChanged)
    }
}

/// 同步失败的展示信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    pub hint: &'static str,
}

impl From<&SmsHubError> for SyncFailure {
    fn from(error: &SmsHubError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            retryable: error.is_retryable(),
            hint: error.hint(),
        }
    }
}

/// 一次同步的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub rental_id: String,
    pub new_messages_count: usize,
    pub success: bool,
    pub error: Option<SyncFailure>,
    pub trigger: SyncTrigger,
    /// 实际尝试次数（本地读穿为 0）
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl SyncOutcome {
    pub fn succeeded(rental_id: &str, trigger: SyncTrigger, new_messages_count: usize, attempts: u32) -> Self {
        Self {
            rental_id: rental_id.to_string(),
            new_messages_count,
            success: true,
            error: None,
            trigger,
            attempts,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(rental_id: &str, trigger: SyncTrigger, error: &SmsHubError, attempts: u32) -> Self {
        Self {
            rental_id: rental_id.to_string(),
            new_messages_count: 0,
            success: false,
            error: Some(SyncFailure::from(error)),
            trigger,
            attempts,
            finished_at: Utc::now(),
        }
    }
}
