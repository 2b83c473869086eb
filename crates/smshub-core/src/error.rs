use serde::Serialize;

use crate::provider::ProviderKind;
use crate::storage::entities::RentalStatus;

/// 统一错误类型
///
/// 预期内的失败（供应商不可用、业务拒绝、中继耗尽、页面结构变化、状态冲突）
/// 全部以 `Result` 形式返回；只有配置错误这类编程问题才会在构造阶段直接失败。
#[derive(Debug, thiserror::Error)]
pub enum SmsHubError {
    /// 传输层失败 / 超时 / 5xx，可重试
    #[error("Provider {provider} unavailable: {reason}")]
    ProviderUnavailable { provider: ProviderKind, reason: String },

    /// 供应商业务拒绝（余额不足、无号码等），不重试，原样透出供应商文案
    #[error("Provider {provider} rejected the request: {message}")]
    ProviderRejected { provider: ProviderKind, message: String },

    /// 所有中继都失败，退避后可重试
    #[error("All {attempts} relays failed, last error: {last_error}")]
    RelayExhausted { attempts: usize, last_error: String },

    /// 无法识别的响应 / 页面结构，重试也修不好
    #[error("Failed to parse {provider} response: {reason} (snippet: {snippet})")]
    ParseFailure {
        provider: ProviderKind,
        reason: String,
        snippet: String,
    },

    #[error("Rental {rental_id} is already assigned to {assignee}")]
    AlreadyAssigned { rental_id: String, assignee: String },

    #[error("Rental {rental_id} is already {status}")]
    AlreadyTerminal { rental_id: String, status: RentalStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// 配置错误（编程问题，构造阶段直接失败）
    #[error("Config error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("JSON error: {0}")]
    JsonError(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),
}

impl From<serde_json::Error> for SmsHubError {
    fn from(error: serde_json::Error) -> Self {
        SmsHubError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for SmsHubError {
    fn from(error: std::io::Error) -> Self {
        SmsHubError::IO(error.to_string())
    }
}

impl From<refinery::Error> for SmsHubError {
    fn from(error: refinery::Error) -> Self {
        SmsHubError::Database(format!("执行 migration 失败: {}", error))
    }
}

/// 错误分类（序列化给展示层，不携带内部细节）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProviderUnavailable,
    ProviderRejected,
    RelayExhausted,
    ParseFailure,
    DuplicateAssignment,
    AlreadyTerminal,
    NotFound,
    Forbidden,
    InvalidArgument,
    InvalidOperation,
    Config,
    Storage,
    Internal,
}

impl SmsHubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SmsHubError::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            SmsHubError::ProviderRejected { .. } => ErrorKind::ProviderRejected,
            SmsHubError::RelayExhausted { .. } => ErrorKind::RelayExhausted,
            SmsHubError::ParseFailure { .. } => ErrorKind::ParseFailure,
            SmsHubError::AlreadyAssigned { .. } => ErrorKind::DuplicateAssignment,
            SmsHubError::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            SmsHubError::NotFound(_) => ErrorKind::NotFound,
            SmsHubError::Forbidden(_) => ErrorKind::Forbidden,
            SmsHubError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SmsHubError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SmsHubError::Config(_) => ErrorKind::Config,
            SmsHubError::SqliteError(_) | SmsHubError::Database(_) => ErrorKind::Storage,
            SmsHubError::JsonError(_) | SmsHubError::IO(_) | SmsHubError::ShuttingDown(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// 是否值得重试（退避后）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmsHubError::ProviderUnavailable { .. } | SmsHubError::RelayExhausted { .. }
        )
    }

    /// 给展示层的固定提示语，配合供应商原文一起展示
    pub fn hint(&self) -> &'static str {
        match self {
            SmsHubError::ProviderUnavailable { .. } => {
                "The provider could not be reached. Showing the last known data; try again shortly."
            }
            SmsHubError::RelayExhausted { .. } => {
                "The inbox page could not be reached through any relay. Try again in a few minutes."
            }
            SmsHubError::ProviderRejected { .. } => {
                "The provider declined the request. Check the balance, service and country, then retry."
            }
            SmsHubError::ParseFailure { .. } => {
                "The provider changed its response format. Messages may be incomplete until the adapter is updated."
            }
            SmsHubError::AlreadyAssigned { .. } => {
                "This number is already assigned. Reassign explicitly to take it over."
            }
            SmsHubError::AlreadyTerminal { .. } => {
                "This rental has ended. Rent a new number instead."
            }
            SmsHubError::NotFound(_) => "The rental does not exist.",
            SmsHubError::Forbidden(_) => "You are not allowed to operate on this rental.",
            SmsHubError::InvalidArgument(_) | SmsHubError::InvalidOperation(_) => {
                "The request is not valid for this rental."
            }
            _ => "Unexpected error. Please retry or contact an operator.",
        }
    }

    pub(crate) fn parse_failure(
        provider: ProviderKind,
        reason: impl Into<String>,
        raw: &str,
    ) -> Self {
        SmsHubError::ParseFailure {
            provider,
            reason: reason.into(),
            snippet: snippet(raw),
        }
    }
}

/// 截取原始响应片段（按字符截断，避免切断 UTF-8）
pub(crate) fn snippet(raw: &str) -> String {
    const MAX_CHARS: usize = 200;
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_CHARS {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(MAX_CHARS).collect();
        format!("{}…", cut)
    }
}

pub type Result<T> = std::result::Result<T, SmsHubError>;
