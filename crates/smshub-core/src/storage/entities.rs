//! 数据实体定义 - 对应数据库表结构
//!
//! 这里定义了租用记录和短信记录对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 序列化/反序列化支持（HTTP 层直接输出）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SmsHubError;
use crate::provider::ProviderKind;

/// 租用记录的规范状态
///
/// 不管供应商那边怎么报，这里的状态才是权威的。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentalStatus {
    Active,
    Expired,
    Cancelled,
}

impl RentalStatus {
    /// 终态：没有任何出边，只能新建租用
    pub fn is_terminal(&self) -> bool {
        matches!(self, RentalStatus::Expired | RentalStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RentalStatus::Active => "active",
            RentalStatus::Expired => "expired",
            RentalStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RentalStatus {
    type Err = SmsHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RentalStatus::Active),
            "expired" => Ok(RentalStatus::Expired),
            "cancelled" => Ok(RentalStatus::Cancelled),
            other => Err(SmsHubError::Database(format!("未知的租用状态: {}", other))),
        }
    }
}

/// 供应商标识的角色
///
/// 有的供应商一单会下发两个不同的 ID：创建时的 order id，
/// 以及后续轮询收件箱必须用的 booking id。两个都要存。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeIdKind {
    Order,
    Booking,
    Activation,
    Manual,
}

impl NativeIdKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeIdKind::Order => "order",
            NativeIdKind::Booking => "booking",
            NativeIdKind::Activation => "activation",
            NativeIdKind::Manual => "manual",
        }
    }
}

impl fmt::Display for NativeIdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NativeIdKind {
    type Err = SmsHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(NativeIdKind::Order),
            "booking" => Ok(NativeIdKind::Booking),
            "activation" => Ok(NativeIdKind::Activation),
            "manual" => Ok(NativeIdKind::Manual),
            other => Err(SmsHubError::Database(format!("未知的标识类型: {}", other))),
        }
    }
}

/// 供应商下发的全部标识
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeIds(BTreeMap<NativeIdKind, String>);

impl NativeIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(kind: NativeIdKind, id: impl Into<String>) -> Self {
        let mut ids = Self::new();
        ids.insert(kind, id);
        ids
    }

    pub fn with(mut self, kind: NativeIdKind, id: impl Into<String>) -> Self {
        self.insert(kind, id);
        self
    }

    pub fn insert(&mut self, kind: NativeIdKind, id: impl Into<String>) {
        self.0.insert(kind, id.into());
    }

    pub fn get(&self, kind: NativeIdKind) -> Option<&str> {
        self.0.get(&kind).map(String::as_str)
    }

    /// 取指定角色的标识，缺失时报解析错误（说明创建时没存全）
    pub fn require(&self, provider: ProviderKind, kind: NativeIdKind) -> Result<&str, SmsHubError> {
        self.get(kind).ok_or_else(|| SmsHubError::InvalidOperation(format!(
            "{} 租用记录缺少 {} 标识",
            provider, kind
        )))
    }

    pub fn contains_kind(&self, kind: NativeIdKind) -> bool {
        self.0.contains_key(&kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (NativeIdKind, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// 租用记录 - 对应 rentals 表
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rental {
    pub id: String,
    pub phone_number: String,
    pub provider: ProviderKind,
    pub native_ids: NativeIds,
    pub service_code: String,
    pub country_code: String,
    pub status: RentalStatus,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub assignee: Option<String>,
    /// 供应商私有的访问凭据（不解析，原样保存）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_credentials: Option<serde_json::Value>,
    /// 运营手动登记的号码（唯一允许物理删除的记录）
    pub manual: bool,
}

impl Rental {
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// 新建租用记录的参数
#[derive(Debug, Clone)]
pub struct NewRental {
    pub phone_number: String,
    pub provider: ProviderKind,
    pub native_ids: NativeIds,
    pub service_code: String,
    pub country_code: String,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub assignee: Option<String>,
    pub access_credentials: Option<serde_json::Value>,
    pub manual: bool,
}

/// 短信来源渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    ProviderApi,
    Scrape,
    ManualTest,
}

impl MessageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSource::ProviderApi => "provider_api",
            MessageSource::Scrape => "scrape",
            MessageSource::ManualTest => "manual_test",
        }
    }
}

impl FromStr for MessageSource {
    type Err = SmsHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provider_api" => Ok(MessageSource::ProviderApi),
            "scrape" => Ok(MessageSource::Scrape),
            "manual_test" => Ok(MessageSource::ManualTest),
            other => Err(SmsHubError::Database(format!("未知的短信来源: {}", other))),
        }
    }
}

/// 短信实体 - 对应 messages 表（只追加）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub rental_id: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub source: MessageSource,
    pub dedup_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!RentalStatus::Active.is_terminal());
        assert!(RentalStatus::Expired.is_terminal());
        assert!(RentalStatus::Cancelled.is_terminal());
        assert_eq!("expired".parse::<RentalStatus>().unwrap(), RentalStatus::Expired);
        assert!("requested".parse::<RentalStatus>().is_err());
    }

    #[test]
    fn test_native_ids_keep_every_role() {
        let ids = NativeIds::single(NativeIdKind::Order, "ord-1").with(NativeIdKind::Booking, "bk-9");
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.get(NativeIdKind::Order), Some("ord-1"));
        assert_eq!(ids.get(NativeIdKind::Booking), Some("bk-9"));

        let json = serde_json::to_value(&ids).unwrap();
        assert_eq!(json, serde_json::json!({"order": "ord-1", "booking": "bk-9"}));
    }
}
