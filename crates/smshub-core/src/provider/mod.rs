//! 供应商适配层
//!
//! 每个供应商的线上协议都不一样，但对外只暴露同一组操作：
//! 租号、续期、取消、拉短信。协议细节只存在于各自的子模块里，
//! 上层（同步编排、去重存储）只看得到 [`RawMessage`] 和 [`ProviderLease`]。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::{HttpClientConfig, ProviderConfig};
use crate::error::{Result, SmsHubError};
use crate::storage::entities::{MessageSource, NativeIdKind, NativeIds, Rental};

pub mod activate;
pub mod booking;
pub mod http;
pub mod inbox;
pub mod pool;
pub mod rest;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use http::ProviderHttpClient;

/// 供应商种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// handler_api.php 风格的查询协议
    Activate,
    /// Bearer token 的 JSON REST
    Rest,
    /// 下单 id 和收件箱 id 分开的预订式接口
    Booking,
    /// 路径风格的号码池接口
    Pool,
    /// 没有 API，只能抓收件箱网页
    Inbox,
}

/// 拉取短信的渠道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchChannel {
    ApiPolling,
    Scrape,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 5] = [
        ProviderKind::Activate,
        ProviderKind::Rest,
        ProviderKind::Booking,
        ProviderKind::Pool,
        ProviderKind::Inbox,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Activate => "activate",
            ProviderKind::Rest => "rest",
            ProviderKind::Booking => "booking",
            ProviderKind::Pool => "pool",
            ProviderKind::Inbox => "inbox",
        }
    }

    /// 渠道只由供应商身份决定
    pub fn fetch_channel(&self) -> FetchChannel {
        match self {
            ProviderKind::Inbox => FetchChannel::Scrape,
            _ => FetchChannel::ApiPolling,
        }
    }

    pub fn message_source(&self) -> MessageSource {
        match self.fetch_channel() {
            FetchChannel::ApiPolling => MessageSource::ProviderApi,
            FetchChannel::Scrape => MessageSource::Scrape,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = SmsHubError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SmsHubError::InvalidArgument(format!("未知的供应商: {}", s)))
    }
}

/// 租号方式（只有部分供应商区分）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RentMode {
    /// 一次性激活（收一条验证码）
    Activation,
    /// 按时长租用
    Rental,
}

/// 租号请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentRequest {
    pub provider: ProviderKind,
    pub service: String,
    pub country: String,
    /// 租用时长
    #[serde(with = "duration_hours")]
    pub duration: Duration,
    #[serde(default)]
    pub mode: Option<RentMode>,
}

impl RentRequest {
    pub fn hours(&self) -> i64 {
        self.duration.num_hours().max(1)
    }
}

/// 对外以小时为单位序列化
pub mod duration_hours {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_hours())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let hours = i64::deserialize(deserializer)?;
        if hours <= 0 {
            return Err(serde::de::Error::custom("duration must be a positive number of hours"));
        }
        Ok(Duration::hours(hours))
    }
}

/// 归一化之后的短信，编排层和存储层只认这个形状
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub source: MessageSource,
}

/// 租号成功后供应商返回的租约
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderLease {
    pub phone_number: String,
    /// 供应商下发的全部标识，一个都不能丢
    pub native_ids: NativeIds,
    /// 供应商报告的到期时间；没有时按请求时长计算
    pub expires_at: Option<DateTime<Utc>>,
    pub access_credentials: Option<serde_json::Value>,
}

/// 供应商适配器
///
/// 失败一律通过 `Result` 返回：
/// - 传输失败 / 超时 / 5xx → `ProviderUnavailable`
/// - 业务拒绝 → `ProviderRejected`（原样带上供应商文案）
/// - 看不懂的响应 → `ParseFailure`
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// 租号时必须拿到的标识角色
    fn required_id_kinds(&self) -> &'static [NativeIdKind];

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease>;

    /// 续期；供应商返回了新到期时间就带回来
    async fn extend(&self, rental: &Rental, duration: Duration) -> Result<Option<DateTime<Utc>>>;

    async fn cancel(&self, rental: &Rental) -> Result<()>;

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>>;
}

/// 检查租约里是否带齐了适配器声明的全部标识
pub fn check_lease_ids(adapter: &dyn ProviderAdapter, lease: &ProviderLease) -> Result<()> {
    let missing: Vec<&str> = adapter
        .required_id_kinds()
        .iter()
        .filter(|kind| !lease.native_ids.contains_kind(**kind))
        .map(|kind| kind.as_str())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(SmsHubError::ParseFailure {
        provider: adapter.kind(),
        reason: format!("租约缺少标识: {}", missing.join(", ")),
        snippet: serde_json::to_string(&lease.native_ids).unwrap_or_default(),
    })
}

/// 供应商注册表，按种类查找适配器
#[derive(Clone, Default)]
pub struct ProviderHub {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl ProviderHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置构造全部适配器，共享同一个 HTTP 客户端
    pub fn from_config(http: &HttpClientConfig, providers: &[ProviderConfig]) -> Result<Self> {
        let client = ProviderHttpClient::new(http)?;
        let mut hub = Self::new();
        for provider in providers {
            let adapter: Arc<dyn ProviderAdapter> = match provider {
                ProviderConfig::Activate(cfg) => {
                    Arc::new(activate::ActivateAdapter::new(client.clone(), cfg.clone()))
                }
                ProviderConfig::Rest(cfg) => Arc::new(rest::RestAdapter::new(client.clone(), cfg.clone())),
                ProviderConfig::Booking(cfg) => {
                    Arc::new(booking::BookingAdapter::new(client.clone(), cfg.clone()))
                }
                ProviderConfig::Pool(cfg) => Arc::new(pool::PoolAdapter::new(client.clone(), cfg.clone())),
                ProviderConfig::Inbox(cfg) => Arc::new(inbox::InboxAdapter::new(client.clone(), cfg.clone())?),
            };
            hub.register(adapter)?;
        }
        Ok(hub)
    }

    /// 注册适配器，同一种类只能有一个
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> Result<()> {
        let kind = adapter.kind();
        if self.adapters.contains_key(&kind) {
            return Err(SmsHubError::Config(format!("供应商 {} 重复注册", kind)));
        }
        info!("🔌 注册供应商适配器: {} ({:?})", kind, kind.fetch_channel());
        self.adapters.insert(kind, adapter);
        Ok(())
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| SmsHubError::InvalidArgument(format!("供应商 {} 未配置", kind)))
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedProvider;

    #[test]
    fn test_fetch_channel_is_pure_on_kind() {
        assert_eq!(ProviderKind::Inbox.fetch_channel(), FetchChannel::Scrape);
        for kind in [
            ProviderKind::Activate,
            ProviderKind::Rest,
            ProviderKind::Booking,
            ProviderKind::Pool,
        ] {
            assert_eq!(kind.fetch_channel(), FetchChannel::ApiPolling);
        }
        assert_eq!("booking".parse::<ProviderKind>().unwrap(), ProviderKind::Booking);
    }

    #[test]
    fn test_rent_request_duration_in_hours() {
        let req: RentRequest = serde_json::from_value(serde_json::json!({
            "provider": "rest",
            "service": "whatsapp",
            "country": "DE",
            "duration": 24
        }))
        .unwrap();
        assert_eq!(req.duration, Duration::hours(24));
        assert_eq!(req.mode, None);

        let bad = serde_json::from_value::<RentRequest>(serde_json::json!({
            "provider": "rest", "service": "x", "country": "DE", "duration": 0
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_hub_rejects_duplicate_kind() {
        let mut hub = ProviderHub::new();
        hub.register(Arc::new(ScriptedProvider::new(ProviderKind::Rest))).unwrap();
        let again = hub.register(Arc::new(ScriptedProvider::new(ProviderKind::Rest)));
        assert!(matches!(again, Err(SmsHubError::Config(_))));
        assert!(hub.get(ProviderKind::Pool).is_err());
    }

    #[test]
    fn test_lease_missing_declared_id_is_parse_failure() {
        let adapter = ScriptedProvider::new(ProviderKind::Booking)
            .with_required_ids(&[NativeIdKind::Order, NativeIdKind::Booking]);
        let lease = ProviderLease {
            phone_number: "+1".into(),
            native_ids: NativeIds::single(NativeIdKind::Order, "o-1"),
            expires_at: None,
            access_credentials: None,
        };
        let err = check_lease_ids(&adapter, &lease).unwrap_err();
        assert!(matches!(err, SmsHubError::ParseFailure { ref reason, .. } if reason.contains("booking")));
    }
}
