//! SmsHub 配置
//!
//! 所有字段都有默认值，TOML 里只需要写想改的部分。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::error::{Result, SmsHubError};
use crate::provider::ProviderKind;
use crate::sync::RetryPolicy;

/// 供应商 HTTP 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// 连接超时（秒）
    pub connect_timeout_secs: Option<u64>,
    /// 单次请求超时（秒），超时按 ProviderUnavailable 处理
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(5),
            request_timeout_secs: 15,
            user_agent: format!("smshub/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// 单类缓存键的策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachePolicy {
    pub ttl_secs: u64,
    /// 两次自动加载之间的最小间隔（不管上次成功与否）
    pub cooling_secs: u64,
}

impl CachePolicy {
    pub const fn new(ttl_secs: u64, cooling_secs: u64) -> Self {
        Self { ttl_secs, cooling_secs }
    }

    pub fn options(&self, force: bool) -> CacheOptions {
        CacheOptions {
            ttl: Duration::from_secs(self.ttl_secs),
            cooling_period: Duration::from_secs(self.cooling_secs),
            force,
        }
    }
}

/// 按键族划分的缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `rental-list:<caller>`
    pub rental_list: CachePolicy,
    /// `messages:<rental_id>`
    pub messages: CachePolicy,
    /// `sync:<rental_id>`，限制自动同步打到供应商的频率
    pub sync: CachePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            rental_list: CachePolicy::new(30, 10),
            messages: CachePolicy::new(15, 5),
            sync: CachePolicy::new(20, 20),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
    /// 单次拉取的总超时（秒），抓取渠道的一次拉取会经过多个中继
    pub attempt_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 隐藏超过这个时长再回到前台，重建订阅并补一次刷新
    pub hidden_threshold_secs: u64,
    /// 事件广播通道容量
    pub event_capacity: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            hidden_threshold_secs: 60,
            event_capacity: 256,
        }
    }
}

/// 中继返回体的格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayFormat {
    /// 直接返回目标页面 HTML
    #[default]
    Raw,
    /// `{"contents": "<html>..."}` 包装
    JsonContents,
}

/// 一个 CORS 中继
///
/// `url` 里有 `{url}` 占位符时替换成百分号编码后的目标地址，
/// 否则直接把目标地址拼在后面。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub url: String,
    #[serde(default)]
    pub format: RelayFormat,
}

/// 收件箱表格的列名前缀（归一化后按前缀匹配）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelPrefixes {
    pub sender: Vec<String>,
    pub body: Vec<String>,
    pub time: Vec<String>,
}

impl Default for LabelPrefixes {
    fn default() -> Self {
        let owned = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
        Self {
            sender: owned(&["from", "sender", "number"]),
            body: owned(&["message", "text", "sms", "content"]),
            time: owned(&["time", "date", "received"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateConfig {
    /// 例如 `https://api.example.com/stubs/handler_api.php`
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// 收件箱页面地址模板，`{phone}` 替换成号码的数字部分
    pub page_url: String,
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub labels: LabelPrefixes,
}

/// 单个供应商的配置，按 `kind` 区分
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Activate(ActivateConfig),
    Rest(RestConfig),
    Booking(BookingConfig),
    Pool(PoolConfig),
    Inbox(InboxConfig),
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderConfig::Activate(_) => ProviderKind::Activate,
            ProviderConfig::Rest(_) => ProviderKind::Rest,
            ProviderConfig::Booking(_) => ProviderKind::Booking,
            ProviderConfig::Pool(_) => ProviderKind::Pool,
            ProviderConfig::Inbox(_) => ProviderKind::Inbox,
        }
    }
}

/// SmsHub 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsHubConfig {
    /// 数据目录；为空时使用内存数据库
    pub data_dir: Option<PathBuf>,
    pub http: HttpClientConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    /// 去重时间桶（秒）
    pub dedup_bucket_secs: u64,
    pub realtime: RealtimeConfig,
    /// 到期扫描间隔（秒）
    pub expiry_sweep_secs: u64,
    pub providers: Vec<ProviderConfig>,
}

impl Default for SmsHubConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            http: HttpClientConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            dedup_bucket_secs: 60,
            realtime: RealtimeConfig::default(),
            expiry_sweep_secs: 30,
            providers: Vec::new(),
        }
    }
}

impl SmsHubConfig {
    pub fn builder() -> SmsHubConfigBuilder {
        SmsHubConfigBuilder::new()
    }

    /// 构造期校验，配置问题直接失败
    pub fn validate(&self) -> Result<()> {
        if self.dedup_bucket_secs == 0 {
            return Err(SmsHubError::Config("dedup_bucket_secs 必须大于 0".to_string()));
        }
        if self.expiry_sweep_secs == 0 {
            return Err(SmsHubError::Config("expiry_sweep_secs 必须大于 0".to_string()));
        }
        if self.realtime.event_capacity == 0 {
            return Err(SmsHubError::Config("realtime.event_capacity 必须大于 0".to_string()));
        }
        if self.sync.attempt_timeout_secs == 0 {
            return Err(SmsHubError::Config("sync.attempt_timeout_secs 必须大于 0".to_string()));
        }
        if self.sync.retry.max_attempts == 0 {
            return Err(SmsHubError::Config("sync.retry.max_attempts 必须大于 0".to_string()));
        }

        let mut seen = Vec::new();
        for provider in &self.providers {
            let kind = provider.kind();
            if seen.contains(&kind) {
                return Err(SmsHubError::Config(format!("供应商 {} 重复配置", kind)));
            }
            seen.push(kind);

            if let ProviderConfig::Inbox(inbox) = provider {
                if inbox.relays.is_empty() {
                    return Err(SmsHubError::Config("inbox 供应商至少需要一个中继".to_string()));
                }
            }
        }
        Ok(())
    }
}

pub struct SmsHubConfigBuilder {
    config: SmsHubConfig,
}

impl SmsHubConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SmsHubConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn http(mut self, http: HttpClientConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http.request_timeout_secs = secs;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.sync.retry = retry;
        self
    }

    pub fn dedup_bucket_secs(mut self, secs: u64) -> Self {
        self.config.dedup_bucket_secs = secs;
        self
    }

    pub fn hidden_threshold_secs(mut self, secs: u64) -> Self {
        self.config.realtime.hidden_threshold_secs = secs;
        self
    }

    pub fn expiry_sweep_secs(mut self, secs: u64) -> Self {
        self.config.expiry_sweep_secs = secs;
        self
    }

    /// 添加供应商（按添加顺序）
    pub fn provider(mut self, provider: ProviderConfig) -> Self {
        self.config.providers.push(provider);
        self
    }

    pub fn build(self) -> Result<SmsHubConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SmsHubConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
