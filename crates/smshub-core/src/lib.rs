//! SmsHub - 虚拟号码租用与短信聚合核心
//!
//! 对接多家接码供应商，把各自不兼容的 API（以及一个只有网页收件箱的供应商）
//! 统一成一套规范操作，并把收到的短信汇总成一致、去重的视图：
//! - 📞 供应商适配：租号 / 续期 / 取消 / 拉短信
//! - 🗂️ 规范租用登记：状态只在本地单一来源，不跟着供应商漂移
//! - 🔁 同步编排：同一租用只跑一个同步，可重试错误按退避重试
//! - 🧮 去重存储：按内容派生的去重键，入库天然幂等
//! - ⚡ 读缓存：TTL + 冷却期，不反复打供应商
//! - 📡 实时通知：按租用订阅，可见性恢复后自动重建
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use smshub_core::{Caller, ProviderKind, RentRequest, SmsHub, SmsHubConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmsHubConfig::builder()
//!         .data_dir("/var/lib/smshub")
//!         .build()?;
//!
//!     let hub = SmsHub::initialize(config).await?;
//!     hub.start().await?;
//!
//!     let ops = Caller::operator("ops");
//!     let rental = hub
//!         .rent(
//!             &ops,
//!             RentRequest {
//!                 provider: ProviderKind::Rest,
//!                 service: "whatsapp".into(),
//!                 country: "DE".into(),
//!                 duration: chrono::Duration::hours(24),
//!                 mode: None,
//!             },
//!         )
//!         .await?;
//!
//!     let outcome = hub.sync(&ops, &rental.id).await?;
//!     println!("新短信: {}", outcome.new_messages_count);
//!
//!     hub.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod lifecycle;
pub mod overlay;
pub mod provider;
pub mod realtime;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;

pub use access::{AccessGate, AllowAllGate, AssigneeGate, Caller, CallerRole};
pub use cache::{CacheController, CacheOptions, CacheRead, CacheStats, Freshness};
pub use config::{
    ActivateConfig, BookingConfig, CacheConfig, CachePolicy, HttpClientConfig, InboxConfig,
    LabelPrefixes, PoolConfig, ProviderConfig, RealtimeConfig, RelayConfig, RelayFormat,
    RestConfig, SmsHubConfig, SmsHubConfigBuilder, SyncConfig,
};
pub use error::{ErrorKind, Result, SmsHubError};
pub use events::{EventFilter, EventManager, HubEvent};
pub use hub::{ManualRegistration, RemoveOutcome, RentalChange, RentalView, SmsHub, SmsHubBuilder};
pub use lifecycle::{LifecycleHook, LifecycleManager, Visibility};
pub use overlay::{PendingChange, PendingGuard, PendingKind, PendingOverlay};
pub use provider::{
    FetchChannel, ProviderAdapter, ProviderHub, ProviderKind, ProviderLease, RawMessage, RentMode,
    RentRequest,
};
pub use realtime::{RealtimeHooks, RealtimeNotifier};
pub use storage::entities::{Message, MessageSource, NativeIdKind, NativeIds, Rental, RentalStatus};
pub use storage::UpsertOutcome;
pub use sync::{RetryPolicy, SyncFailure, SyncOutcome, SyncTrigger};
pub use version::{build_info, BuildInfo};
