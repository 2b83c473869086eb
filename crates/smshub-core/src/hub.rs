//! SmsHub 主接口
//!
//! 显式构造、显式持有，所有组件都挂在这个实例上：
//! - 存储层：RentalRegistry / MessageStore（共享一个 SQLite 连接）
//! - 供应商层：ProviderHub
//! - 同步层：SyncOrchestrator
//! - 缓存层：租用列表 / 短信 / 同步三组 CacheController
//! - 事件层：EventManager + RealtimeNotifier + LifecycleManager
//!
//! `start` 启动到期扫描和可见性监听，`shutdown` 取消它们。

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::access::{ensure_allowed, AccessGate, AllowAllGate, Caller};
use crate::cache::{messages_key, rental_list_key, sync_key, CacheController, CacheRead, Freshness};
use crate::config::{CachePolicy, SmsHubConfig};
use crate::error::{Result, SmsHubError};
use crate::events::{now_millis, EventManager, HubEvent};
use crate::lifecycle::{LifecycleManager, Visibility};
use crate::overlay::{PendingChange, PendingGuard, PendingKind, PendingOverlay};
use crate::provider::{
    check_lease_ids, duration_hours, ProviderAdapter, ProviderHub, ProviderKind, RawMessage,
    RentRequest,
};
use crate::realtime::{RealtimeHooks, RealtimeNotifier};
use crate::storage::entities::{
    Message, MessageSource, NativeIdKind, NativeIds, NewRental, Rental, RentalStatus,
};
use crate::storage::{
    open_database, DedupKeyer, MessageStore, RentalFilter, RentalRegistry, UpsertOutcome,
};
use crate::sync::{SyncOrchestrator, SyncOutcome, SyncTrigger};

/// 手动登记号码
#[derive(Debug, Clone, Deserialize)]
pub struct ManualRegistration {
    pub phone_number: String,
    #[serde(default = "default_manual_provider")]
    pub provider: ProviderKind,
    /// 不填时用号码的数字部分
    #[serde(default)]
    pub native_id: Option<String>,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(with = "duration_hours", default = "default_manual_duration")]
    pub duration: ChronoDuration,
}

fn default_manual_provider() -> ProviderKind {
    ProviderKind::Inbox
}

fn default_manual_duration() -> ChronoDuration {
    ChronoDuration::days(30)
}

/// 续期 / 取消的结果：规范记录一定已更新，供应商侧失败时带上 warning
#[derive(Debug, Clone, Serialize)]
pub struct RentalChange {
    #[serde(flatten)]
    pub rental: Rental,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// DELETE 语义的结果
#[derive(Debug, Clone)]
pub enum RemoveOutcome {
    /// 供应商租用已取消
    Cancelled(RentalChange),
    /// 手动登记的号码已物理删除
    Deleted,
    /// 已经取消 / 到期 / 不存在
    AlreadyGone,
}

/// 单个租用的视图
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RentalView {
    pub rental: Rental,
    pub messages: Vec<Message>,
    pub messages_freshness: Freshness,
    /// 尚未确认的变更，和 `rental` 里的已确认状态分开
    pub pending: Vec<PendingChange>,
    pub unseen: usize,
    pub sync: SyncOutcome,
}

/// 带结果缓存的同步入口，强制触发合并到进行中的那次
#[derive(Clone)]
struct SyncRunner {
    orchestrator: SyncOrchestrator,
    outcomes: CacheController<SyncOutcome>,
    messages: CacheController<Vec<Message>>,
    policy: CachePolicy,
}

impl SyncRunner {
    async fn run(&self, rental_id: &str, trigger: SyncTrigger, force: bool) -> SyncOutcome {
        let orchestrator = self.orchestrator.clone();
        let id = rental_id.to_string();
        let read = self
            .outcomes
            .get(&sync_key(rental_id), self.policy.options(force), move || async move {
                Ok(orchestrator.sync(&id, trigger).await)
            })
            .await;

        let outcome = match read.payload {
            Some(outcome) => outcome,
            None => {
                let message = read
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "sync produced no outcome".to_string());
                SyncOutcome::failed(rental_id, trigger, &SmsHubError::InvalidOperation(message), 0)
            }
        };
        if read.loaded && outcome.new_messages_count > 0 {
            self.messages.invalidate(&messages_key(rental_id));
        }
        outcome
    }
}

/// 续期 / 取消 / 分配的执行体
///
/// 在独立任务里跑完：调用方被丢弃时，供应商调用和登记表写入照常完成，
/// pending 记录照常确认或回滚。
#[derive(Clone)]
struct RentalMutator {
    providers: ProviderHub,
    registry: RentalRegistry,
    events: EventManager,
    rental_lists: CacheController<Vec<Rental>>,
}

impl RentalMutator {
    async fn extend(self, rental: Rental, duration: ChronoDuration, pending: PendingGuard) -> Result<RentalChange> {
        let provider_result = match self.providers.get(rental.provider) {
            Ok(adapter) => adapter.extend(&rental, duration).await,
            Err(e) => Err(e),
        };
        let fallback = rental.expires_at + duration;
        let (new_expiry, warning) = match provider_result {
            Ok(Some(reported)) => (reported, None),
            Ok(None) => (fallback, None),
            Err(e) => {
                warn!("⚠️ 供应商续期失败，只更新本地记录: rental_id={}, error={}", rental.id, e);
                (fallback, Some(e.to_string()))
            }
        };

        let updated = self.registry.extend_expiry(&rental.id, new_expiry).await?;
        pending.confirm();
        self.events
            .emit(HubEvent::RentalExtended {
                rental_id: updated.id.clone(),
                expires_at: updated.expires_at,
                timestamp: now_millis(),
            })
            .await;
        self.rental_lists.invalidate_prefix("rental-list:");
        Ok(RentalChange { rental: updated, warning })
    }

    async fn cancel(self, rental: Rental, pending: PendingGuard) -> Result<RentalChange> {
        let provider_result = match self.providers.get(rental.provider) {
            Ok(adapter) => adapter.cancel(&rental).await,
            Err(e) => Err(e),
        };
        let warning = provider_result.err().map(|e| {
            warn!("⚠️ 供应商取消失败，只更新本地记录: rental_id={}, error={}", rental.id, e);
            e.to_string()
        });

        let updated = self.registry.update_status(&rental.id, RentalStatus::Cancelled).await?;
        pending.confirm();
        self.events
            .emit(HubEvent::RentalStatusChanged {
                rental_id: updated.id.clone(),
                old_status: rental.status,
                new_status: updated.status,
                timestamp: now_millis(),
            })
            .await;
        self.rental_lists.invalidate_prefix("rental-list:");
        info!("🛑 租用已取消: rental_id={}", rental.id);
        Ok(RentalChange { rental: updated, warning })
    }

    async fn assign(
        self,
        rental_id: String,
        assignee: Option<String>,
        force: bool,
        pending: PendingGuard,
    ) -> Result<Rental> {
        let updated = self.registry.assign(&rental_id, assignee.as_deref(), force).await?;
        pending.confirm();
        self.events
            .emit(HubEvent::RentalAssigned {
                rental_id: updated.id.clone(),
                assignee: updated.assignee.clone(),
                timestamp: now_millis(),
            })
            .await;
        self.rental_lists.invalidate_prefix("rental-list:");
        Ok(updated)
    }
}

/// 在独立任务里跑到底，等待方被丢弃不影响任务本身
async fn run_detached<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| SmsHubError::InvalidOperation(format!("rental mutation task failed: {}", e)))?
}

/// 通知器回调：变更时让缓存失效，恢复时补一次刷新（受同步缓存冷却期限制）
struct HubRealtimeHooks {
    runner: SyncRunner,
    rental_lists: CacheController<Vec<Rental>>,
}

#[async_trait]
impl RealtimeHooks for HubRealtimeHooks {
    async fn on_change(&self, rental_id: &str) {
        self.runner.messages.invalidate(&messages_key(rental_id));
        self.rental_lists.invalidate_prefix("rental-list:");
        let outcome = self.runner.orchestrator.sync(rental_id, SyncTrigger::StoreChanged).await;
        debug!("本地读穿完成: rental_id={}, success={}", rental_id, outcome.success);
    }

    async fn on_resumed(&self, rental_ids: Vec<String>) {
        info!("🔄 恢复后刷新 {} 个租用", rental_ids.len());
        let outcomes = join_all(
            rental_ids
                .iter()
                .map(|id| self.runner.run(id, SyncTrigger::Resumed, false)),
        )
        .await;
        let failed = outcomes.iter().filter(|o| !o.success).count();
        if failed > 0 {
            warn!("⚠️ 恢复刷新有 {} 个租用失败", failed);
        }
    }
}

/// SmsHub 构造器
pub struct SmsHubBuilder {
    config: SmsHubConfig,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    gate: Arc<dyn AccessGate>,
}

impl SmsHubBuilder {
    pub fn new() -> Self {
        Self {
            config: SmsHubConfig::default(),
            adapters: Vec::new(),
            gate: Arc::new(AllowAllGate),
        }
    }

    pub fn config(mut self, config: SmsHubConfig) -> Self {
        self.config = config;
        self
    }

    /// 额外注入适配器（和配置里的供应商一起注册，种类不能重复）
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn access_gate(mut self, gate: Arc<dyn AccessGate>) -> Self {
        self.gate = gate;
        self
    }

    /// 分层初始化：存储层 → 供应商层 → 事件层 → 同步层 → 缓存与通知层
    pub async fn build(self) -> Result<Arc<SmsHub>> {
        let config = self.config;
        info!("正在初始化 SmsHub...");
        config.validate()?;

        // === 第1层：存储 ===
        let conn = open_database(config.data_dir.as_deref()).await?;
        let registry = RentalRegistry::new(conn.clone());
        let store = MessageStore::new(conn, DedupKeyer::new(config.dedup_bucket_secs));

        // === 第2层：供应商 ===
        let mut providers = ProviderHub::from_config(&config.http, &config.providers)?;
        for adapter in self.adapters {
            providers.register(adapter)?;
        }
        if providers.kinds().is_empty() {
            warn!("⚠️ 没有配置任何供应商，只能登记手动号码");
        }

        // === 第3层：事件 ===
        let events = EventManager::new(config.realtime.event_capacity);

        // === 第4层：同步 ===
        let orchestrator = SyncOrchestrator::new(
            providers.clone(),
            registry.clone(),
            store.clone(),
            events.clone(),
            config.sync.retry.clone(),
            Duration::from_secs(config.sync.attempt_timeout_secs),
        );

        // === 第5层：缓存与实时通知 ===
        let rental_lists = CacheController::new();
        let messages = CacheController::new();
        let runner = SyncRunner {
            orchestrator: orchestrator.clone(),
            outcomes: CacheController::new(),
            messages: messages.clone(),
            policy: config.cache.sync,
        };
        let notifier = RealtimeNotifier::new(
            events.clone(),
            Arc::new(HubRealtimeHooks {
                runner: runner.clone(),
                rental_lists: rental_lists.clone(),
            }),
            Duration::from_secs(config.realtime.hidden_threshold_secs),
        );

        let mut lifecycle = LifecycleManager::new();
        lifecycle.register_hook(Arc::new(notifier.clone()));

        let (visibility_tx, visibility_rx) = mpsc::unbounded_channel();

        info!("✅ SmsHub 初始化完成: providers={:?}", providers.kinds());
        Ok(Arc::new(SmsHub {
            config,
            providers,
            registry,
            store,
            events,
            runner,
            rental_lists,
            messages,
            overlay: PendingOverlay::new(),
            notifier,
            lifecycle: RwLock::new(lifecycle),
            gate: self.gate,
            visibility_tx,
            visibility_rx: Mutex::new(Some(visibility_rx)),
            shutdown_token: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }))
    }
}

impl Default for SmsHubBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// SmsHub 主接口
pub struct SmsHub {
    config: SmsHubConfig,
    providers: ProviderHub,
    registry: RentalRegistry,
    store: MessageStore,
    events: EventManager,
    runner: SyncRunner,
    rental_lists: CacheController<Vec<Rental>>,
    messages: CacheController<Vec<Message>>,
    overlay: PendingOverlay,
    notifier: RealtimeNotifier,
    lifecycle: RwLock<LifecycleManager>,
    gate: Arc<dyn AccessGate>,
    visibility_tx: mpsc::UnboundedSender<Visibility>,
    visibility_rx: Mutex<Option<mpsc::UnboundedReceiver<Visibility>>>,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SmsHub {
    pub async fn initialize(config: SmsHubConfig) -> Result<Arc<Self>> {
        SmsHubBuilder::new().config(config).build().await
    }

    pub fn builder() -> SmsHubBuilder {
        SmsHubBuilder::new()
    }

    pub fn config(&self) -> &SmsHubConfig {
        &self.config
    }

    pub fn provider_kinds(&self) -> Vec<ProviderKind> {
        self.providers.kinds()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            return Err(SmsHubError::ShuttingDown("SmsHub 正在关闭".to_string()));
        }
        Ok(())
    }

    /// 取租用并检查权限
    async fn authorized(&self, caller: &Caller, rental_id: &str) -> Result<Rental> {
        let rental = self.registry.get(rental_id).await?;
        ensure_allowed(self.gate.as_ref(), caller, Some(&rental))?;
        Ok(rental)
    }

    fn invalidate_lists(&self) {
        self.rental_lists.invalidate_prefix("rental-list:");
    }

    fn mutator(&self) -> RentalMutator {
        RentalMutator {
            providers: self.providers.clone(),
            registry: self.registry.clone(),
            events: self.events.clone(),
            rental_lists: self.rental_lists.clone(),
        }
    }

    /// 租号
    pub async fn rent(&self, caller: &Caller, request: RentRequest) -> Result<Rental> {
        self.ensure_running()?;
        ensure_allowed(self.gate.as_ref(), caller, None)?;
        if request.duration <= ChronoDuration::zero() {
            return Err(SmsHubError::InvalidArgument("duration must be positive".to_string()));
        }

        let adapter = self.providers.get(request.provider)?;
        info!(
            "📞 租号: provider={}, service={}, country={}, hours={}",
            request.provider,
            request.service,
            request.country,
            request.hours()
        );
        let lease = adapter.rent(&request).await?;
        if let Err(e) = check_lease_ids(adapter.as_ref(), &lease) {
            error!("❌ 供应商租约缺少标识，拒绝落库: phone={}, error={}", lease.phone_number, e);
            return Err(e);
        }

        let now = Utc::now();
        let rental = self
            .registry
            .create_rental(NewRental {
                phone_number: lease.phone_number,
                provider: request.provider,
                native_ids: lease.native_ids,
                service_code: request.service,
                country_code: request.country,
                leased_at: now,
                expires_at: lease.expires_at.unwrap_or(now + request.duration).max(now),
                assignee: (!caller.is_operator()).then(|| caller.id.clone()),
                access_credentials: lease.access_credentials,
                manual: false,
            })
            .await?;

        self.events
            .emit(HubEvent::RentalCreated {
                rental_id: rental.id.clone(),
                provider: rental.provider,
                timestamp: now_millis(),
            })
            .await;
        self.invalidate_lists();
        self.notifier.subscribe(&rental.id);
        Ok(rental)
    }

    /// 手动登记号码（只有运营可以）
    pub async fn register_manual(&self, caller: &Caller, registration: ManualRegistration) -> Result<Rental> {
        self.ensure_running()?;
        if !caller.is_operator() {
            return Err(SmsHubError::Forbidden("only operators may register numbers".to_string()));
        }

        let digits: String = registration.phone_number.chars().filter(char::is_ascii_digit).collect();
        let native_id = registration
            .native_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| digits.clone());
        if native_id.is_empty() {
            return Err(SmsHubError::InvalidArgument(format!(
                "invalid phone number: {}",
                registration.phone_number
            )));
        }
        if registration.duration <= ChronoDuration::zero() {
            return Err(SmsHubError::InvalidArgument("duration must be positive".to_string()));
        }

        let existed = self
            .registry
            .find_by_native_id(registration.provider, &native_id)
            .await?
            .is_some();
        let now = Utc::now();
        let rental = self
            .registry
            .create_rental(NewRental {
                phone_number: registration.phone_number.trim().to_string(),
                provider: registration.provider,
                native_ids: NativeIds::single(NativeIdKind::Manual, native_id),
                service_code: registration.service.unwrap_or_else(|| "any".to_string()),
                country_code: registration.country.unwrap_or_default(),
                leased_at: now,
                expires_at: now + registration.duration,
                assignee: None,
                access_credentials: None,
                manual: true,
            })
            .await?;

        if !existed {
            self.events
                .emit(HubEvent::RentalCreated {
                    rental_id: rental.id.clone(),
                    provider: rental.provider,
                    timestamp: now_millis(),
                })
                .await;
            self.invalidate_lists();
        }
        self.notifier.subscribe(&rental.id);
        Ok(rental)
    }

    /// 续期（尽力而为）
    ///
    /// 供应商失败不报错：按当前到期时间加时长更新规范记录，并返回 warning。
    pub async fn extend(&self, caller: &Caller, rental_id: &str, duration: ChronoDuration) -> Result<RentalChange> {
        self.ensure_running()?;
        if duration <= ChronoDuration::zero() {
            return Err(SmsHubError::InvalidArgument("duration must be positive".to_string()));
        }
        self.authorized(caller, rental_id).await?;
        let rental = self.registry.reconcile_expiry(rental_id, Utc::now()).await?;
        if rental.status.is_terminal() {
            return Err(SmsHubError::AlreadyTerminal {
                rental_id: rental.id,
                status: rental.status,
            });
        }

        let pending = self.overlay.guard(rental_id, PendingKind::Extend { hours: duration.num_hours() });
        run_detached(self.mutator().extend(rental, duration, pending)).await
    }

    /// 取消（尽力而为）
    ///
    /// 已到期的租用先落成 expired，再报 `AlreadyTerminal`。
    pub async fn cancel(&self, caller: &Caller, rental_id: &str) -> Result<RentalChange> {
        self.ensure_running()?;
        self.authorized(caller, rental_id).await?;
        let rental = self.registry.reconcile_expiry(rental_id, Utc::now()).await?;
        if rental.status.is_terminal() {
            return Err(SmsHubError::AlreadyTerminal {
                rental_id: rental.id,
                status: rental.status,
            });
        }

        let pending = self.overlay.guard(rental_id, PendingKind::Cancel);
        run_detached(self.mutator().cancel(rental, pending)).await
    }

    /// DELETE 语义：供应商租用取消，手动号码物理删除；重复调用是 no-op
    pub async fn remove(&self, caller: &Caller, rental_id: &str) -> Result<RemoveOutcome> {
        self.ensure_running()?;
        let Some(rental) = self.registry.find(rental_id).await? else {
            return Ok(RemoveOutcome::AlreadyGone);
        };
        ensure_allowed(self.gate.as_ref(), caller, Some(&rental))?;

        if rental.manual {
            let Some(removed_messages) = self.registry.delete_manual(rental_id).await? else {
                return Ok(RemoveOutcome::AlreadyGone);
            };
            self.notifier.unsubscribe(rental_id);
            self.messages.invalidate(&messages_key(rental_id));
            self.events
                .emit(HubEvent::RentalRemoved {
                    rental_id: rental_id.to_string(),
                    timestamp: now_millis(),
                })
                .await;
            self.invalidate_lists();
            debug!("手动号码已删除: rental_id={}, messages={}", rental_id, removed_messages);
            return Ok(RemoveOutcome::Deleted);
        }

        match self.cancel(caller, rental_id).await {
            Ok(change) => Ok(RemoveOutcome::Cancelled(change)),
            Err(SmsHubError::AlreadyTerminal { .. }) => Ok(RemoveOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }

    /// 分配给某人（`None` 表示取消分配）
    pub async fn assign(
        &self,
        caller: &Caller,
        rental_id: &str,
        assignee: Option<String>,
        force: bool,
    ) -> Result<Rental> {
        self.ensure_running()?;
        self.authorized(caller, rental_id).await?;

        let pending = self.overlay.guard(rental_id, PendingKind::Assign { assignee: assignee.clone() });
        run_detached(self.mutator().assign(rental_id.to_string(), assignee, force, pending)).await
    }

    /// 租用视图：打开即强制同步（合并到进行中的同步），`force` 时短信列表也绕过缓存
    pub async fn rental_status(&self, caller: &Caller, rental_id: &str, force: bool) -> Result<RentalView> {
        self.ensure_running()?;
        self.authorized(caller, rental_id).await?;
        let rental = self.registry.reconcile_expiry(rental_id, Utc::now()).await?;
        self.notifier.subscribe(rental_id);

        let trigger = if force { SyncTrigger::UserRefresh } else { SyncTrigger::ViewOpened };
        let sync = self.runner.run(rental_id, trigger, true).await;

        let store = self.store.clone();
        let id = rental_id.to_string();
        let read = self
            .messages
            .get(&messages_key(rental_id), self.config.cache.messages.options(force), move || async move {
                store.list(&id).await
            })
            .await;
        if let Some(error) = &read.error {
            warn!("⚠️ 读取短信失败，返回旧快照: rental_id={}, error={}", rental_id, error.message);
        }

        Ok(RentalView {
            pending: self.overlay.pending_for(rental_id),
            unseen: self.notifier.unseen_count(rental_id),
            messages: read.payload.unwrap_or_default(),
            messages_freshness: read.freshness,
            rental,
            sync,
        })
    }

    /// 手动同步（强制，合并到进行中的同步）
    pub async fn sync(&self, caller: &Caller, rental_id: &str) -> Result<SyncOutcome> {
        self.ensure_running()?;
        self.authorized(caller, rental_id).await?;
        Ok(self.runner.run(rental_id, SyncTrigger::UserRefresh, true).await)
    }

    /// 租用列表（带缓存）
    pub async fn list_rentals(&self, caller: &Caller, force: bool) -> Result<CacheRead<Vec<Rental>>> {
        self.ensure_running()?;
        ensure_allowed(self.gate.as_ref(), caller, None)?;

        let filter = RentalFilter {
            assignee: self.gate.sees_only_own(caller).then(|| caller.id.clone()),
            status: None,
        };
        let registry = self.registry.clone();
        Ok(self
            .rental_lists
            .get(&rental_list_key(&caller.id), self.config.cache.rental_list.options(force), move || async move {
                registry.list(&filter).await
            })
            .await)
    }

    /// 写入一条测试短信（只有运营可以）
    pub async fn inject_test_message(
        &self,
        caller: &Caller,
        rental_id: &str,
        sender: &str,
        body: &str,
    ) -> Result<UpsertOutcome> {
        self.ensure_running()?;
        if !caller.is_operator() {
            return Err(SmsHubError::Forbidden("only operators may inject test messages".to_string()));
        }
        let rental = self.registry.get(rental_id).await?;
        if body.trim().is_empty() {
            return Err(SmsHubError::InvalidArgument("message body is empty".to_string()));
        }

        let outcome = self
            .store
            .upsert(
                &rental.id,
                &RawMessage {
                    sender: sender.to_string(),
                    body: body.to_string(),
                    received_at: Utc::now(),
                    source: MessageSource::ManualTest,
                },
            )
            .await?;
        if outcome.inserted {
            self.messages.invalidate(&messages_key(rental_id));
            self.events
                .emit(HubEvent::MessagesChanged {
                    rental_id: rental.id.clone(),
                    new_messages: 1,
                    timestamp: now_millis(),
                })
                .await;
        }
        Ok(outcome)
    }

    pub async fn mark_viewed(&self, caller: &Caller, rental_id: &str) -> Result<()> {
        self.authorized(caller, rental_id).await?;
        self.notifier.mark_viewed(rental_id);
        Ok(())
    }

    pub async fn unseen_count(&self, caller: &Caller, rental_id: &str) -> Result<usize> {
        self.authorized(caller, rental_id).await?;
        Ok(self.notifier.unseen_count(rental_id))
    }

    /// 宿主可见性事件入口
    pub fn visibility_sender(&self) -> mpsc::UnboundedSender<Visibility> {
        self.visibility_tx.clone()
    }

    /// 把到期的租用置为 expired 并广播
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        let expired = self.registry.expire_due(Utc::now()).await?;
        for rental_id in &expired {
            self.events
                .emit(HubEvent::RentalStatusChanged {
                    rental_id: rental_id.clone(),
                    old_status: RentalStatus::Active,
                    new_status: RentalStatus::Expired,
                    timestamp: now_millis(),
                })
                .await;
        }
        if !expired.is_empty() {
            self.invalidate_lists();
        }
        Ok(expired)
    }

    /// 启动后台任务：到期扫描、可见性监听
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        let Some(mut visibility_rx) = self.visibility_rx.lock().take() else {
            return Err(SmsHubError::InvalidOperation("SmsHub already started".to_string()));
        };

        let active = self
            .registry
            .list(&RentalFilter {
                assignee: None,
                status: Some(RentalStatus::Active),
            })
            .await?;
        for rental in &active {
            self.notifier.subscribe(&rental.id);
        }

        let sweep_every = Duration::from_secs(self.config.expiry_sweep_secs);
        let hub = self.clone();
        let token = self.shutdown_token.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = hub.sweep_expired().await {
                            warn!("⚠️ 到期扫描失败: {}", e);
                        }
                    }
                }
            }
            debug!("到期扫描任务退出");
        });

        let hub = self.clone();
        let token = self.shutdown_token.clone();
        let visibility = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = visibility_rx.recv() => match received {
                        Some(visibility) => {
                            debug!("可见性变化: {:?}", visibility);
                            if let Err(e) = hub.lifecycle.read().await.notify(visibility).await {
                                warn!("⚠️ 可见性回调失败: {}", e);
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("可见性监听任务退出");
        });

        self.tasks.lock().extend([sweeper, visibility]);
        info!("✅ SmsHub 已启动: 订阅 {} 个进行中的租用", active.len());
        Ok(())
    }

    /// 关闭：取消后台任务和所有订阅；进行中的同步会跑完并写入
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 SmsHub...");

        self.shutdown_token.cancel();
        self.notifier.shutdown();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("⚠️ 后台任务退出异常: {}", e);
            }
        }

        info!("SmsHub 关闭完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AssigneeGate;
    use crate::config::{BookingConfig, CacheConfig, ProviderConfig};
    use crate::provider::testing::{serve, ScriptedProvider};
    use axum::extract::Path;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn hub_with(provider: Arc<ScriptedProvider>) -> Arc<SmsHub> {
        SmsHub::builder().adapter(provider).build().await.unwrap()
    }

    fn rest_request(hours: i64) -> RentRequest {
        RentRequest {
            provider: ProviderKind::Rest,
            service: "whatsapp".into(),
            country: "DE".into(),
            duration: ChronoDuration::hours(hours),
            mode: None,
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_rent_then_sync_counts_new_messages_once() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider.clone()).await;
        let ops = Caller::operator("ops");

        let rental = hub.rent(&ops, rest_request(24)).await.unwrap();
        assert_eq!(rental.status, RentalStatus::Active);
        let expected = Utc::now() + ChronoDuration::hours(24);
        assert!((rental.expires_at - expected).num_seconds().abs() < 5);

        assert_eq!(hub.sync(&ops, &rental.id).await.unwrap().new_messages_count, 0);

        provider.push_message("WhatsApp", "Your WhatsApp code: 318-204", Utc::now());
        let first = hub.sync(&ops, &rental.id).await.unwrap();
        let second = hub.sync(&ops, &rental.id).await.unwrap();
        assert_eq!(first.new_messages_count, 1);
        assert_eq!(second.new_messages_count, 0);
        assert!(second.success);

        let view = hub.rental_status(&ops, &rental.id, false).await.unwrap();
        assert_eq!(view.messages.len(), 1);
        assert_eq!(view.messages[0].source, MessageSource::ProviderApi);
    }

    #[tokio::test]
    async fn test_cancel_of_elapsed_rental_reports_terminal() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider.clone()).await;
        let now = Utc::now();
        let rental = hub
            .registry
            .create_rental(NewRental {
                phone_number: "+4915100000077".into(),
                provider: ProviderKind::Rest,
                native_ids: NativeIds::single(NativeIdKind::Order, "ord-77"),
                service_code: "telegram".into(),
                country_code: "DE".into(),
                leased_at: now - ChronoDuration::hours(2),
                expires_at: now - ChronoDuration::hours(1),
                assignee: None,
                access_credentials: None,
                manual: false,
            })
            .await
            .unwrap();

        let result = hub.cancel(&Caller::operator("ops"), &rental.id).await;
        assert!(matches!(
            result,
            Err(SmsHubError::AlreadyTerminal { status: RentalStatus::Expired, .. })
        ));
        assert_eq!(hub.registry.get(&rental.id).await.unwrap().status, RentalStatus::Expired);
        assert_eq!(provider.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_provider_failures_degrade_to_warnings() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider.clone()).await;
        let ops = Caller::operator("ops");
        let rental = hub.rent(&ops, rest_request(1)).await.unwrap();

        provider.fail_next_extend(provider.unavailable());
        let extended = hub.extend(&ops, &rental.id, ChronoDuration::hours(2)).await.unwrap();
        assert!(extended.warning.is_some());
        let drift = extended.rental.expires_at - (rental.expires_at + ChronoDuration::hours(2));
        assert!(drift.num_milliseconds().abs() <= 1);
        assert!(hub.overlay.pending_for(&rental.id).is_empty());

        // 供应商报告的到期时间更早时不回退
        provider.report_extend_expiry(rental.expires_at);
        let again = hub.extend(&ops, &rental.id, ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(again.rental.expires_at, extended.rental.expires_at);

        provider.fail_next_cancel(provider.unavailable());
        let cancelled = hub.cancel(&ops, &rental.id).await.unwrap();
        assert_eq!(cancelled.rental.status, RentalStatus::Cancelled);
        assert!(cancelled.warning.is_some());

        let extend_after = hub.extend(&ops, &rental.id, ChronoDuration::hours(1)).await;
        assert!(matches!(extend_after, Err(SmsHubError::AlreadyTerminal { .. })));
        assert!(matches!(
            hub.remove(&ops, &rental.id).await.unwrap(),
            RemoveOutcome::AlreadyGone
        ));
    }

    #[tokio::test]
    async fn test_dropped_extend_still_settles() {
        let provider = Arc::new(
            ScriptedProvider::new(ProviderKind::Rest).with_extend_delay(Duration::from_millis(300)),
        );
        let hub = hub_with(provider.clone()).await;
        let ops = Caller::operator("ops");
        let rental = hub.rent(&ops, rest_request(1)).await.unwrap();

        let task = tokio::spawn({
            let hub = hub.clone();
            let id = rental.id.clone();
            async move { hub.extend(&Caller::operator("ops"), &id, ChronoDuration::hours(3)).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(hub.overlay.is_pending(&rental.id));
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(hub.overlay.pending_for(&rental.id).is_empty());
        assert_eq!(provider.extend_calls(), 1);
        let stored = hub.registry.get(&rental.id).await.unwrap();
        let drift = stored.expires_at - (rental.expires_at + ChronoDuration::hours(3));
        assert!(drift.num_milliseconds().abs() <= 1);
    }

    #[tokio::test]
    async fn test_booking_rent_keeps_both_identifiers() {
        let app = Router::new()
            .route(
                "/api/orders",
                post(|| async {
                    Json(json!({
                        "success": true,
                        "order_id": 9001,
                        "booking_id": "bk_55",
                        "phone": "+447700900123",
                        "expires": Utc::now().timestamp() + 3600
                    }))
                }),
            )
            .route(
                "/api/bookings/{booking_id}/sms",
                get(|Path(booking_id): Path<String>| async move {
                    let sms: Vec<Value> = if booking_id == "bk_55" {
                        vec![json!({"sender": "Google", "message": "G-482913 is your code", "received": 1714554000})]
                    } else {
                        vec![]
                    };
                    Json(json!({"success": true, "sms": sms}))
                }),
            );
        let base_url = serve(app).await;

        let config = SmsHubConfig::builder()
            .provider(ProviderConfig::Booking(BookingConfig {
                base_url,
                api_key: "test-key".into(),
            }))
            .build()
            .unwrap();
        let hub = SmsHub::initialize(config).await.unwrap();
        let ops = Caller::operator("ops");

        let rental = hub
            .rent(
                &ops,
                RentRequest {
                    provider: ProviderKind::Booking,
                    service: "google".into(),
                    country: "GB".into(),
                    duration: ChronoDuration::hours(1),
                    mode: None,
                },
            )
            .await
            .unwrap();

        let by_order = hub.registry.find_by_native_id(ProviderKind::Booking, "9001").await.unwrap();
        let by_booking = hub.registry.find_by_native_id(ProviderKind::Booking, "bk_55").await.unwrap();
        assert_eq!(by_order.map(|r| r.id), Some(rental.id.clone()));
        assert_eq!(by_booking.map(|r| r.id), Some(rental.id.clone()));

        let outcome = hub.sync(&ops, &rental.id).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.new_messages_count, 1);
    }

    #[tokio::test]
    async fn test_members_only_touch_their_own_rentals() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = SmsHub::builder()
            .adapter(provider)
            .access_gate(Arc::new(AssigneeGate::new()))
            .build()
            .await
            .unwrap();

        let alice = Caller::member("alice");
        let bob = Caller::member("bob");
        let rental = hub.rent(&alice, rest_request(24)).await.unwrap();
        assert_eq!(rental.assignee.as_deref(), Some("alice"));

        assert!(matches!(hub.cancel(&bob, &rental.id).await, Err(SmsHubError::Forbidden(_))));
        assert!(matches!(
            hub.inject_test_message(&alice, &rental.id, "Test", "hello").await,
            Err(SmsHubError::Forbidden(_))
        ));

        let bobs = hub.list_rentals(&bob, false).await.unwrap();
        assert_eq!(bobs.payload.map(|list| list.len()), Some(0));
        let alices = hub.list_rentals(&alice, false).await.unwrap();
        assert_eq!(alices.payload.map(|list| list.len()), Some(1));

        let taken = hub.assign(&Caller::operator("ops"), &rental.id, Some("bob".into()), false).await;
        assert!(matches!(taken, Err(SmsHubError::AlreadyAssigned { .. })));
    }

    #[tokio::test]
    async fn test_manual_number_lifecycle() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Inbox).with_required_ids(&[NativeIdKind::Manual]));
        let hub = hub_with(provider).await;
        let ops = Caller::operator("ops");
        let registration = ManualRegistration {
            phone_number: "+44 7700 900456".into(),
            provider: ProviderKind::Inbox,
            native_id: None,
            service: None,
            country: Some("GB".into()),
            duration: ChronoDuration::days(30),
        };

        let first = hub.register_manual(&ops, registration.clone()).await.unwrap();
        let second = hub.register_manual(&ops, registration).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.native_ids.get(NativeIdKind::Manual), Some("447700900456"));

        let listed = hub.list_rentals(&ops, false).await.unwrap();
        assert_eq!(listed.payload.map(|l| l.len()), Some(1));

        let injected = hub.inject_test_message(&ops, &first.id, "Tester", "manual check").await.unwrap();
        assert!(injected.inserted);
        settle().await;
        assert_eq!(hub.unseen_count(&ops, &first.id).await.unwrap(), 1);
        hub.mark_viewed(&ops, &first.id).await.unwrap();
        assert_eq!(hub.unseen_count(&ops, &first.id).await.unwrap(), 0);

        assert!(matches!(hub.remove(&ops, &first.id).await.unwrap(), RemoveOutcome::Deleted));
        assert!(matches!(hub.remove(&ops, &first.id).await.unwrap(), RemoveOutcome::AlreadyGone));
        assert_eq!(hub.store.count(&first.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rental_list_is_cached_until_changed() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider).await;
        let ops = Caller::operator("ops");

        let empty = hub.list_rentals(&ops, false).await.unwrap();
        assert!(empty.loaded);
        let cached = hub.list_rentals(&ops, false).await.unwrap();
        assert!(!cached.loaded);
        assert_eq!(cached.freshness, Freshness::Fresh);

        hub.rent(&ops, rest_request(24)).await.unwrap();
        let refreshed = hub.list_rentals(&ops, false).await.unwrap();
        assert!(refreshed.loaded);
        assert_eq!(refreshed.payload.map(|l| l.len()), Some(1));
    }

    #[tokio::test]
    async fn test_view_carries_sync_failure_without_losing_messages() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider.clone()).await;
        let ops = Caller::operator("ops");
        let rental = hub.rent(&ops, rest_request(24)).await.unwrap();

        provider.push_message("Bank", "OTP 774411", Utc::now());
        hub.sync(&ops, &rental.id).await.unwrap();

        provider.fail_next_fetch(SmsHubError::ProviderRejected {
            provider: ProviderKind::Rest,
            message: "Rental not found".into(),
        });
        let view = hub.rental_status(&ops, &rental.id, true).await.unwrap();
        assert!(!view.sync.success);
        assert_eq!(view.sync.error.as_ref().map(|e| e.message.contains("Rental not found")), Some(true));
        assert_eq!(view.messages.len(), 1);
        assert!(view.pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_long_hide_refreshes_subscriptions() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider.clone()).await;
        let ops = Caller::operator("ops");
        hub.rent(&ops, rest_request(24)).await.unwrap();
        hub.start().await.unwrap();
        assert!(matches!(hub.start().await, Err(SmsHubError::InvalidOperation(_))));

        let visibility = hub.visibility_sender();
        visibility.send(Visibility::Hidden).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        visibility.send(Visibility::Visible).unwrap();
        settle().await;

        assert_eq!(provider.fetch_calls(), 1);
        hub.shutdown().await.unwrap();
        assert!(hub.is_shutting_down());
        assert!(matches!(
            hub.rent(&ops, rest_request(1)).await,
            Err(SmsHubError::ShuttingDown(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_refresh_respects_sync_cooling() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let config = SmsHubConfig::builder()
            .cache(CacheConfig {
                sync: CachePolicy::new(30, 120),
                ..CacheConfig::default()
            })
            .build()
            .unwrap();
        let hub = SmsHub::builder().config(config).adapter(provider.clone()).build().await.unwrap();
        let ops = Caller::operator("ops");
        let rental = hub.rent(&ops, rest_request(24)).await.unwrap();
        hub.sync(&ops, &rental.id).await.unwrap();
        assert_eq!(provider.fetch_calls(), 1);
        hub.start().await.unwrap();

        let visibility = hub.visibility_sender();
        visibility.send(Visibility::Hidden).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        visibility.send(Visibility::Visible).unwrap();
        settle().await;
        // 上次同步还在冷却期内
        assert_eq!(provider.fetch_calls(), 1);

        visibility.send(Visibility::Hidden).unwrap();
        settle().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        visibility.send(Visibility::Visible).unwrap();
        settle().await;
        assert_eq!(provider.fetch_calls(), 2);

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweeper_expires_due_rentals() {
        let provider = Arc::new(ScriptedProvider::new(ProviderKind::Rest));
        let hub = hub_with(provider).await;
        let now = Utc::now();
        let rental = hub
            .registry
            .create_rental(NewRental {
                phone_number: "+4915100000088".into(),
                provider: ProviderKind::Rest,
                native_ids: NativeIds::single(NativeIdKind::Order, "ord-88"),
                service_code: "uber".into(),
                country_code: "DE".into(),
                leased_at: now - ChronoDuration::hours(3),
                expires_at: now - ChronoDuration::minutes(1),
                assignee: None,
                access_credentials: None,
                manual: false,
            })
            .await
            .unwrap();
        let mut events = hub.subscribe_events();

        assert_eq!(hub.sweep_expired().await.unwrap(), vec![rental.id.clone()]);
        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type(), "rental_status_changed");
        assert!(hub.sweep_expired().await.unwrap().is_empty());
    }
}
