//! 同步编排器
//!
//! 每次同步都在独立的 tokio 任务里执行：调用方中途放弃等待，
//! 拉取仍然会完成并写入存储，丢掉的只是结果通知。
//! 同一租用的并发请求共享同一个进行中的 future。

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SmsHubError};
use crate::events::{now_millis, EventManager, HubEvent};
use crate::provider::{ProviderHub, RawMessage};
use crate::storage::entities::Rental;
use crate::storage::{MessageStore, RentalRegistry};
use crate::sync::{RetryPolicy, SyncOutcome, SyncTrigger};

type InFlight = Shared<BoxFuture<'static, SyncOutcome>>;

#[derive(Clone)]
pub struct SyncOrchestrator {
    providers: ProviderHub,
    registry: RentalRegistry,
    store: MessageStore,
    events: EventManager,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    /// 进行中的同步（每个租用最多一个）
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
}

impl SyncOrchestrator {
    pub fn new(
        providers: ProviderHub,
        registry: RentalRegistry,
        store: MessageStore,
        events: EventManager,
        retry: RetryPolicy,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            providers,
            registry,
            store,
            events,
            retry,
            attempt_timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// 同步一个租用
    ///
    /// 预期内的失败都体现在 [`SyncOutcome`] 里，不会返回 `Err`。
    pub async fn sync(&self, rental_id: &str, trigger: SyncTrigger) -> SyncOutcome {
        if !trigger.calls_provider() {
            debug!("本地读穿，不调用供应商: rental_id={}", rental_id);
            return SyncOutcome::succeeded(rental_id, trigger, 0, 0);
        }

        let shared = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(rental_id) {
                Some(existing) => {
                    debug!("🔗 合并到进行中的同步: rental_id={}", rental_id);
                    existing.clone()
                }
                None => {
                    let shared = self.spawn_sync(rental_id.to_string(), trigger);
                    in_flight.insert(rental_id.to_string(), shared.clone());
                    shared
                }
            }
        };

        shared.await
    }

    /// 当前正在同步的租用数
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    fn spawn_sync(&self, rental_id: String, trigger: SyncTrigger) -> InFlight {
        let this = self.clone();
        let task_id = rental_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = this.run(&task_id, trigger).await;
            this.in_flight.lock().remove(&task_id);
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("❌ 同步任务异常退出: rental_id={}, error={}", rental_id, e);
                    let err = SmsHubError::InvalidOperation(format!("sync task failed: {}", e));
                    SyncOutcome::failed(&rental_id, trigger, &err, 0)
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn run(&self, rental_id: &str, trigger: SyncTrigger) -> SyncOutcome {
        let rental = match self.registry.get(rental_id).await {
            Ok(rental) => rental,
            Err(e) => return SyncOutcome::failed(rental_id, trigger, &e, 0),
        };

        // 租约已结束，供应商那边没有东西可拉了，只返回本地数据
        if rental.status.is_terminal() {
            debug!("租用已是终态，跳过供应商拉取: rental_id={}, status={}", rental_id, rental.status);
            return SyncOutcome::succeeded(rental_id, trigger, 0, 0);
        }

        info!(
            "🔄 开始同步: rental_id={}, provider={}, channel={:?}, trigger={:?}",
            rental.id,
            rental.provider,
            rental.provider.fetch_channel(),
            trigger
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_once(&rental).await {
                Ok(batch) => return self.ingest(&rental, trigger, &batch, attempt).await,
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "⚠️ 同步失败，{}ms 后重试 ({}/{}): rental_id={}, error={}",
                        delay.as_millis(),
                        attempt,
                        self.retry.max_attempts,
                        rental.id,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if let SmsHubError::ParseFailure { snippet, .. } = &e {
                        warn!("⚠️ 供应商响应无法解析: rental_id={}, snippet={}", rental.id, snippet);
                    } else {
                        error!("❌ 同步失败: rental_id={}, attempts={}, error={}", rental.id, attempt, e);
                    }
                    self.emit_failure(&rental.id, &e).await;
                    return SyncOutcome::failed(&rental.id, trigger, &e, attempt);
                }
            }
        }
    }

    async fn fetch_once(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        let adapter = self.providers.get(rental.provider)?;
        match tokio::time::timeout(self.attempt_timeout, adapter.fetch_messages(rental)).await {
            Ok(result) => result,
            Err(_) => Err(SmsHubError::ProviderUnavailable {
                provider: rental.provider,
                reason: format!("拉取超时 ({}s)", self.attempt_timeout.as_secs()),
            }),
        }
    }

    async fn ingest(
        &self,
        rental: &Rental,
        trigger: SyncTrigger,
        batch: &[RawMessage],
        attempts: u32,
    ) -> SyncOutcome {
        match self.store.upsert_batch(&rental.id, batch).await {
            Ok(inserted) => {
                if inserted > 0 {
                    info!("📩 同步到 {} 条新短信: rental_id={}", inserted, rental.id);
                    self.events
                        .emit(HubEvent::MessagesChanged {
                            rental_id: rental.id.clone(),
                            new_messages: inserted,
                            timestamp: now_millis(),
                        })
                        .await;
                } else {
                    debug!("同步完成，没有新短信: rental_id={}", rental.id);
                }
                SyncOutcome::succeeded(&rental.id, trigger, inserted, attempts)
            }
            Err(e) => {
                error!("❌ 短信入库失败: rental_id={}, error={}", rental.id, e);
                self.emit_failure(&rental.id, &e).await;
                SyncOutcome::failed(&rental.id, trigger, &e, attempts)
            }
        }
    }

    async fn emit_failure(&self, rental_id: &str, error: &SmsHubError) {
        self.events
            .emit(HubEvent::SyncFailed {
                rental_id: rental_id.to_string(),
                kind: error.kind(),
                message: error.to_string(),
                retryable: error.is_retryable(),
                timestamp: now_millis(),
            })
            .await;
    }
}
