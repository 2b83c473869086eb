//! 实时通知器
//!
//! 每个租用最多一个订阅（基于事件总线的过滤订阅）。收到变更通知时：
//! - 该租用的未读计数加一
//! - 调用存储变更 Hook（本地读穿，不访问供应商）
//!
//! 可见性由外部注入：隐藏超过阈值后重新可见，重建所有订阅并补一次刷新。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{EventFilter, EventManager};
use crate::lifecycle::{LifecycleHook, Visibility};

/// 通知器回调
#[async_trait]
pub trait RealtimeHooks: Send + Sync {
    /// 某个租用的数据有变化
    async fn on_change(&self, rental_id: &str);

    /// 长时间隐藏后恢复，对所有订阅中的租用补一次刷新
    async fn on_resumed(&self, rental_ids: Vec<String>);
}

struct Subscription {
    token: CancellationToken,
}

#[derive(Default)]
struct NotifierState {
    subscriptions: HashMap<String, Subscription>,
    unseen: HashMap<String, usize>,
    hidden_since: Option<Instant>,
    resubscribes: u64,
}

#[derive(Clone)]
pub struct RealtimeNotifier {
    events: EventManager,
    hooks: Arc<dyn RealtimeHooks>,
    hidden_threshold: Duration,
    state: Arc<Mutex<NotifierState>>,
    shutdown: CancellationToken,
}

impl RealtimeNotifier {
    pub fn new(events: EventManager, hooks: Arc<dyn RealtimeHooks>, hidden_threshold: Duration) -> Self {
        Self {
            events,
            hooks,
            hidden_threshold,
            state: Arc::new(Mutex::new(NotifierState::default())),
            shutdown: CancellationToken::new(),
        }
    }

    /// 订阅一个租用，已订阅时什么都不做，返回 false
    pub fn subscribe(&self, rental_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.subscriptions.contains_key(rental_id) {
            return false;
        }
        let subscription = self.open(rental_id);
        state.subscriptions.insert(rental_id.to_string(), subscription);
        state.unseen.entry(rental_id.to_string()).or_insert(0);
        debug!("📡 已订阅租用: rental_id={}", rental_id);
        true
    }

    pub fn unsubscribe(&self, rental_id: &str) -> bool {
        let mut state = self.state.lock();
        state.unseen.remove(rental_id);
        match state.subscriptions.remove(rental_id) {
            Some(subscription) => {
                subscription.token.cancel();
                debug!("📴 已取消订阅: rental_id={}", rental_id);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, rental_id: &str) -> bool {
        self.state.lock().subscriptions.contains_key(rental_id)
    }

    pub fn unseen_count(&self, rental_id: &str) -> usize {
        self.state.lock().unseen.get(rental_id).copied().unwrap_or(0)
    }

    pub fn mark_viewed(&self, rental_id: &str) {
        if let Some(count) = self.state.lock().unseen.get_mut(rental_id) {
            *count = 0;
        }
    }

    /// 重建订阅的次数（每次恢复计一次）
    pub fn resubscribe_count(&self) -> u64 {
        self.state.lock().resubscribes
    }

    pub fn set_hidden(&self) {
        let mut state = self.state.lock();
        if state.hidden_since.is_none() {
            state.hidden_since = Some(Instant::now());
        }
    }

    /// 重新可见；隐藏时长超过阈值时重建订阅并刷新，返回是否做了恢复
    pub async fn set_visible(&self) -> bool {
        let ids = {
            let mut state = self.state.lock();
            let hidden_for = match state.hidden_since.take() {
                Some(since) => since.elapsed(),
                None => return false,
            };
            if hidden_for <= self.hidden_threshold {
                debug!("隐藏 {}s，未超过阈值，不做恢复", hidden_for.as_secs());
                return false;
            }

            info!("🔄 隐藏 {}s 后恢复，重建 {} 个订阅", hidden_for.as_secs(), state.subscriptions.len());
            let ids: Vec<String> = state.subscriptions.keys().cloned().collect();
            for id in &ids {
                let fresh = self.open(id);
                if let Some(old) = state.subscriptions.insert(id.clone(), fresh) {
                    old.token.cancel();
                }
            }
            state.resubscribes += 1;
            ids
        };

        if !ids.is_empty() {
            self.hooks.on_resumed(ids).await;
        }
        true
    }

    /// 停止所有订阅
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let mut state = self.state.lock();
        for (_, subscription) in state.subscriptions.drain() {
            subscription.token.cancel();
        }
        info!("✅ 实时通知器已停止");
    }

    /// 同步完成订阅后再派生监听任务，返回之后发布的事件一定收得到
    fn open(&self, rental_id: &str) -> Subscription {
        let mut receiver = self
            .events
            .subscribe_filtered(EventFilter::new().with_rental_ids(vec![rental_id.to_string()]));
        let token = self.shutdown.child_token();
        let task_token = token.clone();
        let state = self.state.clone();
        let hooks = self.hooks.clone();
        let rental_id = rental_id.to_string();

        tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    _ = task_token.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => event.is_change_notification(),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("⚠️ 订阅落后 {} 条事件，按一次变更处理: rental_id={}", skipped, rental_id);
                            true
                        }
                        Err(RecvError::Closed) => break,
                    },
                };
                if !changed {
                    continue;
                }

                if let Some(count) = state.lock().unseen.get_mut(&rental_id) {
                    *count += 1;
                }
                hooks.on_change(&rental_id).await;
            }
            debug!("订阅任务退出: rental_id={}", rental_id);
        });

        Subscription { token }
    }
}

#[async_trait]
impl LifecycleHook for RealtimeNotifier {
    async fn on_background(&self) -> Result<()> {
        self.set_hidden();
        Ok(())
    }

    async fn on_foreground(&self) -> Result<()> {
        self.set_visible().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{now_millis, HubEvent};

    #[derive(Default)]
    struct RecordingHooks {
        changes: Mutex<Vec<String>>,
        resumed: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl RealtimeHooks for RecordingHooks {
        async fn on_change(&self, rental_id: &str) {
            self.changes.lock().push(rental_id.to_string());
        }

        async fn on_resumed(&self, rental_ids: Vec<String>) {
            self.resumed.lock().push(rental_ids);
        }
    }

    fn messages_changed(rental_id: &str) -> HubEvent {
        HubEvent::MessagesChanged {
            rental_id: rental_id.to_string(),
            new_messages: 1,
            timestamp: now_millis(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_subscribe_twice_is_noop_and_counts_unseen() {
        let events = EventManager::new(16);
        let hooks = Arc::new(RecordingHooks::default());
        let notifier = RealtimeNotifier::new(events.clone(), hooks.clone(), Duration::from_secs(60));

        assert!(notifier.subscribe("r1"));
        assert!(!notifier.subscribe("r1"));
        assert_eq!(events.subscriber_count(), 1);

        events.emit(messages_changed("r1")).await;
        events.emit(messages_changed("r2")).await;
        events.emit(messages_changed("r1")).await;
        settle().await;

        assert_eq!(notifier.unseen_count("r1"), 2);
        assert_eq!(hooks.changes.lock().len(), 2);

        notifier.mark_viewed("r1");
        assert_eq!(notifier.unseen_count("r1"), 0);
    }

    #[tokio::test]
    async fn test_sync_failure_is_not_a_change() {
        let events = EventManager::new(16);
        let hooks = Arc::new(RecordingHooks::default());
        let notifier = RealtimeNotifier::new(events.clone(), hooks.clone(), Duration::from_secs(60));
        notifier.subscribe("r1");

        events
            .emit(HubEvent::SyncFailed {
                rental_id: "r1".into(),
                kind: crate::error::ErrorKind::RelayExhausted,
                message: "all relays failed".into(),
                retryable: true,
                timestamp: now_millis(),
            })
            .await;
        settle().await;

        assert_eq!(notifier.unseen_count("r1"), 0);
        assert!(hooks.changes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_hide_resubscribes_and_refreshes_once() {
        let events = EventManager::new(16);
        let hooks = Arc::new(RecordingHooks::default());
        let notifier = RealtimeNotifier::new(events.clone(), hooks.clone(), Duration::from_secs(60));
        notifier.subscribe("r1");
        notifier.subscribe("r2");

        notifier.on_background().await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        notifier.on_foreground().await.unwrap();
        assert!(hooks.resumed.lock().is_empty());

        notifier.on_background().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        notifier.on_foreground().await.unwrap();

        let resumed = hooks.resumed.lock().clone();
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].len(), 2);
        assert_eq!(notifier.resubscribe_count(), 1);

        // 重建后的订阅仍然有效
        settle().await;
        events.emit(messages_changed("r2")).await;
        settle().await;
        assert_eq!(notifier.unseen_count("r2"), 1);
        assert_eq!(events.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_listeners() {
        let events = EventManager::new(16);
        let hooks = Arc::new(RecordingHooks::default());
        let notifier = RealtimeNotifier::new(events.clone(), hooks, Duration::from_secs(60));
        notifier.subscribe("r1");

        notifier.shutdown();
        settle().await;
        assert_eq!(events.subscriber_count(), 0);
        assert!(!notifier.is_subscribed("r1"));
    }
}
