//! 事件系统模块 - 租用和短信的变更广播
//!
//! 功能包括：
//! - 租用状态 / 到期时间 / 分配变更事件
//! - 新短信入库事件（实时通知器按租用订阅）
//! - 同步失败事件
//! - 事件广播和按条件订阅

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::ErrorKind;
use crate::provider::ProviderKind;
use crate::storage::entities::RentalStatus;

/// SmsHub 事件类型
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubEvent {
    RentalCreated {
        rental_id: String,
        provider: ProviderKind,
        timestamp: u64,
    },
    RentalStatusChanged {
        rental_id: String,
        old_status: RentalStatus,
        new_status: RentalStatus,
        timestamp: u64,
    },
    RentalExtended {
        rental_id: String,
        expires_at: DateTime<Utc>,
        timestamp: u64,
    },
    RentalAssigned {
        rental_id: String,
        assignee: Option<String>,
        timestamp: u64,
    },
    /// 手动号码被物理删除
    RentalRemoved { rental_id: String, timestamp: u64 },
    /// 有新短信入库
    MessagesChanged {
        rental_id: String,
        new_messages: usize,
        timestamp: u64,
    },
    SyncFailed {
        rental_id: String,
        kind: ErrorKind,
        message: String,
        retryable: bool,
        timestamp: u64,
    },
}

impl HubEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            HubEvent::RentalCreated { .. } => "rental_created",
            HubEvent::RentalStatusChanged { .. } => "rental_status_changed",
            HubEvent::RentalExtended { .. } => "rental_extended",
            HubEvent::RentalAssigned { .. } => "rental_assigned",
            HubEvent::RentalRemoved { .. } => "rental_removed",
            HubEvent::MessagesChanged { .. } => "messages_changed",
            HubEvent::SyncFailed { .. } => "sync_failed",
        }
    }

    pub fn rental_id(&self) -> &str {
        match self {
            HubEvent::RentalCreated { rental_id, .. }
            | HubEvent::RentalStatusChanged { rental_id, .. }
            | HubEvent::RentalExtended { rental_id, .. }
            | HubEvent::RentalAssigned { rental_id, .. }
            | HubEvent::RentalRemoved { rental_id, .. }
            | HubEvent::MessagesChanged { rental_id, .. }
            | HubEvent::SyncFailed { rental_id, .. } => rental_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            HubEvent::RentalCreated { timestamp, .. }
            | HubEvent::RentalStatusChanged { timestamp, .. }
            | HubEvent::RentalExtended { timestamp, .. }
            | HubEvent::RentalAssigned { timestamp, .. }
            | HubEvent::RentalRemoved { timestamp, .. }
            | HubEvent::MessagesChanged { timestamp, .. }
            | HubEvent::SyncFailed { timestamp, .. } => *timestamp,
        }
    }

    /// 会让某个租用的视图内容发生变化的事件
    pub fn is_change_notification(&self) -> bool {
        !matches!(self, HubEvent::SyncFailed { .. })
    }
}

/// 当前毫秒时间戳
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub rental_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_rental_ids(mut self, rental_ids: Vec<String>) -> Self {
        self.rental_ids = Some(rental_ids);
        self
    }

    pub fn matches(&self, event: &HubEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }
        if let Some(ids) = &self.rental_ids {
            if !ids.iter().any(|id| id == event.rental_id()) {
                return false;
            }
        }
        true
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub last_event_time: Option<u64>,
}

/// 事件管理器
#[derive(Clone)]
pub struct EventManager {
    sender: broadcast::Sender<HubEvent>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: HubEvent) {
        debug!("Emitting event: {} ({})", event.event_type(), event.rental_id());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定条件的事件
    ///
    /// 同步完成订阅，返回之后发布的事件一定收得到。
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<HubEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<HubEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<HubEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<HubEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changed(rental_id: &str) -> HubEvent {
        HubEvent::MessagesChanged {
            rental_id: rental_id.to_string(),
            new_messages: 1,
            timestamp: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let events = EventManager::new(16);
        let mut only_r1 = events.subscribe_filtered(EventFilter::new().with_rental_ids(vec!["r1".into()]));

        events.emit(changed("r2")).await;
        events.emit(changed("r1")).await;

        let received = only_r1.recv().await.unwrap();
        assert_eq!(received.rental_id(), "r1");
        assert!(only_r1.try_recv().is_err());

        let mut failures_only = events.subscribe_filtered(EventFilter::new().with_event_types(vec!["sync_failed".into()]));
        events.emit(changed("r1")).await;
        assert!(failures_only.try_recv().is_err());

        let stats = events.get_stats().await;
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type.get("messages_changed"), Some(&3));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(changed("r9")).unwrap();
        assert_eq!(json["type"], "messages_changed");
        assert_eq!(json["rental_id"], "r9");
    }
}
