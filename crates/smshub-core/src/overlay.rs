//! 待确认变更覆盖层
//!
//! 续期 / 取消 / 分配在等待供应商和本地登记表确认期间，作为显式的 pending
//! 记录挂在租用上，和已确认状态分开返回。确认或回滚后移除。
//!
//! 变更流程持有 [`PendingGuard`]：没确认就被丢弃（出错提前返回、任务被取消）时自动回滚。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 变更类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingKind {
    Extend { hours: i64 },
    Cancel,
    Assign { assignee: Option<String> },
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Extend { .. } => "extend",
            PendingKind::Cancel => "cancel",
            PendingKind::Assign { .. } => "assign",
        }
    }
}

/// 一条进行中的变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub ticket: u64,
    pub rental_id: String,
    #[serde(flatten)]
    pub kind: PendingKind,
    pub started_at: DateTime<Utc>,
}

/// 变更凭据，确认或回滚时交回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTicket {
    id: u64,
}

#[derive(Clone, Default)]
pub struct PendingOverlay {
    entries: Arc<Mutex<HashMap<String, Vec<PendingChange>>>>,
    next_ticket: Arc<AtomicU64>,
}

impl PendingOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一条待确认变更
    pub fn begin(&self, rental_id: &str, kind: PendingKind) -> PendingTicket {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("⏳ 待确认变更: rental_id={}, kind={}, ticket={}", rental_id, kind.as_str(), id);
        self.entries
            .lock()
            .entry(rental_id.to_string())
            .or_default()
            .push(PendingChange {
                ticket: id,
                rental_id: rental_id.to_string(),
                kind,
                started_at: Utc::now(),
            });
        PendingTicket { id }
    }

    /// 变更已落到登记表
    pub fn confirm(&self, ticket: PendingTicket) -> Option<PendingChange> {
        let change = self.take(ticket);
        if let Some(change) = &change {
            debug!("✅ 变更已确认: rental_id={}, ticket={}", change.rental_id, ticket.id);
        }
        change
    }

    /// 变更失败，撤掉 pending 记录（登记表本来就没改）
    pub fn rollback(&self, ticket: PendingTicket) -> Option<PendingChange> {
        let change = self.take(ticket);
        if let Some(change) = &change {
            debug!("↩️ 变更已回滚: rental_id={}, ticket={}", change.rental_id, ticket.id);
        }
        change
    }

    /// 登记一条待确认变更，返回的 guard 没有确认就会在 drop 时回滚
    pub fn guard(&self, rental_id: &str, kind: PendingKind) -> PendingGuard {
        PendingGuard {
            ticket: Some(self.begin(rental_id, kind)),
            overlay: self.clone(),
        }
    }

    pub fn pending_for(&self, rental_id: &str) -> Vec<PendingChange> {
        self.entries.lock().get(rental_id).cloned().unwrap_or_default()
    }

    pub fn is_pending(&self, rental_id: &str) -> bool {
        self.entries.lock().get(rental_id).is_some_and(|list| !list.is_empty())
    }

    fn take(&self, ticket: PendingTicket) -> Option<PendingChange> {
        let mut entries = self.entries.lock();
        let mut found = None;
        entries.retain(|_, list| {
            if let Some(pos) = list.iter().position(|c| c.ticket == ticket.id) {
                found = Some(list.remove(pos));
            }
            !list.is_empty()
        });
        found
    }
}

/// 一条待确认变更的持有者
pub struct PendingGuard {
    overlay: PendingOverlay,
    ticket: Option<PendingTicket>,
}

impl PendingGuard {
    /// 变更已落到登记表
    pub fn confirm(mut self) -> Option<PendingChange> {
        self.ticket.take().and_then(|ticket| self.overlay.confirm(ticket))
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.overlay.rollback(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_is_visible_until_resolved() {
        let overlay = PendingOverlay::new();
        let extend = overlay.begin("r1", PendingKind::Extend { hours: 4 });
        let cancel = overlay.begin("r1", PendingKind::Cancel);

        let pending = overlay.pending_for("r1");
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind, PendingKind::Extend { hours: 4 });
        assert!(overlay.pending_for("r2").is_empty());

        assert!(overlay.confirm(extend).is_some());
        assert!(overlay.confirm(extend).is_none());
        assert_eq!(overlay.rollback(cancel).map(|c| c.kind), Some(PendingKind::Cancel));
        assert!(!overlay.is_pending("r1"));
    }

    #[test]
    fn test_guard_rolls_back_unless_confirmed() {
        let overlay = PendingOverlay::new();

        let abandoned = overlay.guard("r1", PendingKind::Cancel);
        assert!(overlay.is_pending("r1"));
        drop(abandoned);
        assert!(!overlay.is_pending("r1"));

        let confirmed = overlay.guard("r1", PendingKind::Extend { hours: 2 });
        let change = confirmed.confirm().unwrap();
        assert_eq!(change.kind, PendingKind::Extend { hours: 2 });
        assert!(overlay.pending_for("r1").is_empty());
    }

    #[test]
    fn test_pending_serializes_with_kind() {
        let overlay = PendingOverlay::new();
        overlay.begin("r1", PendingKind::Assign { assignee: Some("emp-7".into()) });

        let json = serde_json::to_value(&overlay.pending_for("r1")[0]).unwrap();
        assert_eq!(json["kind"], "assign");
        assert_eq!(json["assignee"], "emp-7");
        assert_eq!(json["rentalId"], "r1");
    }
}
