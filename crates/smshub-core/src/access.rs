//! 访问控制
//!
//! 身份由外部系统提供，这里只当作不透明的“当前调用方”；
//! 授权判断通过 [`AccessGate`] 注入。

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{Result, SmsHubError};
use crate::storage::entities::Rental;

/// 调用方角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Operator,
    Member,
}

/// 当前调用方
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: CallerRole,
}

impl Caller {
    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Operator,
        }
    }

    pub fn member(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: CallerRole::Member,
        }
    }

    pub fn is_operator(&self) -> bool {
        self.role == CallerRole::Operator
    }
}

/// 授权判断
///
/// `rental` 为 `None` 表示不针对具体租用的操作（租号、列表）。
pub trait AccessGate: Send + Sync {
    fn may_operate(&self, caller: &Caller, rental: Option<&Rental>) -> bool;

    /// 列表时是否只能看到分配给自己的租用
    fn sees_only_own(&self, caller: &Caller) -> bool {
        let _ = caller;
        false
    }
}

/// 不做任何限制
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllGate;

impl AccessGate for AllowAllGate {
    fn may_operate(&self, _caller: &Caller, _rental: Option<&Rental>) -> bool {
        true
    }
}

/// 运营可以操作所有租用；其他人只能操作分配给自己的租用
#[derive(Debug, Clone, Default)]
pub struct AssigneeGate {
    /// 额外视为运营的调用方 id
    operators: HashSet<String>,
}

impl AssigneeGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operators<I, S>(operators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operators: operators.into_iter().map(Into::into).collect(),
        }
    }

    fn is_operator(&self, caller: &Caller) -> bool {
        caller.is_operator() || self.operators.contains(&caller.id)
    }
}

impl AccessGate for AssigneeGate {
    fn may_operate(&self, caller: &Caller, rental: Option<&Rental>) -> bool {
        if self.is_operator(caller) {
            return true;
        }
        match rental {
            Some(rental) => rental.assignee.as_deref() == Some(caller.id.as_str()),
            None => true,
        }
    }

    fn sees_only_own(&self, caller: &Caller) -> bool {
        !self.is_operator(caller)
    }
}

/// 检查权限，拒绝时返回 `Forbidden`
pub fn ensure_allowed(gate: &dyn AccessGate, caller: &Caller, rental: Option<&Rental>) -> Result<()> {
    if gate.may_operate(caller, rental) {
        return Ok(());
    }
    let target = rental.map(|r| r.id.as_str()).unwrap_or("-");
    Err(SmsHubError::Forbidden(format!("caller {} may not operate on rental {}", caller.id, target)))
}
