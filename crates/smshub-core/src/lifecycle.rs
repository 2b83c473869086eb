//! 生命周期管理
//!
//! 宿主的可见性（前台 / 后台）作为注入的事件源，由 [`LifecycleManager`]
//! 统一分发给各模块的 Hook。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::Result;

/// 宿主可见性
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Hidden,
    Visible,
}

/// 生命周期回调 Hook
///
/// 各模块通过实现此 trait 来响应可见性变化
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// 宿主被隐藏时调用
    async fn on_background(&self) -> Result<()>;

    /// 宿主重新可见时调用
    async fn on_foreground(&self) -> Result<()>;
}

/// 生命周期管理器
pub struct LifecycleManager {
    hooks: Vec<Arc<dyn LifecycleHook>>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register_hook(&mut self, hook: Arc<dyn LifecycleHook>) {
        self.hooks.push(hook);
        info!("✅ 生命周期 Hook 已注册: 当前共 {} 个", self.hooks.len());
    }

    /// 按可见性分发
    pub async fn notify(&self, visibility: Visibility) -> Result<()> {
        match visibility {
            Visibility::Hidden => self.notify_background().await,
            Visibility::Visible => self.notify_foreground().await,
        }
    }

    /// 通知所有 Hook：宿主切换到后台
    ///
    /// 按注册顺序执行，某个 Hook 失败只记录，继续执行其他 Hook，最后返回第一个错误
    pub async fn notify_background(&self) -> Result<()> {
        info!("🔄 通知所有模块：切换到后台");

        let mut first_error = None;
        let mut failed = 0;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_background().await {
                warn!("⚠️ Hook #{} 后台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个模块后台切换失败，但所有模块都已尝试执行", failed);
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// 通知所有 Hook：宿主切换到前台
    pub async fn notify_foreground(&self) -> Result<()> {
        info!("🔄 通知所有模块：切换到前台");

        let mut first_error = None;
        let mut failed = 0;
        for (index, hook) in self.hooks.iter().enumerate() {
            if let Err(e) = hook.on_foreground().await {
                warn!("⚠️ Hook #{} 前台切换失败: {}", index, e);
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!("⚠️ {} 个模块前台切换失败，但所有模块都已尝试执行", failed);
                Err(e)
            }
            None => Ok(()),
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}
