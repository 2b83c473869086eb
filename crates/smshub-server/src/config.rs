//! 服务端配置
//!
//! TOML 文件里 `[hub]` 段就是 [`SmsHubConfig`]，其余是 HTTP 层自己的设置。

use anyhow::Context;
use serde::{Deserialize, Serialize};
use smshub_core::SmsHubConfig;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 监听地址
    pub bind: String,
    /// 默认日志级别（`RUST_LOG` 优先）
    pub log_level: String,
    /// 视为运营的调用方 id（不看 `x-caller-role` 也能操作所有租用）
    pub operators: Vec<String>,
    pub hub: SmsHubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            log_level: "info".to_string(),
            operators: Vec::new(),
            hub: SmsHubConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: ServerConfig = toml::from_str(raw)?;
        config.hub.validate()?;
        Ok(config)
    }
}
