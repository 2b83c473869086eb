//! CORS 中继链
//!
//! 按配置顺序逐个尝试，前面的失败不算错；全部失败才是 `RelayExhausted`。

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{RelayConfig, RelayFormat};
use crate::error::{Result, SmsHubError};
use crate::provider::http::decode_json;
use crate::provider::{ProviderHttpClient, ProviderKind};

const KIND: ProviderKind = ProviderKind::Inbox;
const URL_PLACEHOLDER: &str = "{url}";

#[derive(Debug, Deserialize)]
struct JsonContents {
    contents: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayChain {
    client: ProviderHttpClient,
    relays: Vec<RelayConfig>,
}

impl RelayChain {
    pub fn new(client: ProviderHttpClient, relays: Vec<RelayConfig>) -> Result<Self> {
        if relays.is_empty() {
            return Err(SmsHubError::Config("中继列表不能为空".to_string()));
        }
        Ok(Self { client, relays })
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// 依次通过每个中继抓取目标页面，返回第一个成功的页面 HTML
    pub async fn fetch(&self, target: &str) -> Result<String> {
        let mut last_error = String::new();

        for (index, relay) in self.relays.iter().enumerate() {
            match self.fetch_via(relay, target).await {
                Ok(html) => {
                    if index > 0 {
                        info!("🔁 第 {} 个中继抓取成功: {}", index + 1, relay.url);
                    } else {
                        debug!("中继抓取成功: {}", relay.url);
                    }
                    return Ok(html);
                }
                Err(e) => {
                    warn!("⚠️ 中继 {}/{} 失败 ({}): {}", index + 1, self.relays.len(), relay.url, e);
                    last_error = e.to_string();
                }
            }
        }

        Err(SmsHubError::RelayExhausted {
            attempts: self.relays.len(),
            last_error,
        })
    }

    async fn fetch_via(&self, relay: &RelayConfig, target: &str) -> Result<String> {
        let url = relay_url(relay, target);
        let body = self.client.send_text(KIND, self.client.get(&url)).await?;

        let html = match relay.format {
            RelayFormat::Raw => body,
            RelayFormat::JsonContents => {
                let wrapper: JsonContents = decode_json(KIND, &body)?;
                wrapper.contents.unwrap_or_default()
            }
        };

        if html.trim().is_empty() {
            return Err(SmsHubError::ProviderUnavailable {
                provider: KIND,
                reason: format!("中继 {} 返回了空页面", relay.url),
            });
        }
        Ok(html)
    }
}

/// 有 `{url}` 占位符就替换成编码后的目标地址，否则直接拼接
pub fn relay_url(relay: &RelayConfig, target: &str) -> String {
    if relay.url.contains(URL_PLACEHOLDER) {
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        relay.url.replace(URL_PLACEHOLDER, &encoded)
    } else {
        format!("{}{}", relay.url, target)
    }
}
