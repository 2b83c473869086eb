//! 供应商 HTTP 客户端
//!
//! 所有适配器共用一个 reqwest 客户端，超时和状态码到错误分类的映射统一在这里做：
//! - 传输失败 / 超时 / 5xx / 429 → `ProviderUnavailable`
//! - 其它 4xx → `ProviderRejected`，原样带上供应商文案
//! - 响应体解不开 → `ParseFailure`

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::HttpClientConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::ProviderKind;

#[derive(Debug, Clone)]
pub struct ProviderHttpClient {
    client: Client,
}

impl ProviderHttpClient {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(config.user_agent.clone());

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| SmsHubError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!(
            "✅ 供应商 HTTP 客户端已创建 (timeout: {}s)",
            config.request_timeout_secs
        );

        Ok(Self { client })
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.client.delete(url)
    }

    /// 发送请求并返回成功响应的文本
    pub async fn send_text(&self, provider: ProviderKind, request: RequestBuilder) -> Result<String> {
        let response = request.send().await.map_err(|e| transport_error(provider, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| transport_error(provider, e))?;

        if status.is_success() {
            debug!("⬅️ {} 响应 {} ({} bytes)", provider, status, body.len());
            return Ok(body);
        }

        Err(status_error(provider, status, &body))
    }
}

/// 解 JSON，失败时带上原始片段
pub fn decode_json<T: DeserializeOwned>(provider: ProviderKind, body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        let err = SmsHubError::parse_failure(provider, format!("响应不是预期的 JSON: {}", e), body);
        warn!("⚠️ {}", err);
        err
    })
}

fn transport_error(provider: ProviderKind, error: reqwest::Error) -> SmsHubError {
    let reason = if error.is_timeout() {
        format!("请求超时: {}", error)
    } else if error.is_connect() {
        format!("连接失败: {}", error)
    } else {
        format!("传输失败: {}", error)
    };
    warn!("⚠️ {} 不可用: {}", provider, reason);
    SmsHubError::ProviderUnavailable { provider, reason }
}

/// 非 2xx 状态码到错误分类的映射
pub fn status_error(provider: ProviderKind, status: StatusCode, body: &str) -> SmsHubError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        warn!("⚠️ {} 返回 {}", provider, status);
        return SmsHubError::ProviderUnavailable {
            provider,
            reason: format!("HTTP {}", status),
        };
    }

    let message = provider_message(body).unwrap_or_else(|| format!("HTTP {}", status));
    warn!("🚫 {} 拒绝请求 ({}): {}", provider, status, message);
    SmsHubError::ProviderRejected { provider, message }
}

/// 从错误响应里取出供应商给用户看的文案
pub fn provider_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        for key in ["message", "error", "msg", "detail", "title"] {
            match value.get(key) {
                Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
                Some(serde_json::Value::Object(inner)) => {
                    if let Some(serde_json::Value::String(s)) = inner.get("message") {
                        return Some(s.clone());
                    }
                }
                _ => {}
            }
        }
    }
    Some(crate::error::snippet(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let unavailable = status_error(ProviderKind::Rest, StatusCode::BAD_GATEWAY, "");
        assert!(unavailable.is_retryable());

        let throttled = status_error(ProviderKind::Rest, StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(throttled, SmsHubError::ProviderUnavailable { .. }));

        let rejected = status_error(
            ProviderKind::Rest,
            StatusCode::PAYMENT_REQUIRED,
            r#"{"error": {"message": "Insufficient balance"}}"#,
        );
        assert!(matches!(
            rejected,
            SmsHubError::ProviderRejected { ref message, .. } if message == "Insufficient balance"
        ));
    }

    #[test]
    fn test_provider_message_falls_back_to_text() {
        assert_eq!(provider_message("NO_NUMBERS").as_deref(), Some("NO_NUMBERS"));
        assert_eq!(
            provider_message(r#"{"message": "service not available"}"#).as_deref(),
            Some("service not available")
        );
        assert_eq!(provider_message("  "), None);
    }

    #[test]
    fn test_decode_json_reports_snippet() {
        let err = decode_json::<serde_json::Value>(ProviderKind::Pool, "<html>oops</html>").unwrap_err();
        assert!(matches!(err, SmsHubError::ParseFailure { ref snippet, .. } if snippet.contains("oops")));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_unavailable() {
        use axum::{routing::get, Router};

        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = ProviderHttpClient::new(&HttpClientConfig {
            request_timeout_secs: 1,
            ..HttpClientConfig::default()
        })
        .unwrap();
        let err = client
            .send_text(ProviderKind::Rest, client.get(&format!("http://{}/slow", addr)))
            .await
            .unwrap_err();
        assert!(matches!(err, SmsHubError::ProviderUnavailable { .. }));
        assert!(err.is_retryable());
    }
}
