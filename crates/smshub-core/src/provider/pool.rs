//! 号码池供应商（Bearer token，路径风格接口）
//!
//! `buy/{service}/{country}`、`check/{id}`、`prolong/{id}/{hours}`、`cancel/{id}`。
//! 短信不单独提供接口，而是内嵌在 `check` 返回的订单里。
//! 业务拒绝常以纯文本返回（例如 `no free phones`）。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::config::PoolConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::http::decode_json;
use crate::provider::{
    ProviderAdapter, ProviderHttpClient, ProviderKind, ProviderLease, RawMessage, RentRequest,
};
use crate::storage::entities::{MessageSource, NativeIdKind, NativeIds, Rental};
use crate::utils::parse_provider_timestamp;

const KIND: ProviderKind = ProviderKind::Pool;

pub struct PoolAdapter {
    client: ProviderHttpClient,
    config: PoolConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Order {
    id: Value,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    expires: Option<String>,
    #[serde(default)]
    sms: Option<Vec<WireSms>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSms {
    sender: String,
    text: String,
    date: String,
}

impl PoolAdapter {
    pub fn new(client: ProviderHttpClient, config: PoolConfig) -> Self {
        Self { client, config }
    }

    async fn call(&self, segments: &[&str]) -> Result<Order> {
        let url = endpoint(&self.config.base_url, segments)?;
        let request = self.client.get(url.as_str()).bearer_auth(&self.config.token);
        let raw = self.client.send_text(KIND, request).await?;
        parse_order(&raw)
    }
}

#[async_trait]
impl ProviderAdapter for PoolAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        &[NativeIdKind::Order]
    }

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease> {
        let service = request.service.trim().to_lowercase();
        let country = request.country.trim().to_lowercase();
        let order = self.call(&["buy", &service, &country]).await?;
        let id = order_id(&order)?;
        let phone = order.phone.clone().ok_or_else(|| {
            SmsHubError::parse_failure(KIND, "订单缺少 phone", &format!("{:?}", order))
        })?;
        info!("📱 pool 购买号码: {} (order={})", phone, id);
        Ok(ProviderLease {
            phone_number: phone,
            native_ids: NativeIds::single(NativeIdKind::Order, id),
            expires_at: order.expires.as_deref().and_then(parse_provider_timestamp),
            access_credentials: None,
        })
    }

    async fn extend(&self, rental: &Rental, duration: Duration) -> Result<Option<DateTime<Utc>>> {
        let id = rental.native_ids.require(KIND, NativeIdKind::Order)?;
        let hours = duration.num_hours().max(1).to_string();
        let order = self.call(&["prolong", id, &hours]).await?;
        Ok(order.expires.as_deref().and_then(parse_provider_timestamp))
    }

    async fn cancel(&self, rental: &Rental) -> Result<()> {
        let id = rental.native_ids.require(KIND, NativeIdKind::Order)?;
        self.call(&["cancel", id]).await?;
        Ok(())
    }

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        let id = rental.native_ids.require(KIND, NativeIdKind::Order)?;
        let order = self.call(&["check", id]).await?;
        messages_of(order)
    }
}

/// 纯文本且不像 HTML 的响应按业务拒绝处理
pub(crate) fn parse_order(raw: &str) -> Result<Order> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        if !trimmed.is_empty() && !trimmed.contains('<') && trimmed.len() <= 200 {
            return Err(SmsHubError::ProviderRejected {
                provider: KIND,
                message: trimmed.to_string(),
            });
        }
        return Err(SmsHubError::parse_failure(KIND, "响应不是 JSON", raw));
    }
    decode_json(KIND, trimmed)
}

fn order_id(order: &Order) -> Result<String> {
    match &order.id {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(SmsHubError::parse_failure(KIND, "订单 id 缺失", &format!("{:?}", order))),
    }
}

pub(crate) fn messages_of(order: Order) -> Result<Vec<RawMessage>> {
    let snapshot = format!("{:?}", order);
    order
        .sms
        .unwrap_or_default()
        .into_iter()
        .map(|sms| {
            let received_at = parse_provider_timestamp(&sms.date).ok_or_else(|| {
                SmsHubError::parse_failure(KIND, format!("date 无法解析: {}", sms.date), &snapshot)
            })?;
            Ok(RawMessage {
                sender: sms.sender,
                body: sms.text,
                received_at,
                source: MessageSource::ProviderApi,
            })
        })
        .collect()
}

/// 路径段逐个编码后拼到 base url 后面
fn endpoint(base: &str, segments: &[&str]) -> Result<url::Url> {
    let mut url = url::Url::parse(base)
        .map_err(|e| SmsHubError::Config(format!("pool base_url 无效: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| SmsHubError::Config("pool base_url 不能作为路径前缀".to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_decline_is_rejection() {
        assert!(matches!(
            parse_order("no free phones"),
            Err(SmsHubError::ProviderRejected { ref message, .. }) if message == "no free phones"
        ));
        assert!(matches!(
            parse_order("<html><body>502 Bad Gateway</body></html>"),
            Err(SmsHubError::ParseFailure { .. })
        ));
    }

    #[test]
    fn test_messages_are_embedded_in_check() {
        let order = parse_order(
            r#"{"id": 11631253, "phone": "+79000381454", "status": "RECEIVED",
                "expires": "2024-05-01T09:20:00.000Z",
                "sms": [{"sender": "Amazon", "text": "Your code 6157", "date": "2024-05-01T09:03:42.133Z"}]}"#,
        )
        .unwrap();
        let messages = messages_of(order).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "Amazon");
        assert_eq!(messages[0].body, "Your code 6157");

        let pending = parse_order(r#"{"id": 1, "status": "PENDING", "sms": null}"#).unwrap();
        assert!(messages_of(pending).unwrap().is_empty());
    }

    #[test]
    fn test_path_segments_are_encoded() {
        let url = endpoint("https://pool.example/v1/user/", &["buy", "any other", "germany"]).unwrap();
        assert_eq!(url.as_str(), "https://pool.example/v1/user/buy/any%20other/germany");
    }
}
