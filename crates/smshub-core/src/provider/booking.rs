//! 预订式供应商（API key 请求头）
//!
//! 下单返回两个不同的标识：`order_id` 用于续期 / 取消，
//! `booking_id` 用于轮询收件箱。两个都必须存下来，只存一个会导致后面拉不到短信。
//!
//! 业务失败有时是 HTTP 200 + `{"success": false, "error": "..."}`。

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::BookingConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::http::decode_json;
use crate::provider::{
    ProviderAdapter, ProviderHttpClient, ProviderKind, ProviderLease, RawMessage, RentRequest,
};
use crate::storage::entities::{MessageSource, NativeIdKind, NativeIds, Rental};

const KIND: ProviderKind = ProviderKind::Booking;
const API_KEY_HEADER: &str = "X-Api-Key";

pub struct BookingAdapter {
    client: ProviderHttpClient,
    config: BookingConfig,
}

#[derive(Serialize)]
struct OrderBody<'a> {
    service: &'a str,
    country: &'a str,
    hours: i64,
}

#[derive(Serialize)]
struct ExtendBody {
    hours: i64,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order_id: Value,
    #[serde(default)]
    booking_id: Option<Value>,
    phone: String,
    #[serde(default)]
    expires: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireSms {
    sender: String,
    message: String,
    /// UNIX 秒
    received: i64,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(default)]
    sms: Vec<WireSms>,
}

impl BookingAdapter {
    pub fn new(client: ProviderHttpClient, config: BookingConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let raw = self
            .client
            .send_text(KIND, request.header(API_KEY_HEADER, &self.config.api_key))
            .await?;
        let value: Value = if raw.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            decode_json(KIND, &raw)?
        };
        check_success(&value)?;
        Ok(value)
    }
}

#[async_trait]
impl ProviderAdapter for BookingAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        &[NativeIdKind::Order, NativeIdKind::Booking]
    }

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease> {
        let body = OrderBody {
            service: &request.service,
            country: &request.country,
            hours: request.hours(),
        };
        let value = self.send(self.client.post(&self.url("/api/orders")).json(&body)).await?;
        let lease = parse_order(&value)?;
        info!(
            "📱 booking 下单成功: phone={}, order={:?}, booking={:?}",
            lease.phone_number,
            lease.native_ids.get(NativeIdKind::Order),
            lease.native_ids.get(NativeIdKind::Booking)
        );
        Ok(lease)
    }

    async fn extend(&self, rental: &Rental, duration: Duration) -> Result<Option<DateTime<Utc>>> {
        let order_id = rental.native_ids.require(KIND, NativeIdKind::Order)?;
        let value = self
            .send(
                self.client
                    .post(&self.url(&format!("/api/orders/{}/extend", order_id)))
                    .json(&ExtendBody {
                        hours: duration.num_hours().max(1),
                    }),
            )
            .await?;
        Ok(value
            .get("expires")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()))
    }

    async fn cancel(&self, rental: &Rental) -> Result<()> {
        let order_id = rental.native_ids.require(KIND, NativeIdKind::Order)?;
        self.send(self.client.post(&self.url(&format!("/api/orders/{}/cancel", order_id))))
            .await?;
        Ok(())
    }

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        // 收件箱只认 booking id，用 order id 查会返回空列表
        let booking_id = rental.native_ids.require(KIND, NativeIdKind::Booking)?;
        let value = self
            .send(self.client.get(&self.url(&format!("/api/bookings/{}/sms", booking_id))))
            .await?;
        parse_sms(&value)
    }
}

fn check_success(value: &Value) -> Result<()> {
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let message = value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request declined")
            .to_string();
        return Err(SmsHubError::ProviderRejected { provider: KIND, message });
    }
    Ok(())
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn parse_order(value: &Value) -> Result<ProviderLease> {
    let raw = value.to_string();
    let order: OrderResponse = serde_json::from_value(value.clone())
        .map_err(|e| SmsHubError::parse_failure(KIND, format!("下单响应格式不对: {}", e), &raw))?;

    let mut native_ids = NativeIds::new();
    if let Some(order_id) = id_string(&order.order_id) {
        native_ids.insert(NativeIdKind::Order, order_id);
    }
    if let Some(booking_id) = order.booking_id.as_ref().and_then(id_string) {
        native_ids.insert(NativeIdKind::Booking, booking_id);
    }

    Ok(ProviderLease {
        phone_number: order.phone,
        native_ids,
        expires_at: order.expires.and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        access_credentials: None,
    })
}

pub(crate) fn parse_sms(value: &Value) -> Result<Vec<RawMessage>> {
    let raw = value.to_string();
    let parsed: SmsResponse = serde_json::from_value(value.clone())
        .map_err(|e| SmsHubError::parse_failure(KIND, format!("短信响应格式不对: {}", e), &raw))?;
    parsed
        .sms
        .into_iter()
        .map(|sms| {
            let received_at = Utc
                .timestamp_opt(sms.received, 0)
                .single()
                .ok_or_else(|| SmsHubError::parse_failure(KIND, "received 越界", &raw))?;
            Ok(RawMessage {
                sender: sms.sender,
                body: sms.message,
                received_at,
                source: MessageSource::ProviderApi,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_keeps_both_identifiers() {
        let lease = parse_order(&json!({
            "order_id": 9001,
            "booking_id": "bk_55",
            "phone": "+447700900001",
            "expires": 1893456000
        }))
        .unwrap();
        assert_eq!(lease.native_ids.get(NativeIdKind::Order), Some("9001"));
        assert_eq!(lease.native_ids.get(NativeIdKind::Booking), Some("bk_55"));
        assert_eq!(lease.expires_at.unwrap().timestamp(), 1893456000);
    }

    #[test]
    fn test_order_without_booking_id_is_detected() {
        let adapter = BookingAdapter::new(
            ProviderHttpClient::new(&Default::default()).unwrap(),
            BookingConfig {
                base_url: "http://unused".into(),
                api_key: "k".into(),
            },
        );
        let lease = parse_order(&json!({"order_id": "o-1", "phone": "+1"})).unwrap();
        let guard = crate::provider::check_lease_ids(&adapter, &lease);
        assert!(matches!(guard, Err(SmsHubError::ParseFailure { .. })));
    }

    #[test]
    fn test_declines_and_sms_shape() {
        let declined = check_success(&json!({"success": false, "error": "Out of stock"}));
        assert!(matches!(
            declined,
            Err(SmsHubError::ProviderRejected { ref message, .. }) if message == "Out of stock"
        ));

        let messages = parse_sms(&json!({"success": true, "sms": [
            {"sender": "Google", "message": "G-123456 is your code", "received": 1714554000}
        ]}))
        .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "G-123456 is your code");
        assert_eq!(messages[0].received_at.timestamp(), 1714554000);

        assert!(parse_sms(&json!({"success": true})).unwrap().is_empty());
    }
}
