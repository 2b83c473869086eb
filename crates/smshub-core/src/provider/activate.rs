//! handler_api.php 查询协议
//!
//! 所有操作都是 `GET ?api_key=..&action=..`。成功时多数返回 JSON，
//! 失败时可能是 `{"status":"error","message":"NO_NUMBERS"}`，
//! 也可能直接是一个裸词（`NO_BALANCE`、`BAD_KEY`）。
//! 一次性激活走 `getNumber` / `getStatus` / `setStatus`，返回 `ACCESS_NUMBER:id:phone` 这类文本。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ActivateConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::http::decode_json;
use crate::provider::{
    ProviderAdapter, ProviderHttpClient, ProviderKind, ProviderLease, RawMessage, RentMode,
    RentRequest,
};
use crate::storage::entities::{MessageSource, NativeIdKind, NativeIds, Rental};
use crate::utils::parse_provider_timestamp;

const KIND: ProviderKind = ProviderKind::Activate;

/// 取消租用的状态码
const RENT_STATUS_CANCEL: &str = "2";
/// 取消一次性激活的状态码
const ACTIVATION_STATUS_CANCEL: &str = "8";

pub struct ActivateAdapter {
    client: ProviderHttpClient,
    config: ActivateConfig,
}

impl ActivateAdapter {
    pub fn new(client: ProviderHttpClient, config: ActivateConfig) -> Self {
        Self { client, config }
    }

    async fn call(&self, action: &str, params: &[(&str, String)]) -> Result<String> {
        let mut query: Vec<(&str, String)> = vec![
            ("api_key", self.config.api_key.clone()),
            ("action", action.to_string()),
        ];
        query.extend(params.iter().cloned());
        debug!("➡️ activate {}", action);
        let request = self.client.get(&self.config.base_url).query(&query);
        self.client.send_text(KIND, request).await
    }
}

fn is_activation(rental: &Rental) -> bool {
    rental
        .access_credentials
        .as_ref()
        .and_then(|c| c.get("mode"))
        .and_then(Value::as_str)
        == Some("activation")
}

#[async_trait]
impl ProviderAdapter for ActivateAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        &[NativeIdKind::Activation]
    }

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease> {
        let common = [
            ("service", request.service.clone()),
            ("country", request.country.clone()),
        ];
        match request.mode.unwrap_or(RentMode::Rental) {
            RentMode::Activation => {
                let body = self.call("getNumber", &common).await?;
                let lease = parse_access_number(&body)?;
                info!("📱 activate 激活号码: {}", lease.phone_number);
                Ok(lease)
            }
            RentMode::Rental => {
                let mut params = common.to_vec();
                params.push(("rent_time", request.hours().to_string()));
                let body = self.call("getRentNumber", &params).await?;
                let lease = parse_rent_number(&body)?;
                info!("📱 activate 租用号码: {}", lease.phone_number);
                Ok(lease)
            }
        }
    }

    async fn extend(&self, rental: &Rental, duration: Duration) -> Result<Option<DateTime<Utc>>> {
        if is_activation(rental) {
            return Err(SmsHubError::ProviderRejected {
                provider: KIND,
                message: "activation numbers cannot be extended".to_string(),
            });
        }
        let id = rental.native_ids.require(KIND, NativeIdKind::Activation)?;
        let body = self
            .call(
                "continueRentNumber",
                &[
                    ("id", id.to_string()),
                    ("rent_time", duration.num_hours().max(1).to_string()),
                ],
            )
            .await?;
        let lease = parse_rent_number(&body)?;
        Ok(lease.expires_at)
    }

    async fn cancel(&self, rental: &Rental) -> Result<()> {
        let id = rental.native_ids.require(KIND, NativeIdKind::Activation)?;
        if is_activation(rental) {
            let body = self
                .call(
                    "setStatus",
                    &[("id", id.to_string()), ("status", ACTIVATION_STATUS_CANCEL.to_string())],
                )
                .await?;
            return match body.trim() {
                "ACCESS_CANCEL" => Ok(()),
                other => Err(rejection(other)),
            };
        }

        let body = self
            .call(
                "setRentStatus",
                &[("id", id.to_string()), ("status", RENT_STATUS_CANCEL.to_string())],
            )
            .await?;
        let value = parse_envelope(&body)?;
        match value.get("status").and_then(Value::as_str) {
            Some("success") => Ok(()),
            _ => Err(rejection_from(&value, &body)),
        }
    }

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        let id = rental.native_ids.require(KIND, NativeIdKind::Activation)?;
        if is_activation(rental) {
            let body = self.call("getStatus", &[("id", id.to_string())]).await?;
            return parse_activation_status(&body, rental);
        }
        let body = self.call("getRentStatus", &[("id", id.to_string())]).await?;
        parse_rent_status(&body)
    }
}

/// 裸词错误，或者 JSON 包着的错误
fn parse_envelope(body: &str) -> Result<Value> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        return decode_json(KIND, trimmed);
    }
    if is_bare_token(trimmed) {
        return Err(rejection(trimmed));
    }
    Err(SmsHubError::parse_failure(KIND, "既不是 JSON 也不是错误码", body))
}

fn is_bare_token(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == ':')
}

fn rejection(message: &str) -> SmsHubError {
    SmsHubError::ProviderRejected {
        provider: KIND,
        message: message.to_string(),
    }
}

fn rejection_from(value: &Value, body: &str) -> SmsHubError {
    match value.get("message").and_then(Value::as_str) {
        Some(message) => rejection(message),
        None => SmsHubError::parse_failure(KIND, "缺少 status 字段", body),
    }
}

#[derive(Debug, Deserialize)]
struct RentPhone {
    id: Value,
    number: Value,
    #[serde(rename = "endDate")]
    end_date: Option<String>,
}

/// `getRentNumber` / `continueRentNumber` 的响应
pub(crate) fn parse_rent_number(body: &str) -> Result<ProviderLease> {
    let value = parse_envelope(body)?;
    if value.get("status").and_then(Value::as_str) != Some("success") {
        return Err(rejection_from(&value, body));
    }
    let phone: RentPhone = value
        .get("phone")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| SmsHubError::parse_failure(KIND, format!("phone 字段格式不对: {}", e), body))?
        .ok_or_else(|| SmsHubError::parse_failure(KIND, "缺少 phone 字段", body))?;

    let id = scalar_to_string(&phone.id)
        .ok_or_else(|| SmsHubError::parse_failure(KIND, "phone.id 不是标量", body))?;
    let number = scalar_to_string(&phone.number)
        .ok_or_else(|| SmsHubError::parse_failure(KIND, "phone.number 不是标量", body))?;

    Ok(ProviderLease {
        phone_number: normalize_phone(&number),
        native_ids: NativeIds::single(NativeIdKind::Activation, id),
        expires_at: phone.end_date.as_deref().and_then(parse_provider_timestamp),
        access_credentials: Some(serde_json::json!({"mode": "rental"})),
    })
}

/// `ACCESS_NUMBER:$id:$number`
pub(crate) fn parse_access_number(body: &str) -> Result<ProviderLease> {
    let trimmed = body.trim();
    let mut parts = trimmed.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("ACCESS_NUMBER"), Some(id), Some(number)) if !id.is_empty() && !number.is_empty() => {
            Ok(ProviderLease {
                phone_number: normalize_phone(number),
                native_ids: NativeIds::single(NativeIdKind::Activation, id),
                expires_at: None,
                access_credentials: Some(serde_json::json!({"mode": "activation"})),
            })
        }
        _ if is_bare_token(trimmed) => Err(rejection(trimmed)),
        _ => Err(SmsHubError::parse_failure(KIND, "无法识别的 getNumber 响应", body)),
    }
}

/// `getRentStatus` 的响应；`STATUS_WAIT_CODE` 表示还没有短信
pub(crate) fn parse_rent_status(body: &str) -> Result<Vec<RawMessage>> {
    let value = match parse_envelope(body) {
        Ok(value) => value,
        Err(SmsHubError::ProviderRejected { message, .. }) if message == "STATUS_WAIT_CODE" => {
            return Ok(Vec::new())
        }
        Err(e) => return Err(e),
    };

    match value.get("status").and_then(Value::as_str) {
        Some("success") => {}
        Some("error") if value.get("message").and_then(Value::as_str) == Some("STATUS_WAIT_CODE") => {
            return Ok(Vec::new())
        }
        _ => return Err(rejection_from(&value, body)),
    }

    // values 可能是对象（"0": {...}）也可能是数组
    let entries: Vec<&Value> = match value.get("values") {
        Some(Value::Object(map)) => map.values().collect(),
        Some(Value::Array(items)) => items.iter().collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => return Err(SmsHubError::parse_failure(KIND, "values 字段类型不对", body)),
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let sender = entry.get("phoneFrom").and_then(scalar_to_string);
        let text = entry.get("text").and_then(Value::as_str);
        let date = entry
            .get("date")
            .and_then(Value::as_str)
            .and_then(parse_provider_timestamp);
        match (sender, text, date) {
            (Some(sender), Some(text), Some(received_at)) => messages.push(RawMessage {
                sender,
                body: text.to_string(),
                received_at,
                source: MessageSource::ProviderApi,
            }),
            _ => return Err(SmsHubError::parse_failure(KIND, "短信条目缺少字段", body)),
        }
    }
    Ok(messages)
}

/// `getStatus` 的响应：`STATUS_OK:code` 算一条短信，时间取租用时间保证每次同步都是同一个去重键
pub(crate) fn parse_activation_status(body: &str, rental: &Rental) -> Result<Vec<RawMessage>> {
    let trimmed = body.trim();
    if let Some(code) = trimmed.strip_prefix("STATUS_OK:") {
        return Ok(vec![RawMessage {
            sender: rental.service_code.clone(),
            body: code.to_string(),
            received_at: rental.leased_at,
            source: MessageSource::ProviderApi,
        }]);
    }
    match trimmed {
        "STATUS_WAIT_CODE" | "STATUS_WAIT_RETRY" | "STATUS_WAIT_RESEND" | "STATUS_CANCEL" => {
            Ok(Vec::new())
        }
        other if is_bare_token(other) => Err(rejection(other)),
        _ => Err(SmsHubError::parse_failure(KIND, "无法识别的 getStatus 响应", body)),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn normalize_phone(number: &str) -> String {
    let digits = number.trim().trim_start_matches('+');
    format!("+{}", digits)
}
