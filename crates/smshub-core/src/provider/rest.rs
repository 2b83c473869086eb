//! Bearer token 的 JSON REST 供应商
//!
//! - `POST   /v1/rentals`              租号
//! - `POST   /v1/rentals/{id}/extend`  续期
//! - `DELETE /v1/rentals/{id}`         取消
//! - `GET    /v1/rentals/{id}/messages` 拉短信

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RestConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::http::decode_json;
use crate::provider::{
    ProviderAdapter, ProviderHttpClient, ProviderKind, ProviderLease, RawMessage, RentRequest,
};
use crate::storage::entities::{MessageSource, NativeIdKind, NativeIds, Rental};
use crate::utils::parse_provider_timestamp;

const KIND: ProviderKind = ProviderKind::Rest;

pub struct RestAdapter {
    client: ProviderHttpClient,
    config: RestConfig,
}

#[derive(Serialize)]
struct CreateRentalBody<'a> {
    service: &'a str,
    country: &'a str,
    duration_hours: i64,
}

#[derive(Serialize)]
struct ExtendBody {
    duration_hours: i64,
}

#[derive(Debug, Deserialize)]
struct RentalResponse {
    id: serde_json::Value,
    phone_number: String,
    #[serde(default)]
    expires_at: Option<String>,
    #[serde(default)]
    credentials: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ExtendResponse {
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    from: String,
    text: String,
    received_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessagesResponse {
    Wrapped { messages: Vec<WireMessage> },
    Bare(Vec<WireMessage>),
}

impl RestAdapter {
    pub fn new(client: ProviderHttpClient, config: RestConfig) -> Self {
        Self { client, config }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn rental_id<'a>(&self, rental: &'a Rental) -> Result<&'a str> {
        rental.native_ids.require(KIND, NativeIdKind::Order)
    }
}

#[async_trait]
impl ProviderAdapter for RestAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        &[NativeIdKind::Order]
    }

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease> {
        let body = CreateRentalBody {
            service: &request.service,
            country: &request.country,
            duration_hours: request.hours(),
        };
        let req = self
            .client
            .post(&self.url("/v1/rentals"))
            .bearer_auth(&self.config.token)
            .json(&body);
        let raw = self.client.send_text(KIND, req).await?;
        let lease = parse_rental(&raw)?;
        info!("📱 rest 租用号码: {}", lease.phone_number);
        Ok(lease)
    }

    async fn extend(&self, rental: &Rental, duration: Duration) -> Result<Option<DateTime<Utc>>> {
        let id = self.rental_id(rental)?;
        let req = self
            .client
            .post(&self.url(&format!("/v1/rentals/{}/extend", id)))
            .bearer_auth(&self.config.token)
            .json(&ExtendBody {
                duration_hours: duration.num_hours().max(1),
            });
        let raw = self.client.send_text(KIND, req).await?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let parsed: ExtendResponse = decode_json(KIND, &raw)?;
        Ok(parsed.expires_at.as_deref().and_then(parse_provider_timestamp))
    }

    async fn cancel(&self, rental: &Rental) -> Result<()> {
        let id = self.rental_id(rental)?;
        let req = self
            .client
            .delete(&self.url(&format!("/v1/rentals/{}", id)))
            .bearer_auth(&self.config.token);
        self.client.send_text(KIND, req).await?;
        Ok(())
    }

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        let id = self.rental_id(rental)?;
        let req = self
            .client
            .get(&self.url(&format!("/v1/rentals/{}/messages", id)))
            .bearer_auth(&self.config.token);
        let raw = self.client.send_text(KIND, req).await?;
        parse_messages(&raw)
    }
}

pub(crate) fn parse_rental(raw: &str) -> Result<ProviderLease> {
    let parsed: RentalResponse = decode_json(KIND, raw)?;
    let id = match &parsed.id {
        serde_json::Value::String(s) if !s.is_empty() => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return Err(SmsHubError::parse_failure(KIND, "id 字段缺失或类型不对", raw)),
    };
    let expires_at = match parsed.expires_at.as_deref() {
        Some(value) => Some(
            parse_provider_timestamp(value)
                .ok_or_else(|| SmsHubError::parse_failure(KIND, "expires_at 无法解析", raw))?,
        ),
        None => None,
    };
    Ok(ProviderLease {
        phone_number: parsed.phone_number,
        native_ids: NativeIds::single(NativeIdKind::Order, id),
        expires_at,
        access_credentials: parsed.credentials,
    })
}

pub(crate) fn parse_messages(raw: &str) -> Result<Vec<RawMessage>> {
    let parsed: MessagesResponse = decode_json(KIND, raw)?;
    let wire = match parsed {
        MessagesResponse::Wrapped { messages } => messages,
        MessagesResponse::Bare(messages) => messages,
    };
    wire.into_iter()
        .map(|m| {
            let received_at = parse_provider_timestamp(&m.received_at).ok_or_else(|| {
                SmsHubError::parse_failure(KIND, format!("received_at 无法解析: {}", m.received_at), raw)
            })?;
            Ok(RawMessage {
                sender: m.from,
                body: m.text,
                received_at,
                source: MessageSource::ProviderApi,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::serve;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode},
        routing::{get, post},
        Json, Router,
    };
    use chrono::TimeZone;

    #[test]
    fn test_parse_messages_both_shapes() {
        let wrapped = r#"{"messages":[{"from":"WhatsApp","text":"code 1","received_at":"2024-05-01T09:00:00Z"}]}"#;
        let bare = r#"[{"from":"WhatsApp","text":"code 1","received_at":"2024-05-01T09:00:00+00:00"}]"#;
        assert_eq!(parse_messages(wrapped).unwrap(), parse_messages(bare).unwrap());
        assert_eq!(
            parse_messages(wrapped).unwrap()[0].received_at,
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
        );
        assert!(matches!(
            parse_messages(r#"{"items": []}"#),
            Err(SmsHubError::ParseFailure { .. })
        ));
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret")
    }

    #[tokio::test]
    async fn test_adapter_against_fake_api() {
        let app = Router::new()
            .route(
                "/v1/rentals",
                post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    if !authorized(&headers) {
                        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"message": "bad token"})));
                    }
                    if body["country"] == "XX" {
                        return (
                            StatusCode::UNPROCESSABLE_ENTITY,
                            Json(serde_json::json!({"message": "No numbers available"})),
                        );
                    }
                    (
                        StatusCode::CREATED,
                        Json(serde_json::json!({
                            "id": 501,
                            "phone_number": "+4915112345678",
                            "expires_at": "2030-01-02T00:00:00Z"
                        })),
                    )
                }),
            )
            .route(
                "/v1/rentals/{id}/messages",
                get(|Path(id): Path<String>| async move {
                    assert_eq!(id, "501");
                    Json(serde_json::json!({"messages": [
                        {"from": "Telegram", "text": "Login code 99", "received_at": "2030-01-01T10:00:00Z"}
                    ]}))
                }),
            );
        let base = serve(app).await;
        let client = ProviderHttpClient::new(&Default::default()).unwrap();
        let adapter = RestAdapter::new(
            client,
            RestConfig {
                base_url: base,
                token: "secret".into(),
            },
        );

        let mut request = RentRequest {
            provider: KIND,
            service: "whatsapp".into(),
            country: "DE".into(),
            duration: Duration::hours(24),
            mode: None,
        };
        let lease = adapter.rent(&request).await.unwrap();
        assert_eq!(lease.native_ids.get(NativeIdKind::Order), Some("501"));

        request.country = "XX".into();
        let declined = adapter.rent(&request).await.unwrap_err();
        assert!(matches!(
            declined,
            SmsHubError::ProviderRejected { ref message, .. } if message == "No numbers available"
        ));

        let rental = Rental {
            id: "r".into(),
            phone_number: lease.phone_number,
            provider: KIND,
            native_ids: lease.native_ids,
            service_code: "whatsapp".into(),
            country_code: "DE".into(),
            status: crate::storage::entities::RentalStatus::Active,
            leased_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(24),
            assignee: None,
            access_credentials: None,
            manual: false,
        };
        let messages = adapter.fetch_messages(&rental).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "Telegram");
    }
}
