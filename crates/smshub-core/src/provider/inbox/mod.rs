//! 没有 API 的收件箱供应商
//!
//! 号码是公开的，运营手动登记进来；短信只能通过中继抓取网页再解析表格。
//! 没有租号接口，续期 / 取消在供应商侧什么都不用做。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::InboxConfig;
use crate::error::{Result, SmsHubError};
use crate::provider::{
    ProviderAdapter, ProviderHttpClient, ProviderKind, ProviderLease, RawMessage, RentRequest,
};
use crate::storage::entities::{NativeIdKind, Rental};

pub mod parser;
pub mod relay;

pub use parser::InboxParser;
pub use relay::RelayChain;

const KIND: ProviderKind = ProviderKind::Inbox;
const PHONE_PLACEHOLDER: &str = "{phone}";

pub struct InboxAdapter {
    page_url: String,
    relays: RelayChain,
    parser: InboxParser,
}

impl InboxAdapter {
    pub fn new(client: ProviderHttpClient, config: InboxConfig) -> Result<Self> {
        Ok(Self {
            relays: RelayChain::new(client, config.relays)?,
            parser: InboxParser::new(config.labels)?,
            page_url: config.page_url,
        })
    }

    /// 号码对应的收件箱页面地址
    pub fn page_for(&self, phone_number: &str) -> String {
        let digits: String = phone_number.chars().filter(|c| c.is_ascii_digit()).collect();
        if self.page_url.contains(PHONE_PLACEHOLDER) {
            self.page_url.replace(PHONE_PLACEHOLDER, &digits)
        } else {
            format!("{}/{}", self.page_url.trim_end_matches('/'), digits)
        }
    }
}

#[async_trait]
impl ProviderAdapter for InboxAdapter {
    fn kind(&self) -> ProviderKind {
        KIND
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        &[NativeIdKind::Manual]
    }

    async fn rent(&self, _request: &RentRequest) -> Result<ProviderLease> {
        Err(SmsHubError::ProviderRejected {
            provider: KIND,
            message: "inbox numbers cannot be rented; register them manually".to_string(),
        })
    }

    async fn extend(&self, rental: &Rental, _duration: Duration) -> Result<Option<DateTime<Utc>>> {
        debug!("inbox 号码续期只更新本地记录: {}", rental.phone_number);
        Ok(None)
    }

    async fn cancel(&self, rental: &Rental) -> Result<()> {
        debug!("inbox 号码取消只更新本地记录: {}", rental.phone_number);
        Ok(())
    }

    async fn fetch_messages(&self, rental: &Rental) -> Result<Vec<RawMessage>> {
        let page = self.page_for(&rental.phone_number);
        let html = self.relays.fetch(&page).await?;
        self.parser.parse(&html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LabelPrefixes, RelayConfig, RelayFormat};
    use crate::provider::testing::serve;
    use crate::storage::entities::{MessageSource, NativeIds, RentalStatus};
    use axum::{extract::Query, http::StatusCode, response::IntoResponse, routing::get, Router};
    use std::collections::HashMap;

    fn rental(phone: &str) -> Rental {
        Rental {
            id: "r-inbox".into(),
            phone_number: phone.into(),
            provider: KIND,
            native_ids: NativeIds::single(NativeIdKind::Manual, phone),
            service_code: "any".into(),
            country_code: "GB".into(),
            status: RentalStatus::Active,
            leased_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(30),
            assignee: None,
            access_credentials: None,
            manual: true,
        }
    }

    #[tokio::test]
    async fn test_third_relay_serves_the_inbox() {
        let page = "<table><thead><tr><th>From</th><th>Message</th><th>Time</th></tr></thead>\
                    <tbody><tr><td>PayPal</td><td>PayPal: 482913 is your code</td><td>2024-05-01 09:15:00</td></tr></tbody></table>";
        let app = Router::new()
            .route("/r1", get(|| async { StatusCode::BAD_GATEWAY.into_response() }))
            .route(
                "/r2",
                get(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    "too late".into_response()
                }),
            )
            .route(
                "/r3",
                get(move |Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("url").map(String::as_str), Some("https://inbox.example/number/447700900123"));
                    page.into_response()
                }),
            );
        let base = serve(app).await;

        let client = ProviderHttpClient::new(&crate::config::HttpClientConfig {
            request_timeout_secs: 1,
            ..Default::default()
        })
        .unwrap();
        let adapter = InboxAdapter::new(
            client,
            InboxConfig {
                page_url: "https://inbox.example/number/{phone}".into(),
                relays: ["r1", "r2", "r3"]
                    .iter()
                    .map(|p| RelayConfig {
                        url: format!("{}/{}?url={{url}}", base, p),
                        format: RelayFormat::Raw,
                    })
                    .collect(),
                labels: LabelPrefixes::default(),
            },
        )
        .unwrap();

        let messages = adapter.fetch_messages(&rental("+44 7700 900123")).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "PayPal");
        assert_eq!(messages[0].source, MessageSource::Scrape);
    }

    #[tokio::test]
    async fn test_rent_is_rejected() {
        let adapter = InboxAdapter::new(
            ProviderHttpClient::new(&Default::default()).unwrap(),
            InboxConfig {
                page_url: "https://inbox.example/number".into(),
                relays: vec![RelayConfig {
                    url: "https://relay.example/?".into(),
                    format: RelayFormat::Raw,
                }],
                labels: LabelPrefixes::default(),
            },
        )
        .unwrap();
        assert_eq!(adapter.page_for("+1 (555) 0100"), "https://inbox.example/number/15550100");

        let request = RentRequest {
            provider: KIND,
            service: "any".into(),
            country: "US".into(),
            duration: Duration::hours(1),
            mode: None,
        };
        assert!(matches!(
            adapter.rent(&request).await,
            Err(SmsHubError::ProviderRejected { .. })
        ));
    }
}
