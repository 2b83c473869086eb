//! 内存里的脚本化供应商，给测试用
//!
//! 不发任何网络请求；收件箱内容、失败注入、调用计数都由测试代码控制。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, SmsHubError};
use crate::provider::{ProviderAdapter, ProviderKind, ProviderLease, RawMessage, RentRequest};
use crate::storage::entities::{NativeIdKind, Rental};

#[derive(Default)]
struct Script {
    inbox: Vec<RawMessage>,
    rent_failures: VecDeque<SmsHubError>,
    fetch_failures: VecDeque<SmsHubError>,
    extend_failures: VecDeque<SmsHubError>,
    cancel_failures: VecDeque<SmsHubError>,
    extend_expiry: Option<DateTime<Utc>>,
}

pub struct ScriptedProvider {
    kind: ProviderKind,
    required_ids: &'static [NativeIdKind],
    fetch_delay: Option<std::time::Duration>,
    extend_delay: Option<std::time::Duration>,
    script: Mutex<Script>,
    rent_calls: AtomicUsize,
    extend_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            required_ids: &[NativeIdKind::Order],
            fetch_delay: None,
            extend_delay: None,
            script: Mutex::new(Script::default()),
            rent_calls: AtomicUsize::new(0),
            extend_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_required_ids(mut self, kinds: &'static [NativeIdKind]) -> Self {
        self.required_ids = kinds;
        self
    }

    /// 每次拉短信前先等一会，用来制造并发窗口
    pub fn with_fetch_delay(mut self, delay: std::time::Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// 续期请求先挂起一会，用来模拟慢供应商
    pub fn with_extend_delay(mut self, delay: std::time::Duration) -> Self {
        self.extend_delay = Some(delay);
        self
    }

    /// 往供应商侧收件箱放一条短信
    pub fn push_message(&self, sender: &str, body: &str, received_at: DateTime<Utc>) {
        self.script.lock().inbox.push(RawMessage {
            sender: sender.to_string(),
            body: body.to_string(),
            received_at,
            source: self.kind.message_source(),
        });
    }

    pub fn fail_next_rent(&self, error: SmsHubError) {
        self.script.lock().rent_failures.push_back(error);
    }

    pub fn fail_next_fetch(&self, error: SmsHubError) {
        self.script.lock().fetch_failures.push_back(error);
    }

    pub fn fail_next_extend(&self, error: SmsHubError) {
        self.script.lock().extend_failures.push_back(error);
    }

    pub fn fail_next_cancel(&self, error: SmsHubError) {
        self.script.lock().cancel_failures.push_back(error);
    }

    /// 续期时报告的新到期时间
    pub fn report_extend_expiry(&self, expiry: DateTime<Utc>) {
        self.script.lock().extend_expiry = Some(expiry);
    }

    pub fn unavailable(&self) -> SmsHubError {
        SmsHubError::ProviderUnavailable {
            provider: self.kind,
            reason: "scripted outage".to_string(),
        }
    }

    pub fn rent_calls(&self) -> usize {
        self.rent_calls.load(Ordering::SeqCst)
    }

    pub fn extend_calls(&self) -> usize {
        self.extend_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn required_id_kinds(&self) -> &'static [NativeIdKind] {
        self.required_ids
    }

    async fn rent(&self, request: &RentRequest) -> Result<ProviderLease> {
        let n = self.rent_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.script.lock().rent_failures.pop_front() {
            return Err(error);
        }

        let mut native_ids = crate::storage::entities::NativeIds::new();
        for kind in self.required_ids {
            native_ids.insert(*kind, format!("{}-{}", kind, n));
        }
        Ok(ProviderLease {
            phone_number: format!("+4915{:08}", n),
            native_ids,
            expires_at: Some(Utc::now() + request.duration),
            access_credentials: None,
        })
    }

    async fn extend(&self, _rental: &Rental, _duration: Duration) -> Result<Option<DateTime<Utc>>> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.extend_delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock();
        if let Some(error) = script.extend_failures.pop_front() {
            return Err(error);
        }
        Ok(script.extend_expiry.take())
    }

    async fn cancel(&self, _rental: &Rental) -> Result<()> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().cancel_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn fetch_messages(&self, _rental: &Rental) -> Result<Vec<RawMessage>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut script = self.script.lock();
        if let Some(error) = script.fetch_failures.pop_front() {
            return Err(error);
        }
        Ok(script.inbox.clone())
    }
}

/// 在 127.0.0.1 的随机端口上起一个假的供应商 / 中继，返回 base url
#[cfg(test)]
pub(crate) async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
