//! 读缓存控制器
//!
//! 挡在租用列表 / 短信列表 / 同步前面：
//! - TTL 内直接返回快照
//! - 冷却期内（从上一次“尝试”加载算起，不论成败）返回旧快照，不调用 loader
//! - `force` 一定会加载，但同一个键的并发加载合并成一个
//! - 加载失败保留旧快照，和错误一起返回
//! - 失效不打断进行中的加载：之后的读取照样合并进去，但结果不再写回快照
//!
//! 只在会话内存里，不是数据源。

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Result, SmsHubError};
use crate::sync::SyncFailure;

/// 单次读取的缓存参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub cooling_period: Duration,
    pub force: bool,
}

/// 快照新鲜度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Missing,
}

/// 一次缓存读取的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRead<T> {
    pub payload: Option<T>,
    pub fetched_at: Option<DateTime<Utc>>,
    pub freshness: Freshness,
    /// 最近一次加载的错误（快照照常返回）
    pub error: Option<SyncFailure>,
    /// 这次读取是否触发（或加入）了加载
    pub loaded: bool,
}

/// 缓存统计信息
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub cooling_hits: u64,
    pub loads: u64,
    pub coalesced: u64,
    pub failures: u64,
}

struct Entry<T> {
    payload: Option<T>,
    fetched_at: Option<DateTime<Utc>>,
    fetched_instant: Option<Instant>,
    last_attempt: Option<Instant>,
    last_error: Option<SyncFailure>,
}

impl<T> Default for Entry<T> {
    fn default() -> Self {
        Self {
            payload: None,
            fetched_at: None,
            fetched_instant: None,
            last_attempt: None,
            last_error: None,
        }
    }
}

impl<T: Clone> Entry<T> {
    fn read(&self, now: Instant, ttl: Duration, loaded: bool) -> CacheRead<T> {
        let freshness = match (&self.payload, self.fetched_instant) {
            (None, _) => Freshness::Missing,
            (Some(_), Some(at)) if now.duration_since(at) < ttl => Freshness::Fresh,
            (Some(_), _) => Freshness::Stale,
        };
        CacheRead {
            payload: self.payload.clone(),
            fetched_at: self.fetched_at,
            freshness,
            error: self.last_error.clone(),
            loaded,
        }
    }
}

type Load<T> = Shared<BoxFuture<'static, CacheRead<T>>>;

struct InFlight<T> {
    id: u64,
    load: Load<T>,
}

struct Slot<T> {
    /// 每次创建 / 失效都换一个新的 epoch，旧的加载结果不再写回
    epoch: u64,
    entry: Entry<T>,
    in_flight: Option<InFlight<T>>,
}

struct State<T> {
    slots: HashMap<String, Slot<T>>,
    stats: CacheStats,
}

/// 缓存控制器
pub struct CacheController<T> {
    state: Arc<Mutex<State<T>>>,
    epochs: Arc<AtomicU64>,
}

impl<T> Clone for CacheController<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            epochs: self.epochs.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> CacheController<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                slots: HashMap::new(),
                stats: CacheStats::default(),
            })),
            epochs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 读取一个键
    ///
    /// `loader` 只在真正需要加载时才会被调用（在锁内调用，只应构造 future）。
    /// 加载在独立任务里执行，调用方被丢弃也会把结果写回快照。
    pub async fn get<F, Fut>(&self, key: &str, options: CacheOptions, loader: F) -> CacheRead<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let load = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
            let State { slots, stats } = &mut *state;
            let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
                epoch,
                entry: Entry::default(),
                in_flight: None,
            });

            if !options.force {
                if let Some(at) = slot.entry.fetched_instant {
                    if slot.entry.payload.is_some() && now.duration_since(at) < options.ttl {
                        stats.hits += 1;
                        return slot.entry.read(now, options.ttl, false);
                    }
                }
                if let Some(attempt) = slot.entry.last_attempt {
                    if now.duration_since(attempt) < options.cooling_period && slot.in_flight.is_none() {
                        debug!("❄️ 冷却期内，返回旧快照: key={}", key);
                        stats.cooling_hits += 1;
                        return slot.entry.read(now, options.ttl, false);
                    }
                }
            }

            match &slot.in_flight {
                Some(existing) => {
                    debug!("🔗 合并到进行中的加载: key={}", key);
                    stats.coalesced += 1;
                    existing.load.clone()
                }
                None => {
                    stats.loads += 1;
                    slot.entry.last_attempt = Some(now);
                    let id = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
                    let load = self.spawn_load(key.to_string(), id, slot.epoch, options.ttl, loader());
                    slot.in_flight = Some(InFlight {
                        id,
                        load: load.clone(),
                    });
                    load
                }
            }
        };

        load.await
    }

    fn spawn_load<Fut>(&self, key: String, load_id: u64, epoch: u64, ttl: Duration, fut: Fut) -> Load<T>
    where
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let result = fut.await;
            let mut state = state.lock();
            let now = Instant::now();
            let State { slots, stats } = &mut *state;

            let current = slots.get_mut(&key).and_then(|slot| {
                if slot.in_flight.as_ref().is_some_and(|f| f.id == load_id) {
                    slot.in_flight = None;
                }
                (slot.epoch == epoch).then_some(slot)
            });
            match (current, result) {
                (Some(slot), Ok(payload)) => {
                    slot.entry.payload = Some(payload);
                    slot.entry.fetched_at = Some(Utc::now());
                    slot.entry.fetched_instant = Some(now);
                    slot.entry.last_error = None;
                    let mut read = slot.entry.read(now, ttl, true);
                    read.freshness = Freshness::Fresh;
                    read
                }
                (Some(slot), Err(e)) => {
                    warn!("⚠️ 缓存加载失败，保留旧快照: key={}, error={}", key, e);
                    stats.failures += 1;
                    slot.entry.last_error = Some(SyncFailure::from(&e));
                    slot.entry.read(now, ttl, true)
                }
                // 加载期间键已失效，结果只交给等待者
                (None, Ok(payload)) => CacheRead {
                    payload: Some(payload),
                    fetched_at: Some(Utc::now()),
                    freshness: Freshness::Fresh,
                    error: None,
                    loaded: true,
                },
                (None, Err(e)) => {
                    stats.failures += 1;
                    CacheRead {
                        payload: None,
                        fetched_at: None,
                        freshness: Freshness::Missing,
                        error: Some(SyncFailure::from(&e)),
                        loaded: true,
                    }
                }
            }
        });

        async move {
            match handle.await {
                Ok(read) => read,
                Err(e) => {
                    let err = SmsHubError::InvalidOperation(format!("cache load task failed: {}", e));
                    CacheRead {
                        payload: None,
                        fetched_at: None,
                        freshness: Freshness::Missing,
                        error: Some(SyncFailure::from(&err)),
                        loaded: true,
                    }
                }
            }
        }
        .boxed()
        .shared()
    }

    /// 让一个键失效，下次读取重新加载
    ///
    /// 进行中的加载保留，期间到来的读取合并进去，完成后不写回快照。
    pub fn invalidate(&self, key: &str) {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.get_mut(key) {
            slot.epoch = epoch;
            slot.entry = Entry::default();
            debug!("缓存已失效: key={}", key);
        }
    }

    /// 让所有以 `prefix` 开头的键失效
    pub fn invalidate_prefix(&self, prefix: &str) {
        let keys: Vec<String> = {
            let state = self.state.lock();
            state.slots.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
        };
        for key in keys {
            self.invalidate(&key);
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots.clear();
        debug!("缓存已清空");
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.slots.len(),
            ..state.stats.clone()
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for CacheController<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// `rental-list:<caller>`
pub fn rental_list_key(caller_id: &str) -> String {
    format!("rental-list:{}", caller_id)
}

/// `messages:<rental_id>`
pub fn messages_key(rental_id: &str) -> String {
    format!("messages:{}", rental_id)
}

/// `sync:<rental_id>`
pub fn sync_key(rental_id: &str) -> String {
    format!("sync:{}", rental_id)
}
