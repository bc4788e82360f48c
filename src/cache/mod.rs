//! # Telemetry Cache
//!
//! Read-through cache in front of slow telemetry fetches (each one is a `meshtastic`
//! subprocess taking seconds). Guarantees:
//!
//! - at most one fetch in flight per fingerprint; concurrent readers share its result
//! - fresh entries are served without fetching
//! - when a refetch fails, the last good value is served marked [`Freshness::Stale`]
//!
//! The backend is picked once by [`CacheBackend::select`]: Redis when configured and
//! answering `PING`, the process-local map otherwise. After that, backend errors are
//! logged and read as misses; readers never see them.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::CacheConfig;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The shared backend could not be reached during selection.
    #[error("cache backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The fetch failed and no earlier value exists to fall back on.
    #[error("telemetry fetch failed: {0}")]
    Fetch(String),
}

/// What is stored per fingerprint, in either backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub fetched_at: DateTime<Utc>,
    pub value: Value,
}

impl Envelope {
    fn age(&self) -> Duration {
        (Utc::now() - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    /// Served from an older fetch because the refetch failed.
    Stale { fetch_error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheRead {
    pub value: Value,
    pub fetched_at: DateTime<Utc>,
    pub freshness: Freshness,
}

impl CacheRead {
    fn fresh(envelope: Envelope) -> Self {
        Self {
            value: envelope.value,
            fetched_at: envelope.fetched_at,
            freshness: Freshness::Fresh,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.freshness, Freshness::Stale { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Empty,
    Fetching,
    Ready,
}

/// Redis connection shared by every reader.
#[derive(Clone)]
pub struct RedisBackend {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBackend {
    /// Connect and `PING`; any failure means the backend is unavailable.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        let pong: String = redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|err| CacheError::BackendUnavailable(err.to_string()))?;
        debug!("cache: redis answered {}", pong);
        Ok(Self { conn })
    }

    async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.get::<_, Option<String>>(key).await
    }

    async fn set(&self, key: &str, data: String, ttl: Duration) -> redis::RedisResult<()> {
        use redis::AsyncCommands;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, data, ttl.as_secs().max(1)).await
    }
}

/// Process-local entries with their expiry instant.
#[derive(Debug, Default)]
pub struct LocalBackend {
    entries: Mutex<HashMap<String, (Envelope, Instant)>>,
}

impl LocalBackend {
    fn get(&self, key: &str) -> Option<Envelope> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match entries.get(key) {
            Some((envelope, expires)) if *expires > Instant::now() => Some(envelope.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn set(&self, key: &str, envelope: Envelope, ttl: Duration) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), (envelope, Instant::now() + ttl));
    }
}

pub enum CacheBackend {
    Shared(RedisBackend),
    Local(LocalBackend),
}

impl CacheBackend {
    /// One-time backend choice: Redis if `redis_url` is set and answers within
    /// `probe_timeout_ms`, otherwise the local map.
    pub async fn select(config: &CacheConfig) -> Self {
        let Some(url) = config.redis_url.as_deref() else {
            info!("cache: no redis_url configured, using process-local backend");
            return Self::local();
        };
        let budget = Duration::from_millis(config.probe_timeout_ms);
        match tokio::time::timeout(budget, RedisBackend::connect(url)).await {
            Ok(Ok(redis)) => {
                info!("cache: using shared Redis backend");
                CacheBackend::Shared(redis)
            }
            Ok(Err(e)) => {
                warn!("cache: {}; falling back to process-local backend", e);
                Self::local()
            }
            Err(_) => {
                warn!(
                    "cache: {}; falling back to process-local backend",
                    CacheError::BackendUnavailable(format!("no PING reply within {:?}", budget))
                );
                Self::local()
            }
        }
    }

    pub fn local() -> Self {
        CacheBackend::Local(LocalBackend::default())
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, CacheBackend::Shared(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CacheBackend::Shared(_) => "redis",
            CacheBackend::Local(_) => "local",
        }
    }

    async fn get(&self, key: &str) -> Option<Envelope> {
        match self {
            CacheBackend::Local(local) => local.get(key),
            CacheBackend::Shared(redis) => match redis.get(key).await {
                Ok(Some(data)) => match serde_json::from_str::<Envelope>(&data) {
                    Ok(envelope) => Some(envelope),
                    Err(e) => {
                        warn!("cache: undecodable entry {}: {}", key, e);
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!("cache: redis GET {} failed: {}", key, e);
                    None
                }
            },
        }
    }

    async fn set(&self, key: &str, envelope: &Envelope, ttl: Duration) {
        match self {
            CacheBackend::Local(local) => local.set(key, envelope.clone(), ttl),
            CacheBackend::Shared(redis) => {
                let data = match serde_json::to_string(envelope) {
                    Ok(data) => data,
                    Err(e) => {
                        warn!("cache: cannot encode entry {}: {}", key, e);
                        return;
                    }
                };
                if let Err(e) = redis.set(key, data, ttl).await {
                    warn!("cache: redis SET {} failed: {}", key, e);
                }
            }
        }
    }
}

type Flight = Shared<BoxFuture<'static, Result<Envelope, String>>>;

/// Fetches in progress plus the last envelope each one produced. Both live under one
/// lock so a reader can never miss a flight that finished between its backend read and
/// its flight lookup.
#[derive(Default)]
struct Flights {
    running: HashMap<String, Flight>,
    landed: HashMap<String, Envelope>,
}

struct Inner {
    backend: CacheBackend,
    flights: Mutex<Flights>,
    retention: Duration,
    prefix: String,
}

impl Inner {
    fn key(&self, fingerprint: &str) -> String {
        format!("{}{}", self.prefix, fingerprint)
    }

    fn flights(&self) -> std::sync::MutexGuard<'_, Flights> {
        self.flights.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct TelemetryCache {
    inner: Arc<Inner>,
    freshness: Duration,
}

impl TelemetryCache {
    pub fn new(backend: CacheBackend, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                flights: Mutex::new(Flights::default()),
                retention: Duration::from_secs(config.stale_retention_seconds),
                prefix: config.key_prefix.clone(),
            }),
            freshness: config.freshness(),
        }
    }

    /// Select the backend per `config` and build the cache on top of it.
    pub async fn connect(config: &CacheConfig) -> Self {
        Self::new(CacheBackend::select(config).await, config)
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.inner.backend
    }

    pub async fn get<F, Fut, E>(&self, fingerprint: &str, fetch: F) -> Result<CacheRead, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.get_with_window(fingerprint, fetch, self.freshness).await
    }

    /// Serve `fingerprint` if fetched within `window`, otherwise join or start the fetch.
    pub async fn get_with_window<F, Fut, E>(
        &self,
        fingerprint: &str,
        fetch: F,
        window: Duration,
    ) -> Result<CacheRead, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let key = self.inner.key(fingerprint);
        let cached = self.inner.backend.get(&key).await;
        if let Some(envelope) = &cached {
            if envelope.age() < window {
                debug!("cache: hit {} (age {:?})", fingerprint, envelope.age());
                return Ok(CacheRead::fresh(envelope.clone()));
            }
        }

        let flight = self.join_or_start(fingerprint, key, fetch, window);
        match flight.await {
            Ok(envelope) => Ok(CacheRead::fresh(envelope)),
            Err(fetch_error) => match cached {
                Some(envelope) => {
                    warn!(
                        "cache: refetch of {} failed ({}), serving value from {}",
                        fingerprint,
                        fetch_error,
                        envelope.fetched_at.format("%Y-%m-%dT%H:%M:%SZ")
                    );
                    Ok(CacheRead {
                        value: envelope.value,
                        fetched_at: envelope.fetched_at,
                        freshness: Freshness::Stale { fetch_error },
                    })
                }
                None => Err(CacheError::Fetch(fetch_error)),
            },
        }
    }

    fn join_or_start<F, Fut, E>(&self, fingerprint: &str, key: String, fetch: F, window: Duration) -> Flight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut flights = self.inner.flights();
        if let Some(existing) = flights.running.get(fingerprint) {
            debug!("cache: joining in-flight fetch for {}", fingerprint);
            return existing.clone();
        }
        match flights.landed.get(fingerprint) {
            Some(envelope) if envelope.age() < window => {
                debug!("cache: fetch for {} landed while reading the backend", fingerprint);
                let envelope = envelope.clone();
                return futures::future::ready(Ok::<_, String>(envelope)).boxed().shared();
            }
            Some(_) => {
                flights.landed.remove(fingerprint);
            }
            None => {}
        }

        debug!("cache: fetching {}", fingerprint);
        let pending = fetch();
        let inner = Arc::clone(&self.inner);
        let owned_fingerprint = fingerprint.to_string();
        let flight: Flight = async move {
            let outcome = match pending.await {
                Ok(value) => {
                    let envelope = Envelope {
                        fetched_at: Utc::now(),
                        value,
                    };
                    inner.backend.set(&key, &envelope, inner.retention).await;
                    Ok(envelope)
                }
                Err(e) => Err(e.to_string()),
            };
            let mut flights = inner.flights();
            flights.running.remove(&owned_fingerprint);
            if let Ok(envelope) = &outcome {
                flights.landed.insert(owned_fingerprint, envelope.clone());
            }
            outcome
        }
        .boxed()
        .shared();
        flights.running.insert(fingerprint.to_string(), flight.clone());
        flight
    }

    pub async fn entry_state(&self, fingerprint: &str) -> EntryState {
        if self.inner.flights().running.contains_key(fingerprint) {
            return EntryState::Fetching;
        }
        match self.inner.backend.get(&self.inner.key(fingerprint)).await {
            Some(_) => EntryState::Ready,
            None => EntryState::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> TelemetryCache {
        TelemetryCache::new(CacheBackend::local(), &CacheConfig::default())
    }

    #[tokio::test]
    async fn fresh_entry_skips_fetch() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let read = cache
                .get("nodes", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(serde_json::json!({"count": 1}))
                })
                .await
                .unwrap();
            assert_eq!(read.freshness, Freshness::Fresh);
            assert_eq!(read.value["count"], 1);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.entry_state("nodes").await, EntryState::Ready);
        assert_eq!(cache.entry_state("positions").await, EntryState::Empty);
    }

    #[tokio::test]
    async fn stale_value_served_when_refetch_fails() {
        let cache = cache();
        cache
            .get("positions", || async { Ok::<_, String>(serde_json::json!([1, 2])) })
            .await
            .unwrap();

        let read = cache
            .get_with_window(
                "positions",
                || async { Err::<Value, _>("radio busy") },
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert!(read.is_stale());
        assert_eq!(read.value, serde_json::json!([1, 2]));
        match read.freshness {
            Freshness::Stale { fetch_error } => assert_eq!(fetch_error, "radio busy"),
            Freshness::Fresh => unreachable!(),
        }
    }

    #[tokio::test]
    async fn failure_without_prior_value_propagates() {
        let err = cache()
            .get("node:!9ee6fc30", || async { Err::<Value, _>("exit 1") })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Fetch(msg) if msg == "exit 1"));
    }

    #[tokio::test]
    async fn failed_flight_is_cleared_for_the_next_reader() {
        let cache = cache();
        assert!(cache
            .get("nodes", || async { Err::<Value, _>("down") })
            .await
            .is_err());
        assert_eq!(cache.entry_state("nodes").await, EntryState::Empty);
        let read = cache
            .get("nodes", || async { Ok::<_, String>(Value::Bool(true)) })
            .await
            .unwrap();
        assert_eq!(read.value, Value::Bool(true));
    }

    #[tokio::test]
    async fn reader_arriving_after_a_flight_landed_does_not_refetch() {
        let cache = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(serde_json::json!({"count": 2}))
            }
        };

        // Both readers missed the backend before either flight started.
        let first = cache.join_or_start("nodes", cache.inner.key("nodes"), counted(calls.clone()), cache.freshness);
        first.await.unwrap();
        let second = cache.join_or_start("nodes", cache.inner.key("nodes"), counted(calls.clone()), cache.freshness);
        assert_eq!(second.await.unwrap().value["count"], 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let expired = cache.join_or_start("nodes", cache.inner.key("nodes"), counted(calls.clone()), Duration::ZERO);
        expired.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn local_entries_expire() {
        let local = LocalBackend::default();
        let envelope = Envelope {
            fetched_at: Utc::now(),
            value: Value::Null,
        };
        local.set("k", envelope.clone(), Duration::from_secs(60));
        assert_eq!(local.get("k"), Some(envelope.clone()));
        local.set("k", envelope, Duration::ZERO);
        assert!(local.get("k").is_none());
    }
}
