//! ============================================================================
//! Data Source Resolver - Cached, coalesced widget data fetches
//! ============================================================================
//! Resolves a `DataRequest` to a `DataState`:
//! - Cache hit inside the freshness window -> `Fresh` without a fetch
//! - Fetch failure with a cached value -> `Stale` (stale-while-revalidate)
//! - Fetch failure without a cached value -> `Unavailable`
//! - Caller's token cancelled -> `Cancelled`
//!
//! Concurrent requests for one key share one in-flight fetch. A waiter that
//! cancels leaves the fetch running for the others; once the last waiter is
//! gone the fetch is dropped. Cancellation never touches the cache.
//! ============================================================================

mod backend;
mod request;

pub use backend::{DataBackend, HttpBackend};
pub(crate) use backend::join_url;
pub use request::DataRequest;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CoreConfig;

/// Why a fetch produced no fresh value
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("No bearer token available")]
    Unauthorized,

    #[error("Fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("No binding for placeholder '{{{0}}}'")]
    MissingParameter(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

/// What a widget gets back. Failures are states, never errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DataState {
    #[serde(rename_all = "camelCase")]
    Fresh {
        value: Value,
        fetched_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Stale {
        value: Value,
        fetched_at: DateTime<Utc>,
        reason: String,
    },
    Unavailable { reason: String },
    Cancelled,
}

impl DataState {
    pub fn value(&self) -> Option<&Value> {
        match self {
            DataState::Fresh { value, .. } | DataState::Stale { value, .. } => Some(value),
            DataState::Unavailable { .. } | DataState::Cancelled => None,
        }
    }
}

/// `Cached` honours the freshness window; `Fresh` always refetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Cached,
    Fresh,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    fetched_at: DateTime<Utc>,
    stored_at: Instant,
}

type FetchResult = Result<(Value, DateTime<Utc>), FetchError>;
type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
type InFlightMap = Arc<Mutex<HashMap<DataRequest, InFlight>>>;
type Cache = Arc<RwLock<HashMap<DataRequest, CachedValue>>>;

struct InFlight {
    fetch: SharedFetch,
    waiters: usize,
    generation: u64,
}

/// Leaves the in-flight entry when dropped; the last waiter out removes it,
/// which drops the shared future and with it the fetch.
struct WaiterGuard {
    in_flight: InFlightMap,
    request: DataRequest,
    generation: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let mut map = lock(&self.in_flight);
        if let Some(entry) = map.get_mut(&self.request) {
            if entry.generation != self.generation {
                return;
            }
            entry.waiters = entry.waiters.saturating_sub(1);
            if entry.waiters == 0 {
                map.remove(&self.request);
                debug!("Last waiter left, dropped fetch for {}", self.request);
            }
        }
    }
}

fn lock(map: &InFlightMap) -> MutexGuard<'_, HashMap<DataRequest, InFlight>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared resolver; one per process, passed to every view
pub struct DataSourceResolver {
    backend: Arc<dyn DataBackend>,
    cache: Cache,
    in_flight: InFlightMap,
    freshness: Duration,
    capacity: usize,
    timeout: Duration,
    next_generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DataSourceResolver {
    pub fn new(
        backend: Arc<dyn DataBackend>,
        freshness: Duration,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            freshness,
            capacity: capacity.max(1),
            timeout,
            next_generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn from_config(backend: Arc<dyn DataBackend>, config: &CoreConfig) -> Self {
        Self::new(
            backend,
            config.cache_freshness,
            config.cache_capacity,
            config.fetch_timeout,
        )
    }

    pub async fn resolve(
        &self,
        request: &DataRequest,
        mode: ResolveMode,
        cancel: &CancellationToken,
    ) -> DataState {
        if mode == ResolveMode::Cached {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(request) {
                if cached.stored_at.elapsed() < self.freshness {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit for {}", request);
                    return DataState::Fresh {
                        value: cached.value.clone(),
                        fetched_at: cached.fetched_at,
                    };
                }
            }
        }

        if cancel.is_cancelled() {
            return DataState::Cancelled;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let (fetch, guard) = self.join_fetch(request);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = fetch => Some(result),
        };
        drop(guard);

        match result {
            None | Some(Err(FetchError::Cancelled)) => DataState::Cancelled,
            Some(Ok((value, fetched_at))) => DataState::Fresh { value, fetched_at },
            Some(Err(err)) => {
                let cache = self.cache.read().await;
                match cache.get(request) {
                    Some(cached) => {
                        warn!("Serving stale data for {}: {}", request, err);
                        DataState::Stale {
                            value: cached.value.clone(),
                            fetched_at: cached.fetched_at,
                            reason: err.to_string(),
                        }
                    }
                    None => {
                        warn!("No data for {}: {}", request, err);
                        DataState::Unavailable {
                            reason: err.to_string(),
                        }
                    }
                }
            }
        }
    }

    /// Join the in-flight fetch for this key, starting one if none exists
    fn join_fetch(&self, request: &DataRequest) -> (SharedFetch, WaiterGuard) {
        let mut map = lock(&self.in_flight);

        if let Some(entry) = map.get_mut(request) {
            entry.waiters += 1;
            debug!("Coalesced onto in-flight fetch for {}", request);
            return (
                entry.fetch.clone(),
                WaiterGuard {
                    in_flight: self.in_flight.clone(),
                    request: request.clone(),
                    generation: entry.generation,
                },
            );
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let fetch = fetch_and_store(
            self.backend.clone(),
            request.clone(),
            self.timeout,
            self.cache.clone(),
            self.capacity,
            self.in_flight.clone(),
            generation,
        )
        .boxed()
        .shared();

        map.insert(
            request.clone(),
            InFlight {
                fetch: fetch.clone(),
                waiters: 1,
                generation,
            },
        );

        (
            fetch,
            WaiterGuard {
                in_flight: self.in_flight.clone(),
                request: request.clone(),
                generation,
            },
        )
    }

    /// Drop one cached value; returns whether it was present
    pub async fn invalidate(&self, request: &DataRequest) -> bool {
        self.cache.write().await.remove(request).is_some()
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            entries: self.cache.read().await.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            in_flight: lock(&self.in_flight).len(),
        }
    }
}

async fn fetch_and_store(
    backend: Arc<dyn DataBackend>,
    request: DataRequest,
    timeout: Duration,
    cache: Cache,
    capacity: usize,
    in_flight: InFlightMap,
    generation: u64,
) -> FetchResult {
    debug!("Fetching {}", request);

    let result = match tokio::time::timeout(timeout, backend.fetch(&request)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout {
            after_ms: timeout.as_millis() as u64,
        }),
    };

    let outcome = match result {
        Ok(value) => {
            let fetched_at = Utc::now();
            let mut cache = cache.write().await;
            // Evict oldest entry if cache is at capacity
            if cache.len() >= capacity && !cache.contains_key(&request) {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, v)| v.stored_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest);
                }
            }
            cache.insert(
                request.clone(),
                CachedValue {
                    value: value.clone(),
                    fetched_at,
                    stored_at: Instant::now(),
                },
            );
            Ok((value, fetched_at))
        }
        Err(err) => Err(err),
    };

    let mut map = lock(&in_flight);
    if map.get(&request).is_some_and(|e| e.generation == generation) {
        map.remove(&request);
    }

    outcome
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Counts fetches per source; can be switched offline
    pub(crate) struct MockBackend {
        pub delay: Duration,
        pub offline: AtomicBool,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl MockBackend {
        pub fn new(delay: Duration) -> Self {
            Self {
                delay,
                offline: AtomicBool::new(false),
                calls: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
            }
        }

        pub fn offline(self) -> Self {
            self.offline.store(true, Ordering::SeqCst);
            self
        }

        pub fn calls(&self, source: &str) -> usize {
            self.calls.lock().unwrap().get(source).copied().unwrap_or(0)
        }

        pub fn total(&self) -> usize {
            self.total.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl DataBackend for MockBackend {
        async fn fetch(&self, request: &DataRequest) -> Result<Value, FetchError> {
            let n = self.total.fetch_add(1, Ordering::SeqCst) + 1;
            *self.calls.lock().unwrap().entry(request.source.clone()).or_default() += 1;
            tokio::time::sleep(self.delay).await;
            if self.offline.load(Ordering::SeqCst) {
                return Err(FetchError::Transport("network unreachable".into()));
            }
            Ok(json!({ "source": request.source, "fetch": n }))
        }
    }

    pub(crate) fn resolver(backend: Arc<MockBackend>) -> Arc<DataSourceResolver> {
        Arc::new(DataSourceResolver::new(
            backend,
            Duration::from_secs(60),
            16,
            Duration::from_secs(2),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{resolver, MockBackend};
    use super::*;

    #[tokio::test]
    async fn test_cache_hit_within_freshness() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO));
        let resolver = resolver(backend.clone());
        let request = DataRequest::new("/calls-today");
        let cancel = CancellationToken::new();

        assert!(matches!(
            resolver.resolve(&request, ResolveMode::Cached, &cancel).await,
            DataState::Fresh { .. }
        ));
        assert!(matches!(
            resolver.resolve(&request, ResolveMode::Cached, &cancel).await,
            DataState::Fresh { .. }
        ));
        assert_eq!(backend.total(), 1);

        resolver.resolve(&request, ResolveMode::Fresh, &cancel).await;
        assert_eq!(backend.total(), 2);

        let stats = resolver.cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(50)));
        let resolver = resolver(backend.clone());
        let request = DataRequest::new("/units");
        let cancel = CancellationToken::new();

        let (a, b, c) = tokio::join!(
            resolver.resolve(&request, ResolveMode::Fresh, &cancel),
            resolver.resolve(&request, ResolveMode::Fresh, &cancel),
            resolver.resolve(&request, ResolveMode::Fresh, &cancel),
        );

        assert_eq!(backend.total(), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(resolver.cache_stats().await.in_flight, 0);
    }

    #[tokio::test]
    async fn test_stale_while_revalidate() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO));
        let resolver = resolver(backend.clone());
        let request = DataRequest::new("/calls-today");
        let cancel = CancellationToken::new();

        let first = resolver.resolve(&request, ResolveMode::Cached, &cancel).await;
        backend.offline.store(true, Ordering::SeqCst);

        match resolver.resolve(&request, ResolveMode::Fresh, &cancel).await {
            DataState::Stale { value, reason, .. } => {
                assert_eq!(Some(&value), first.value());
                assert!(reason.contains("unreachable"));
            }
            other => panic!("expected stale, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_without_cache() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO).offline());
        let resolver = resolver(backend);
        let state = resolver
            .resolve(&DataRequest::new("/calls-today"), ResolveMode::Cached, &CancellationToken::new())
            .await;
        assert!(matches!(state, DataState::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(500)));
        let resolver = DataSourceResolver::new(
            backend,
            Duration::from_secs(60),
            16,
            Duration::from_millis(20),
        );
        let state = resolver
            .resolve(&DataRequest::new("/slow"), ResolveMode::Cached, &CancellationToken::new())
            .await;
        match state {
            DataState::Unavailable { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected unavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_fetch_for_others() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(80)));
        let resolver = resolver(backend.clone());
        let request = DataRequest::new("/units");
        let leaving = CancellationToken::new();
        let staying = CancellationToken::new();

        let cancel_soon = {
            let leaving = leaving.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                leaving.cancel();
            }
        };

        let (left, stayed, _) = tokio::join!(
            resolver.resolve(&request, ResolveMode::Fresh, &leaving),
            resolver.resolve(&request, ResolveMode::Fresh, &staying),
            cancel_soon,
        );

        assert_eq!(left, DataState::Cancelled);
        assert!(matches!(stayed, DataState::Fresh { .. }));
        assert_eq!(backend.total(), 1);
        assert_eq!(resolver.cache_stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_last_waiter_cancelling_drops_fetch() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(200)));
        let resolver = resolver(backend.clone());
        let request = DataRequest::new("/units");
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let state = resolver.resolve(&request, ResolveMode::Fresh, &cancel).await;
        assert_eq!(state, DataState::Cancelled);

        let stats = resolver.cache_stats().await;
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO));
        let resolver =
            DataSourceResolver::new(backend, Duration::from_secs(60), 2, Duration::from_secs(1));
        let cancel = CancellationToken::new();

        for source in ["/a", "/b", "/c"] {
            resolver
                .resolve(&DataRequest::new(source), ResolveMode::Cached, &cancel)
                .await;
        }
        assert_eq!(resolver.cache_stats().await.entries, 2);
        assert!(!resolver.invalidate(&DataRequest::new("/a")).await);
        assert!(resolver.invalidate(&DataRequest::new("/c")).await);
    }
}
