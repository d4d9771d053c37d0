use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::client::ManagementClient;
use crate::clock::Clock;
use crate::config::DEFAULT_FRESHNESS_MS;
use crate::error::FetchError;

pub const CONFIG_PATH: &str = "/config";

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    pub value: Arc<JsonValue>,
    pub fetched_at_ms: u64,
}

type FetchResult = Result<Arc<JsonValue>, FetchError>;
type PendingFetch = Shared<BoxFuture<'static, FetchResult>>;

#[derive(Default)]
struct CacheState {
    snapshot: Option<ConfigSnapshot>,
    /// Bumped on every fetch issue and every `clear_cache`.
    generation: u64,
    in_flight: Option<PendingFetch>,
    loading: bool,
    error: Option<String>,
}

struct CacheInner {
    client: Arc<ManagementClient>,
    clock: Arc<dyn Clock>,
    freshness_ms: u64,
    state: Mutex<CacheState>,
}

/// In-memory cache of the server configuration object.
///
/// A fresh snapshot is served without network access. Concurrent misses share one
/// request. A fetch only writes back if no `clear_cache` (or newer fetch) happened
/// while it was in flight; its caller still receives the fetched value.
#[derive(Clone)]
pub struct ConfigCache {
    inner: Arc<CacheInner>,
}

impl ConfigCache {
    pub fn new(client: Arc<ManagementClient>, clock: Arc<dyn Clock>) -> Self {
        Self::with_freshness(client, clock, DEFAULT_FRESHNESS_MS)
    }

    pub fn with_freshness(
        client: Arc<ManagementClient>,
        clock: Arc<dyn Clock>,
        freshness_ms: u64,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                client,
                clock,
                freshness_ms,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub async fn fetch_config(&self, force_refresh: bool) -> FetchResult {
        let pending = {
            let mut st = self.state();
            if !force_refresh && let Some(snapshot) = &st.snapshot {
                let age = self.inner.clock.now_ms().saturating_sub(snapshot.fetched_at_ms);
                if age < self.inner.freshness_ms {
                    return Ok(snapshot.value.clone());
                }
            }
            match &st.in_flight {
                Some(pending) => pending.clone(),
                None => {
                    st.generation = st.generation.wrapping_add(1);
                    let generation = st.generation;
                    st.loading = true;
                    let pending = self.clone().run_fetch(generation).boxed().shared();
                    st.in_flight = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_fetch(self, generation: u64) -> FetchResult {
        debug!("fetching config (generation {})", generation);
        let result = self.inner.client.get_json(CONFIG_PATH).await.map(Arc::new);

        let mut st = self.state();
        if st.generation != generation {
            debug!(
                "discarding config fetch of generation {} (current {})",
                generation, st.generation
            );
            return result;
        }
        st.in_flight = None;
        st.loading = false;
        match &result {
            Ok(value) => {
                st.snapshot = Some(ConfigSnapshot {
                    value: value.clone(),
                    fetched_at_ms: self.inner.clock.now_ms(),
                });
                st.error = None;
            }
            Err(err) => {
                warn!("config fetch failed: {}", err);
                st.error = Some(err.to_string());
            }
        }
        result
    }

    /// Optimistically set `key` on the cached object. No network effect.
    pub fn update_config_value(&self, key: &str, value: JsonValue) {
        let mut st = self.state();
        let Some(snapshot) = st.snapshot.as_mut() else {
            return;
        };
        match Arc::make_mut(&mut snapshot.value) {
            JsonValue::Object(map) => {
                map.insert(key.to_string(), value);
            }
            _ => debug!("cached config is not an object; ignoring update of {}", key),
        }
    }

    pub fn clear_cache(&self) {
        let mut st = self.state();
        st.generation = st.generation.wrapping_add(1);
        st.snapshot = None;
        st.error = None;
        st.loading = false;
        st.in_flight = None;
    }

    pub fn cached(&self) -> Option<ConfigSnapshot> {
        self.state().snapshot.clone()
    }

    pub fn fetched_at_ms(&self) -> Option<u64> {
        self.state().snapshot.as_ref().map(|s| s.fetched_at_ms)
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().error.clone()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::future::join_all;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::client::testing::FakeTransport;
    use crate::clock::ManualClock;
    use crate::error::TransportError;

    fn setup() -> (Arc<FakeTransport>, Arc<ManualClock>, ConfigCache) {
        let transport = FakeTransport::new();
        let client = ManagementClient::new(transport.clone());
        client.configure("http://h", "k");
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = ConfigCache::new(client, clock.clone());
        (transport, clock, cache)
    }

    #[tokio::test]
    async fn fresh_cache_is_served_without_network() {
        let (transport, clock, cache) = setup();
        transport.push_json(200, json!({ "debug": true }));
        transport.push_json(200, json!({ "debug": false }));

        let a = cache.fetch_config(false).await.expect("first");
        assert_eq!(cache.fetched_at_ms(), Some(1_000_000));
        clock.advance_ms(29_999);
        let b = cache.fetch_config(false).await.expect("second");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.call_count(), 1);

        clock.advance_ms(1);
        let c = cache.fetch_config(false).await.expect("stale");
        assert_eq!(*c, json!({ "debug": false }));
        assert_eq!(transport.call_count(), 2);
        assert_eq!(cache.fetched_at_ms(), Some(1_030_000));
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_cache() {
        let (transport, _clock, cache) = setup();
        transport.push_json(200, json!({ "n": 1 }));
        transport.push_json(200, json!({ "n": 2 }));
        cache.fetch_config(false).await.expect("first");
        let v = cache.fetch_config(true).await.expect("forced");
        assert_eq!(*v, json!({ "n": 2 }));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_request() {
        let (transport, _clock, cache) = setup();
        transport.hold();
        transport.push_json(200, json!({ "port": 8317 }));

        let calls = join_all((0..8).map(|i| cache.fetch_config(i % 2 == 0)));
        let release = async {
            transport.wait_started().await;
            assert!(cache.is_loading());
            transport.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        assert_eq!(transport.call_count(), 1);
        let first = results[0].clone().expect("ok");
        for r in results {
            assert!(Arc::ptr_eq(&first, &r.expect("ok")));
        }
        assert!(!cache.is_loading());
    }

    #[tokio::test]
    async fn concurrent_callers_share_the_same_error() {
        let (transport, _clock, cache) = setup();
        transport.hold();
        transport.push_error(TransportError::Connect("refused".to_string()));

        let calls = join_all((0..3).map(|_| cache.fetch_config(false)));
        let release = async {
            transport.wait_started().await;
            transport.release();
        };
        let (results, ()) = tokio::join!(calls, release);

        let expected = Err(FetchError::Network(
            "connection failed: refused".to_string(),
        ));
        assert_eq!(results, vec![expected.clone(), expected.clone(), expected]);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(
            cache.last_error().as_deref(),
            Some("network error: connection failed: refused")
        );
        assert!(cache.cached().is_none());
    }

    #[tokio::test]
    async fn clear_during_fetch_delivers_value_but_keeps_cache_empty() {
        let (transport, _clock, cache) = setup();
        transport.hold();
        transport.push_json(200, json!({ "stale": true }));

        let fetch = cache.fetch_config(false);
        let clear = async {
            transport.wait_started().await;
            assert_eq!(cache.generation(), 1);
            cache.clear_cache();
            assert_eq!(cache.generation(), 2);
            transport.release();
        };
        let (result, ()) = tokio::join!(fetch, clear);

        assert_eq!(*result.expect("delivered"), json!({ "stale": true }));
        assert_eq!(cache.generation(), 2);
        assert_eq!(cache.fetched_at_ms(), None);
        assert!(cache.cached().is_none());
        assert!(cache.last_error().is_none());
        assert!(!cache.is_loading());
    }

    #[tokio::test]
    async fn failure_superseded_by_clear_records_no_error() {
        let (transport, _clock, cache) = setup();
        transport.hold();
        transport.push_error(TransportError::Connect("refused".to_string()));

        let fetch = cache.fetch_config(false);
        let clear = async {
            transport.wait_started().await;
            cache.clear_cache();
            transport.release();
        };
        let (result, ()) = tokio::join!(fetch, clear);

        assert_eq!(
            result,
            Err(FetchError::Network("connection failed: refused".to_string()))
        );
        assert_eq!(cache.last_error(), None);
        assert!(!cache.is_loading());
        assert!(cache.cached().is_none());
    }

    #[tokio::test]
    async fn stale_fetch_does_not_overwrite_newer_result() {
        let (transport, _clock, cache) = setup();
        transport.hold();
        transport.push_json(200, json!({ "v": 1 }));
        transport.push_json(200, json!({ "v": 2 }));

        let first = cache.fetch_config(false);
        let driver = async {
            transport.wait_started().await;
            cache.clear_cache();
            let second = cache.fetch_config(false);
            let release = async {
                tokio::task::yield_now().await;
                transport.release();
            };
            let (second, ()) = tokio::join!(second, release);
            second
        };
        let (first, second) = tokio::join!(first, driver);

        assert!(first.is_ok());
        let second = second.expect("second");
        assert_eq!(transport.call_count(), 2);
        let cached = cache.cached().expect("cached");
        assert!(Arc::ptr_eq(&cached.value, &second));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_stale_value() {
        let (transport, clock, cache) = setup();
        transport.push_json(200, json!({ "a": 1 }));
        cache.fetch_config(false).await.expect("first");

        clock.advance_ms(60_000);
        transport.push_json(503, json!({ "error": "maintenance" }));
        let err = cache.fetch_config(false).await.expect_err("fails");
        assert_eq!(
            err,
            FetchError::Http {
                status: 503,
                message: "maintenance".to_string()
            }
        );
        assert_eq!(*cache.cached().expect("kept").value, json!({ "a": 1 }));
        assert_eq!(cache.last_error().as_deref(), Some("HTTP 503: maintenance"));
    }

    #[tokio::test]
    async fn update_config_value_is_local_and_copy_on_write() {
        let (transport, _clock, cache) = setup();
        cache.update_config_value("debug", json!(true));
        assert!(cache.cached().is_none());

        transport.push_json(200, json!({ "debug": false }));
        let before = cache.fetch_config(false).await.expect("fetch");
        cache.update_config_value("debug", json!(true));

        assert_eq!(*before, json!({ "debug": false }));
        let after = cache.fetch_config(false).await.expect("cached");
        assert_eq!(*after, json!({ "debug": true }));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn fetch_without_login_reports_not_configured() {
        let transport = FakeTransport::new();
        let client = ManagementClient::new(transport.clone());
        let cache = ConfigCache::new(client, Arc::new(ManualClock::new(0)));
        assert_eq!(
            cache.fetch_config(false).await,
            Err(FetchError::NotConfigured)
        );
        assert_eq!(cache.last_error().as_deref(), Some("management client is not connected"));
    }
}
