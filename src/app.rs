use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::client::ManagementClient;
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::config_cache::ConfigCache;
use crate::preload::{FeatureStore, PreloadOrchestrator, USAGE_PATH};
use crate::session::SessionStore;
use crate::storage::{FileStorage, KeyValueStorage};
use crate::transport::{HttpTransport, ReqwestTransport};

/// The wired-up core: one session store and one config cache sharing a management client.
#[derive(Clone)]
pub struct Console {
    pub settings: AppConfig,
    pub session: SessionStore,
    pub config: ConfigCache,
    pub clock: Arc<dyn Clock>,
}

impl Console {
    /// reqwest transport, file-backed storage, system clock.
    pub fn from_settings(settings: AppConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new()?);
        let storage_path = settings.storage_path();
        debug!("using session storage at {:?}", storage_path);
        let storage = Arc::new(FileStorage::open(storage_path)?);
        Ok(Self::with_parts(settings, transport, storage, Arc::new(SystemClock)))
    }

    pub fn with_parts(
        settings: AppConfig,
        transport: Arc<dyn HttpTransport>,
        storage: Arc<dyn KeyValueStorage>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = ManagementClient::new(transport);
        let session = SessionStore::with_timeout(client.clone(), storage, settings.auth.timeout());
        let config = ConfigCache::with_freshness(client, clock.clone(), settings.cache.freshness_ms);
        Self {
            settings,
            session,
            config,
            clock,
        }
    }

    pub fn client(&self) -> &Arc<ManagementClient> {
        self.session.client()
    }

    pub fn orchestrator(&self) -> PreloadOrchestrator {
        PreloadOrchestrator::standard(self.session.clone(), self.config.clone())
    }

    pub fn usage_store(&self) -> FeatureStore {
        FeatureStore::new("usage", USAGE_PATH, self.client().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::client::testing::FakeTransport;
    use crate::clock::ManualClock;
    use crate::preload::GuardOutcome;
    use crate::storage::MemoryStorage;
    use crate::usage::{aggregate, collect_usage_details};

    #[tokio::test]
    async fn freshness_window_comes_from_settings() {
        let mut settings = AppConfig::default();
        settings.cache.freshness_ms = 1_000;
        let transport = FakeTransport::new();
        let clock = Arc::new(ManualClock::new(0));
        let console = Console::with_parts(
            settings,
            transport.clone(),
            Arc::new(MemoryStorage::new()),
            clock.clone(),
        );

        transport.push_response(200, json!({}), &[]);
        console.session.login("h", "k").await.expect("login");

        transport.push_json(200, json!({ "n": 1 }));
        transport.push_json(200, json!({ "n": 2 }));
        console.config.fetch_config(false).await.expect("first");
        clock.advance_ms(1_000);
        let v = console.config.fetch_config(false).await.expect("second");
        assert_eq!(*v, json!({ "n": 2 }));
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn preload_then_aggregate_usage_end_to_end() {
        let transport = FakeTransport::new();
        let console = Console::with_parts(
            AppConfig::default(),
            transport.clone(),
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(0)),
        );
        transport.push_response(200, json!({}), &[]);
        console.session.login("h", "k").await.expect("login");

        let usage = json!({
            "usage": { "apis": { "api": { "models": { "m": { "details": [
                { "timestamp": "2025-06-01T00:00:00Z", "source": "a", "failed": false },
                { "timestamp": "2025-06-01T00:00:01Z", "source": "a", "failed": true }
            ] } } } } }
        });
        transport.push_json(200, usage);
        let store = console.usage_store();
        let payload = store.refresh().await.expect("usage");
        let agg = aggregate(&collect_usage_details(&payload));
        assert_eq!(agg.by_source["a"].success_rate, 50.0);

        for _ in 0..5 {
            transport.push_json(200, json!({}));
        }
        let outcome = console.orchestrator().enter_protected_view().await;
        assert!(matches!(outcome, GuardOutcome::Ready(r) if r.failed.is_empty()));
    }
}
