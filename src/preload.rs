use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::client::ManagementClient;
use crate::config_cache::ConfigCache;
use crate::error::FetchError;
use crate::session::{ConnectionStatus, SessionStore};

pub const USAGE_PATH: &str = "/usage";
pub const PROVIDERS_PATH: &str = "/openai-compatibility";
pub const AUTH_FILES_PATH: &str = "/auth-files";
pub const API_KEYS_PATH: &str = "/api-keys";

/// A data source warmed when a protected view is entered.
#[async_trait]
pub trait FeaturePreload: Send + Sync {
    fn name(&self) -> &str;
    async fn preload(&self) -> Result<(), FetchError>;
}

#[async_trait]
impl FeaturePreload for ConfigCache {
    fn name(&self) -> &str {
        "config"
    }

    async fn preload(&self) -> Result<(), FetchError> {
        self.fetch_config(false).await.map(|_| ())
    }
}

/// Last payload of one management endpoint.
pub struct FeatureStore {
    name: String,
    path: String,
    client: Arc<ManagementClient>,
    data: Mutex<Option<Arc<JsonValue>>>,
}

impl FeatureStore {
    pub fn new(name: impl Into<String>, path: impl Into<String>, client: Arc<ManagementClient>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            client,
            data: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> Option<Arc<JsonValue>> {
        self.data.lock().ok().and_then(|d| d.clone())
    }

    pub async fn refresh(&self) -> Result<Arc<JsonValue>, FetchError> {
        let value = Arc::new(self.client.get_json(&self.path).await?);
        if let Ok(mut slot) = self.data.lock() {
            *slot = Some(value.clone());
        }
        Ok(value)
    }
}

#[async_trait]
impl FeaturePreload for FeatureStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn preload(&self) -> Result<(), FetchError> {
        self.refresh().await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadPhase {
    #[default]
    Idle,
    Restoring,
    Preloading,
    Ready,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    /// `(feature, error message)` for every preload that failed.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    /// The protected view may render; some features may have failed to load.
    Ready(PreloadReport),
    /// No usable session: send the user to the login view.
    Redirect,
}

/// Route-guard state machine: restore the session, then warm every feature store.
pub struct PreloadOrchestrator {
    session: SessionStore,
    features: Vec<Arc<dyn FeaturePreload>>,
    phase: Mutex<PreloadPhase>,
}

impl PreloadOrchestrator {
    pub fn new(session: SessionStore, features: Vec<Arc<dyn FeaturePreload>>) -> Self {
        Self {
            session,
            features,
            phase: Mutex::new(PreloadPhase::Idle),
        }
    }

    /// Config cache plus the usage, provider, auth-file and API-key stores.
    pub fn standard(session: SessionStore, config: ConfigCache) -> Self {
        let client = session.client().clone();
        let features: Vec<Arc<dyn FeaturePreload>> = vec![
            Arc::new(config),
            Arc::new(FeatureStore::new("usage", USAGE_PATH, client.clone())),
            Arc::new(FeatureStore::new("providers", PROVIDERS_PATH, client.clone())),
            Arc::new(FeatureStore::new("auth-files", AUTH_FILES_PATH, client.clone())),
            Arc::new(FeatureStore::new("api-keys", API_KEYS_PATH, client)),
        ];
        Self::new(session, features)
    }

    fn phase_guard(&self) -> MutexGuard<'_, PreloadPhase> {
        match self.phase.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub fn phase(&self) -> PreloadPhase {
        *self.phase_guard()
    }

    fn set_phase(&self, phase: PreloadPhase) {
        *self.phase_guard() = phase;
        debug!("preload phase -> {:?}", phase);
    }

    fn is_connected(&self) -> bool {
        self.session.is_authenticated()
            && self.session.connection_status() == ConnectionStatus::Connected
    }

    pub async fn enter_protected_view(&self) -> GuardOutcome {
        if !self.is_connected() {
            if !self.session.has_persisted_session() {
                self.set_phase(PreloadPhase::Idle);
                return GuardOutcome::Redirect;
            }
            self.set_phase(PreloadPhase::Restoring);
            if !self.session.restore_session().await || !self.is_connected() {
                self.set_phase(PreloadPhase::Idle);
                return GuardOutcome::Redirect;
            }
        }

        self.set_phase(PreloadPhase::Preloading);
        let report = self.preload_all().await;
        self.set_phase(PreloadPhase::Ready);
        info!(
            "protected view ready ({} loaded, {} failed)",
            report.loaded.len(),
            report.failed.len()
        );
        GuardOutcome::Ready(report)
    }

    async fn preload_all(&self) -> PreloadReport {
        let results = join_all(self.features.iter().map(|feature| async move {
            (feature.name().to_string(), feature.preload().await)
        }))
        .await;

        let mut report = PreloadReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => report.loaded.push(name),
                Err(err) => {
                    warn!("preload of {} failed: {}", name, err);
                    report.failed.push((name, err.to_string()));
                }
            }
        }
        report
    }
}
