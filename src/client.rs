use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::error::{FetchError, TransportError};
use crate::logging::mask_secret;
use crate::transport::{HttpResponse, HttpTransport};

/// Path prefix of every management endpoint.
pub const MANAGEMENT_API_PREFIX: &str = "/v0/management";

/// Called on every 401. Returning `false` unregisters the handler.
pub type UnauthorizedHandler = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct Target {
    api_base: String,
    credential: String,
}

/// Authenticated access to the management API.
///
/// Holds the endpoint/credential pair set by a successful login. A 401 from any call
/// is reported to every handler registered through [`ManagementClient::on_unauthorized`].
pub struct ManagementClient {
    transport: Arc<dyn HttpTransport>,
    target: RwLock<Option<Target>>,
    unauthorized: Mutex<Vec<UnauthorizedHandler>>,
}

impl std::fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = self.target.read().ok().and_then(|t| t.clone());
        f.debug_struct("ManagementClient")
            .field("api_base", &target.as_ref().map(|t| t.api_base.clone()))
            .field(
                "credential",
                &target.as_ref().map(|t| mask_secret(&t.credential)),
            )
            .finish()
    }
}

pub fn management_url(api_base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    format!("{}{}/{}", api_base.trim_end_matches('/'), MANAGEMENT_API_PREFIX, path)
}

pub fn bearer_headers(credential: &str) -> Vec<(String, String)> {
    vec![
        ("Authorization".to_string(), format!("Bearer {}", credential)),
        ("Accept".to_string(), "application/json".to_string()),
    ]
}

impl ManagementClient {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            target: RwLock::new(None),
            unauthorized: Mutex::new(Vec::new()),
        })
    }

    /// Credential check used by login, bypassing the configured target.
    pub(crate) async fn check_credentials(
        &self,
        api_base: &str,
        credential: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let url = management_url(api_base, path);
        self.transport
            .get(&url, &bearer_headers(credential), Some(timeout))
            .await
    }

    pub fn configure(&self, api_base: &str, credential: &str) {
        if let Ok(mut guard) = self.target.write() {
            *guard = Some(Target {
                api_base: api_base.to_string(),
                credential: credential.to_string(),
            });
        }
        debug!(
            "management client configured for {} (key {})",
            api_base,
            mask_secret(credential)
        );
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.target.write() {
            *guard = None;
        }
    }

    pub fn is_configured(&self) -> bool {
        self.target.read().map(|t| t.is_some()).unwrap_or(false)
    }

    pub fn api_base(&self) -> Option<String> {
        self.target
            .read()
            .ok()
            .and_then(|t| t.as_ref().map(|t| t.api_base.clone()))
    }

    pub fn on_unauthorized(&self, handler: UnauthorizedHandler) {
        if let Ok(mut handlers) = self.unauthorized.lock() {
            handlers.push(handler);
        }
    }

    fn notify_unauthorized(&self) {
        let handlers = match self.unauthorized.lock() {
            Ok(h) => h.clone(),
            Err(_) => return,
        };
        let stale: Vec<UnauthorizedHandler> =
            handlers.into_iter().filter(|handler| !handler()).collect();
        if stale.is_empty() {
            return;
        }
        if let Ok(mut handlers) = self.unauthorized.lock() {
            handlers.retain(|h| !stale.iter().any(|s| Arc::ptr_eq(h, s)));
            debug!("dropped {} stale unauthorized handler(s)", stale.len());
        }
    }

    pub fn unauthorized_handler_count(&self) -> usize {
        self.unauthorized.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub async fn get_json(&self, path: &str) -> Result<JsonValue, FetchError> {
        let target = self
            .target
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or(FetchError::NotConfigured)?;

        let url = management_url(&target.api_base, path);
        let resp = self
            .transport
            .get(&url, &bearer_headers(&target.credential), None)
            .await?;

        if resp.status == 401 {
            warn!("management API rejected credentials for {}", path);
            self.notify_unauthorized();
            return Err(FetchError::Unauthorized);
        }
        if !resp.is_success() {
            return Err(FetchError::Http {
                status: resp.status,
                message: resp.error_message(),
            });
        }
        resp.json().map_err(|e| FetchError::Decode(e.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::FakeTransport;
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn management_url_joins_prefix() {
        assert_eq!(
            management_url("http://localhost:8317/", "/config"),
            "http://localhost:8317/v0/management/config"
        );
        assert_eq!(
            management_url("https://a.example", "auth-files"),
            "https://a.example/v0/management/auth-files"
        );
    }

    #[tokio::test]
    async fn get_json_requires_configuration() {
        let transport = FakeTransport::new();
        let client = ManagementClient::new(transport.clone());
        assert_eq!(
            client.get_json("/config").await,
            Err(FetchError::NotConfigured)
        );
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn unauthorized_response_fires_handlers() {
        let transport = FakeTransport::new();
        transport.push_json(401, serde_json::json!({ "error": "invalid key" }));
        let client = ManagementClient::new(transport.clone());
        client.configure("http://h", "k");

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        client.on_unauthorized(Arc::new(move || {
            f.fetch_add(1, Ordering::SeqCst);
            true
        }));

        assert_eq!(client.get_json("/config").await, Err(FetchError::Unauthorized));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_returning_false_are_dropped_after_firing() {
        let transport = FakeTransport::new();
        transport.push_json(401, serde_json::json!({}));
        transport.push_json(401, serde_json::json!({}));
        let client = ManagementClient::new(transport.clone());
        client.configure("http://h", "k");

        let kept = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));
        let k = kept.clone();
        client.on_unauthorized(Arc::new(move || {
            k.fetch_add(1, Ordering::SeqCst);
            true
        }));
        let d = dropped.clone();
        client.on_unauthorized(Arc::new(move || {
            d.fetch_add(1, Ordering::SeqCst);
            false
        }));
        assert_eq!(client.unauthorized_handler_count(), 2);

        client.get_json("/config").await.expect_err("first 401");
        assert_eq!(client.unauthorized_handler_count(), 1);
        client.get_json("/config").await.expect_err("second 401");

        assert_eq!(kept.load(Ordering::SeqCst), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn http_error_carries_upstream_message() {
        let transport = FakeTransport::new();
        transport.push_json(500, serde_json::json!({ "message": "boom" }));
        let client = ManagementClient::new(transport.clone());
        client.configure("http://h", "k");
        assert_eq!(
            client.get_json("/usage").await,
            Err(FetchError::Http {
                status: 500,
                message: "boom".to_string()
            })
        );
        assert_eq!(
            transport.urls.lock().expect("urls").as_slice(),
            ["http://h/v0/management/usage".to_string()]
        );
    }

    #[test]
    fn debug_output_masks_credential() {
        let client = ManagementClient::new(FakeTransport::new());
        client.configure("http://h", "super-secret-key");
        let text = format!("{:?}", client);
        assert!(!text.contains("super-secret-key"), "{text}");
    }
}
