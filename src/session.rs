use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::client::{MANAGEMENT_API_PREFIX, ManagementClient};
use crate::config::DEFAULT_AUTH_TIMEOUT_MS;
use crate::error::AuthError;
use crate::logging::mask_secret;
use crate::storage::KeyValueStorage;
use crate::transport::HttpResponse;

/// Storage key of the persisted session record.
pub const AUTH_STORAGE_KEY: &str = "console-sync.auth";
/// Storage key of the marker that gates automatic restoration.
pub const LOGGED_IN_MARKER_KEY: &str = "console-sync.logged-in";

const LOGIN_CHECK_PATH: &str = "/config";
const SERVER_VERSION_HEADERS: [&str; 2] = ["x-cpa-version", "x-server-version"];
const SERVER_BUILD_DATE_HEADERS: [&str; 2] = ["x-cpa-build-date", "x-server-build-date"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub is_authenticated: bool,
    pub endpoint_base: String,
    pub credential: String,
    pub server_version: Option<String>,
    pub server_build_date: Option<String>,
    pub use_custom_base: bool,
    pub connection_status: ConnectionStatus,
    pub connection_error: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("is_authenticated", &self.is_authenticated)
            .field("endpoint_base", &self.endpoint_base)
            .field("credential", &mask_secret(&self.credential))
            .field("server_version", &self.server_version)
            .field("server_build_date", &self.server_build_date)
            .field("use_custom_base", &self.use_custom_base)
            .field("connection_status", &self.connection_status)
            .field("connection_error", &self.connection_error)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
struct PersistedSession {
    is_authenticated: bool,
    endpoint_base: String,
    credential: String,
    server_version: Option<String>,
    use_custom_base: bool,
}

impl From<&Session> for PersistedSession {
    fn from(s: &Session) -> Self {
        Self {
            is_authenticated: s.is_authenticated,
            endpoint_base: s.endpoint_base.clone(),
            credential: s.credential.clone(),
            server_version: s.server_version.clone(),
            use_custom_base: s.use_custom_base,
        }
    }
}

/// Normalize a user-entered management endpoint.
///
/// Trims whitespace, drops a trailing `/v0/management` and trailing slashes, and
/// defaults the scheme to `http://`. An explicit scheme is kept as typed.
pub fn normalize_api_base(input: &str) -> String {
    let input = input.trim();
    let (scheme, rest) = match input.find("://") {
        Some(idx) => input.split_at(idx + 3),
        None => ("http://", input),
    };
    let mut host = rest.trim_end_matches('/');
    if host.to_ascii_lowercase().ends_with(MANAGEMENT_API_PREFIX) {
        host = &host[..host.len() - MANAGEMENT_API_PREFIX.len()];
    }
    let host = host.trim_end_matches('/');
    if host.is_empty() {
        return String::new();
    }
    format!("{scheme}{host}")
}

fn first_header(resp: &HttpResponse, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| resp.header(name))
        .map(|v| v.trim().to_string())
}

type PendingRestore = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct SessionState {
    session: Session,
    restoring: Option<(u64, PendingRestore)>,
    next_restore_id: u64,
    /// Bumped by `logout`; a login that started under an older epoch must not write back.
    auth_epoch: u64,
}

struct SessionInner {
    client: Arc<ManagementClient>,
    storage: Arc<dyn KeyValueStorage>,
    auth_timeout: Duration,
    state: Mutex<SessionState>,
}

/// Owner of the authentication state.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<SessionInner>,
}

impl SessionStore {
    pub fn new(client: Arc<ManagementClient>, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self::with_timeout(
            client,
            storage,
            Duration::from_millis(DEFAULT_AUTH_TIMEOUT_MS),
        )
    }

    /// Rehydrate the persisted record and register the forced-logout callback on `client`.
    pub fn with_timeout(
        client: Arc<ManagementClient>,
        storage: Arc<dyn KeyValueStorage>,
        auth_timeout: Duration,
    ) -> Self {
        let session = load_persisted(storage.as_ref());
        let store = Self {
            inner: Arc::new(SessionInner {
                client,
                storage,
                auth_timeout,
                state: Mutex::new(SessionState {
                    session,
                    ..Default::default()
                }),
            }),
        };
        store.attach_unauthorized_handler();
        store
    }

    fn attach_unauthorized_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.client.on_unauthorized(Arc::new(move || {
            let Some(inner) = weak.upgrade() else {
                return false;
            };
            warn!("management API answered 401; forcing logout");
            SessionStore { inner }.logout();
            true
        }));
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        match self.inner.state.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.state().session.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().session.is_authenticated
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state().session.connection_status
    }

    pub fn client(&self) -> &Arc<ManagementClient> {
        &self.inner.client
    }

    /// Whether a previous run left the restore marker behind.
    pub fn has_persisted_session(&self) -> bool {
        self.inner
            .storage
            .get(LOGGED_IN_MARKER_KEY)
            .is_some_and(|v| v.trim() == "true")
    }

    pub fn update_connection_status(&self, status: ConnectionStatus, error: Option<String>) {
        let mut st = self.state();
        st.session.connection_status = status;
        st.session.connection_error = error;
    }

    pub fn set_use_custom_base(&self, enabled: bool) {
        let snapshot = {
            let mut st = self.state();
            st.session.use_custom_base = enabled;
            st.session.clone()
        };
        self.persist(&snapshot);
    }

    pub async fn login(&self, endpoint_base: &str, credential: &str) -> Result<Session, AuthError> {
        let api_base = normalize_api_base(endpoint_base);
        let credential = credential.trim();

        let epoch = {
            let mut st = self.state();
            if api_base.is_empty() || credential.is_empty() {
                let err = if api_base.is_empty() {
                    AuthError::MissingEndpoint
                } else {
                    AuthError::MissingCredential
                };
                st.session.connection_status = ConnectionStatus::Error;
                st.session.connection_error = Some(err.to_string());
                return Err(err);
            }
            st.session.connection_status = ConnectionStatus::Connecting;
            st.session.connection_error = None;
            st.auth_epoch
        };

        debug!("logging in to {} (key {})", api_base, mask_secret(credential));
        let outcome = self
            .inner
            .client
            .check_credentials(
                &api_base,
                credential,
                LOGIN_CHECK_PATH,
                self.inner.auth_timeout,
            )
            .await;

        let resp = match outcome {
            Ok(resp) if resp.is_success() => resp,
            Ok(resp) => {
                return Err(self.fail_login(
                    epoch,
                    AuthError::Rejected {
                        status: resp.status,
                        message: resp.error_message(),
                    },
                ));
            }
            Err(err) => return Err(self.fail_login(epoch, AuthError::from(err))),
        };

        let snapshot = {
            let mut st = self.state();
            if st.auth_epoch != epoch {
                debug!("discarding login result for {}: logged out meanwhile", api_base);
                return Err(AuthError::Superseded);
            }
            let s = &mut st.session;
            s.is_authenticated = true;
            s.endpoint_base = api_base.clone();
            s.credential = credential.to_string();
            s.server_version = first_header(&resp, &SERVER_VERSION_HEADERS);
            s.server_build_date = first_header(&resp, &SERVER_BUILD_DATE_HEADERS);
            s.connection_status = ConnectionStatus::Connected;
            s.connection_error = None;
            s.clone()
        };

        self.inner.client.configure(&api_base, credential);
        self.persist(&snapshot);
        if let Err(err) = self.inner.storage.set(LOGGED_IN_MARKER_KEY, "true") {
            warn!("failed to persist login marker: {}", err);
        }
        info!(
            "connected to {} (server version {})",
            api_base,
            snapshot.server_version.as_deref().unwrap_or("unknown")
        );
        Ok(snapshot)
    }

    fn fail_login(&self, epoch: u64, err: AuthError) -> AuthError {
        let mut st = self.state();
        if st.auth_epoch == epoch {
            st.session.connection_status = ConnectionStatus::Error;
            st.session.connection_error = Some(err.to_string());
        }
        warn!("login failed: {}", err);
        err
    }

    pub fn logout(&self) {
        let snapshot = {
            let mut st = self.state();
            st.auth_epoch = st.auth_epoch.wrapping_add(1);
            st.restoring = None;
            let s = &mut st.session;
            s.is_authenticated = false;
            s.credential.clear();
            s.server_version = None;
            s.server_build_date = None;
            s.connection_status = ConnectionStatus::Disconnected;
            s.connection_error = None;
            s.clone()
        };
        self.inner.client.clear();
        self.persist(&snapshot);
        if let Err(err) = self.inner.storage.remove(LOGGED_IN_MARKER_KEY) {
            warn!("failed to remove login marker: {}", err);
        }
        info!("logged out of {}", snapshot.endpoint_base);
    }

    /// Re-login with the persisted endpoint and credential.
    ///
    /// Concurrent callers share one attempt. Returns `false` when there is nothing to
    /// restore or the login fails.
    pub async fn restore_session(&self) -> bool {
        let pending = {
            let mut st = self.state();
            match &st.restoring {
                Some((_, pending)) => pending.clone(),
                None => {
                    st.next_restore_id = st.next_restore_id.wrapping_add(1);
                    let id = st.next_restore_id;
                    let store = self.clone();
                    let pending = async move {
                        let restored = store.run_restore().await;
                        store.finish_restore(id);
                        restored
                    }
                    .boxed()
                    .shared();
                    st.restoring = Some((id, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    async fn run_restore(&self) -> bool {
        if !self.has_persisted_session() {
            return false;
        }
        let (endpoint, credential) = {
            let st = self.state();
            (
                st.session.endpoint_base.clone(),
                st.session.credential.clone(),
            )
        };
        if endpoint.is_empty() || credential.is_empty() {
            return false;
        }
        match self.login(&endpoint, &credential).await {
            Ok(_) => true,
            Err(err) => {
                warn!("session restore failed: {}", err);
                false
            }
        }
    }

    fn finish_restore(&self, id: u64) {
        let mut st = self.state();
        if st.restoring.as_ref().is_some_and(|(current, _)| *current == id) {
            st.restoring = None;
        }
    }

    fn persist(&self, session: &Session) {
        let record = PersistedSession::from(session);
        match serde_json::to_string(&record) {
            Ok(text) => {
                if let Err(err) = self.inner.storage.set(AUTH_STORAGE_KEY, &text) {
                    warn!("failed to persist session: {}", err);
                }
            }
            Err(err) => warn!("failed to serialize session: {}", err),
        }
    }
}

/// The persisted subset is loaded unauthenticated; only a login or restore authenticates.
fn load_persisted(storage: &dyn KeyValueStorage) -> Session {
    let Some(text) = storage.get(AUTH_STORAGE_KEY) else {
        return Session::default();
    };
    match serde_json::from_str::<PersistedSession>(&text) {
        Ok(p) => Session {
            is_authenticated: false,
            endpoint_base: p.endpoint_base,
            credential: p.credential,
            server_version: p.server_version,
            use_custom_base: p.use_custom_base,
            ..Default::default()
        },
        Err(err) => {
            warn!("ignoring unreadable persisted session: {}", err);
            Session::default()
        }
    }
}
