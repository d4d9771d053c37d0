use thiserror::Error;

/// Failure below HTTP semantics: the request never produced a status line.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Login rejected, malformed input, or network trouble while authenticating.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("management endpoint is required")]
    MissingEndpoint,
    #[error("management key is required")]
    MissingCredential,
    #[error("login rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("login timed out")]
    Timeout,
    #[error("session was logged out before the login completed")]
    Superseded,
}

impl From<TransportError> for AuthError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => AuthError::Timeout,
            TransportError::Connect(msg) | TransportError::Request(msg) => AuthError::Network(msg),
        }
    }
}

/// Management fetch failure. Cloneable so coalesced callers all receive it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("management client is not connected")]
    NotConfigured,
    #[error("unauthorized")]
    Unauthorized,
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<TransportError> for FetchError {
    fn from(err: TransportError) -> Self {
        FetchError::Network(err.to_string())
    }
}
