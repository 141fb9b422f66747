use serde::Serialize;
use thiserror::Error;

/// Raised by the proxy ring when no live slot can be reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    #[error("proxy ring has no live entries")]
    Empty,
}

/// Outcome classification for a single upstream call.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure (timeout, reset, refused). The proxy that carried the
    /// attempt has already been evicted when this is returned.
    #[error("transport failure via {proxy}: {message}")]
    Retryable { proxy: String, message: String },

    /// Upstream answered, but rejected the request.
    #[error("upstream rejected {action} with state {state:?}")]
    UpstreamStatus { action: String, state: String },

    #[error("no proxy available: {0}")]
    EmptyRing(#[from] RingError),

    #[error("failed to decode {action} response: {message}")]
    Decode { action: String, message: String },

    /// Request failed for a reason the proxy is not to blame for.
    #[error("request {action} failed: {message}")]
    Request { action: String, message: String },

    #[error("failed to build http client: {0}")]
    Build(String),
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Retryable { .. })
    }
}

/// Failures talking to the local credential broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The broker refused the credentials or the second-factor code.
    #[error("credentials rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("account {0} not found")]
    NotFound(i64),

    #[error("database task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("credential error: {0}")]
    Credential(String),

    /// No pending second-factor challenge for the account (never started,
    /// expired, or lost on restart). The login has to start over.
    #[error("no pending second-factor challenge for account {0}")]
    ChallengeMissing(i64),

    /// Refresh failed; stored tokens were cleared.
    #[error("session expired, re-authentication required: {0}")]
    TokenExpired(String),

    #[error("account {0} is not signed in")]
    NotAuthenticated(i64),

    #[error("broker unavailable: {0}")]
    Broker(BrokerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BrokerError> for AuthError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Rejected(message) => AuthError::Credential(message),
            other => AuthError::Broker(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Upstream error: {0}")]
    Client(#[from] ClientError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Account error: {0}")]
    Account(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

pub type AppResult<T> = Result<T, AppError>;
