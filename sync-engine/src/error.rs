use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Timeout, connection failure or 5xx. Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// 4xx semantic rejection. Dead-lettered, never retried automatically.
    #[error("rejected by server (HTTP {status}): {message}")]
    PermanentRejection { status: u16, message: String },

    #[error("local storage error: {0}")]
    LocalStorage(String),

    /// No bearer token available. Treated the same as being offline.
    #[error("auth unavailable")]
    AuthUnavailable,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {entity_type}/{entity_id}")]
    NotFound { entity_type: String, entity_id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::LocalStorage(e.to_string())
    }
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::AuthUnavailable)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
