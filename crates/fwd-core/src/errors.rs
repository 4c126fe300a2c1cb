use std::time::Duration;

/// Core error type for the forwarding engine.
///
/// Adapter crates should map their specific errors into this type so the engine
/// and the binary can tell configuration problems from storage failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("duplicate rule: an active rule already forwards {key}")]
    DuplicateRule { key: String },

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("unknown rule: {0}")]
    UnknownRule(u64),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a failed transport call.
///
/// `FloodWait` is the provider's "retry after N seconds" signal; everything else
/// abandons the single delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("flood wait: retry after {0:?}")]
    FloodWait(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::FloodWait(d) => Some(*d),
            _ => None,
        }
    }
}
