use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the core can
/// classify failures consistently (user-facing reply vs counted failure).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote asked us to wait before the next request.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
