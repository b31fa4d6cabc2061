use thiserror::Error;

/// Failures inside the cache layer.
///
/// None of these reach request handlers: the aside layer logs them and falls
/// back to the underlying computation.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backend is disconnected or not configured.
    #[error("cache backend `{backend}` is unavailable")]
    Unavailable { backend: &'static str },
    #[error("cache backend `{backend}` failed: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    #[error("failed to encode cached value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CacheError {
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::Unavailable { .. } => "unavailable",
            CacheError::Backend { .. } => "backend",
            CacheError::Encode(_) => "encode",
        }
    }
}
