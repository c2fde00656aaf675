use shelfsync_core::CatalogError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("source channel error: {0}")]
    Channel(String),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error from {0}: {1}")]
    ApiError(String, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl ReconcileError {
    /// Transient transport failures; the task can be tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Http(_) | Self::Io(_) | Self::Channel(_) | Self::Blob(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// Run `future` with a deadline; an elapsed deadline becomes [`ReconcileError::Timeout`].
pub async fn with_timeout<T, F>(operation: &str, secs: u64, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(std::time::Duration::from_secs(secs), future).await {
        Ok(result) => result,
        Err(_) => Err(ReconcileError::Timeout {
            operation: operation.to_string(),
            secs,
        }),
    }
}
