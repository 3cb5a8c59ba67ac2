use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed remote fetch, delivered identically to every caller
/// that joined the same in-flight request (hence `Clone`).
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Remote fetch failed: {0:#}")]
    Remote(Arc<anyhow::Error>),

    #[error("Remote fetch timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Remote fetch task ended unexpectedly: {0}")]
    Aborted(String),

    #[error("Offline and no cached data for {0}")]
    Offline(String),
}

impl FetchError {
    pub fn remote(err: anyhow::Error) -> Self {
        FetchError::Remote(Arc::new(err))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::TimedOut(_))
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        FetchError::remote(err)
    }
}
