use thiserror::Error;

use mlsync_ampre::AmpreError;
use mlsync_store::StoreError;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("remote: {0}")]
    Remote(#[from] AmpreError),

    #[error("invalid sync request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
