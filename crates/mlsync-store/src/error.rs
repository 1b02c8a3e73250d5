use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("database connection mutex poisoned")]
    Poisoned,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] mlsync_core::CoreError),
}

pub type Result<T> = std::result::Result<T, StoreError>;
