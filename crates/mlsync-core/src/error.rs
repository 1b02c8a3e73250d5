use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown sync type: {0}")]
    UnknownSyncType(String),

    #[error("Unknown run status: {0}")]
    UnknownRunStatus(String),
}

impl CoreError {
    /// Short error code used in status output.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::UnknownSyncType(_) => "UNKNOWN_SYNC_TYPE",
            CoreError::UnknownRunStatus(_) => "UNKNOWN_RUN_STATUS",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
