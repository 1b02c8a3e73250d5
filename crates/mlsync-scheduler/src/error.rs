use thiserror::Error;

use mlsync_core::CoreError;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule definition is invalid (bad "HH:MM", zero interval, ...).
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A persisted row no longer maps to a known sync type.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Scheduler connection lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
