//! `mlsync-core`: shared types, configuration and errors for the listing sync
//! workspace.

pub mod config;
pub mod error;
pub mod types;

pub use config::MlsyncConfig;
pub use error::{CoreError, Result};
pub use types::{ListingRecord, RunLog, RunStatus, SyncCursor, SyncType};
