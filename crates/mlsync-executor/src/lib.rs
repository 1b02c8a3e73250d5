//! `mlsync-executor`: runs one sync of a given type against a [`ListingSource`].
//!
//! | Module     | Purpose                                            |
//! |------------|----------------------------------------------------|
//! | `executor` | lease, fetch, upsert, cursor advance, run log      |
//! | `rotation` | offset and watermark arithmetic                    |
//! | `error`    | `ExecutorError`                                    |
//!
//! [`ListingSource`]: mlsync_ampre::ListingSource

pub mod error;
pub mod executor;
pub mod rotation;

pub use error::{ExecutorError, Result};
pub use executor::{RunOutcome, RunPhase, SyncExecutor, SyncRequest, SyncSettings};
