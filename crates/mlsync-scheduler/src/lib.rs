//! `mlsync-scheduler`: trigger table for the sync daemon with SQLite-persisted
//! firing state.
//!
//! # Overview
//!
//! The configured triggers are reconciled into the `sync_triggers` table on
//! startup. [`engine::SchedulerEngine`] checks them every second and forwards
//! each due trigger to the dispatcher over an mpsc channel. A window missed
//! while the daemon was down fires once on the first tick after restart.
//!
//! # Schedule variants
//!
//! | Variant    | Behaviour                                          |
//! |------------|----------------------------------------------------|
//! | `Interval` | Repeat every N seconds                             |
//! | `Daily`    | Fire at HH:MM UTC every day                        |

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::{FiredTrigger, SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use schedule::{compute_next_run, is_due};
pub use types::{Schedule, Trigger, TriggerState, TriggerTable};
