//! `mlsync-store`: SQLite persistence for synced listings.
//!
//! One database file holds four tables:
//!
//! | Table          | Contents                                           |
//! |----------------|----------------------------------------------------|
//! | `listings`     | Upserted MLS records, unique on `listing_key`      |
//! | `sync_cursors` | One cursor row per sync type                       |
//! | `run_logs`     | Append-only history of executed runs               |
//! | `sync_leases`  | Named leases that serialise runs across processes  |
//!
//! Listing upserts and the cursor that guards them are always written in the
//! same transaction.

pub mod db;
pub mod error;
pub mod lease;
pub mod store;

pub use error::{Result, StoreError};
pub use lease::LeaseGuard;
pub use store::{KeySlot, ListingStore};
