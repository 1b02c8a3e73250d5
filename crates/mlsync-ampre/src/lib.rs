//! `mlsync-ampre`: client for the AMPRE RESO/OData listings API.
//!
//! The executor talks to the remote only through [`ListingSource`], so tests
//! and alternative feeds can stand in for [`AmpreClient`].

pub mod client;
pub mod error;
pub mod models;
pub mod query;
pub mod source;

pub use client::AmpreClient;
pub use error::AmpreError;
pub use models::{decode_media, decode_property, group_photos, MalformedRecord, MediaItem};
pub use source::{ListingSource, PropertyQuery};
