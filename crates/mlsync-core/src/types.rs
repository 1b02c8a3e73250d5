use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// The three independent sync pipelines. Each owns one cursor and one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Offset-paged walk over the whole remote dataset.
    Full,
    /// Records modified since the last successful run.
    Incremental,
    /// Media URLs for listings already stored locally.
    ImageRefresh,
}

impl SyncType {
    pub const ALL: [SyncType; 3] = [SyncType::Full, SyncType::Incremental, SyncType::ImageRefresh];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
            SyncType::ImageRefresh => "image_refresh",
        }
    }

    /// Name of the lease that serialises runs of this sync type.
    pub fn lease_name(&self) -> String {
        format!("sync:{}", self.as_str())
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncType::Full),
            "incremental" => Ok(SyncType::Incremental),
            // CLI spelling uses a dash
            "image_refresh" | "image-refresh" | "images" => Ok(SyncType::ImageRefresh),
            other => Err(CoreError::UnknownSyncType(other.to_string())),
        }
    }
}

/// Persisted position of one sync type in the remote dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub sync_type: SyncType,
    /// Next `$skip` for full sync, next key-slice start for image refresh.
    pub offset: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success: bool,
    /// "Modified since" instant for incremental sync.
    pub watermark: Option<DateTime<Utc>>,
    /// Last `ListingKey` taken at exactly `watermark`. Records sharing that
    /// timestamp with a larger key are still pending.
    #[serde(default)]
    pub watermark_key: Option<String>,
}

impl SyncCursor {
    /// Cursor state on the first run of a sync type.
    pub fn new(sync_type: SyncType) -> Self {
        Self {
            sync_type,
            offset: 0,
            last_run_at: None,
            last_success: false,
            watermark: None,
            watermark_key: None,
        }
    }
}

/// One MLS listing as stored locally. `listing_key` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_key: String,
    pub list_price: Option<f64>,
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub street_suffix: Option<String>,
    pub unit_number: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal_code: Option<String>,
    pub standard_status: Option<String>,
    pub property_type: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    /// Ordered image URLs; empty until an image refresh fills it in.
    #[serde(default)]
    pub media: Vec<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub listed_at: Option<DateTime<Utc>>,
}

impl ListingRecord {
    /// A record with only its key set; used by decoders and tests.
    pub fn with_key(listing_key: impl Into<String>) -> Self {
        Self {
            listing_key: listing_key.into(),
            list_price: None,
            street_number: None,
            street_name: None,
            street_suffix: None,
            unit_number: None,
            city: None,
            province: None,
            postal_code: None,
            standard_status: None,
            property_type: None,
            bedrooms: None,
            bathrooms: None,
            media: Vec::new(),
            modified_at: None,
            listed_at: None,
        }
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(CoreError::UnknownRunStatus(other.to_string())),
        }
    }
}

/// Append-only record of a single executed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    /// Row id; `0` until the log has been persisted.
    pub id: i64,
    pub sync_type: SyncType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_fetched: u64,
    pub records_upserted: u64,
    pub error_count: u64,
    pub status: RunStatus,
    pub offset_before: u64,
    pub offset_after: u64,
    /// Failure reason, or `None` for a clean run.
    pub message: Option<String>,
}
