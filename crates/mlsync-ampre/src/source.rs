use async_trait::async_trait;
use serde_json::Value;

use crate::error::AmpreError;

/// One `Property` request: `$top`/`$skip` paging plus filter and ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyQuery {
    pub top: u32,
    pub skip: u64,
    pub filter: Option<String>,
    pub orderby: String,
}

/// Remote listings feed.
///
/// Records come back as raw JSON so that one malformed record can be skipped
/// by the caller without failing the whole page.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_properties(&self, query: &PropertyQuery) -> Result<Vec<Value>, AmpreError>;

    /// All photo media rows for `listing_keys`.
    async fn fetch_media(&self, listing_keys: &[String]) -> Result<Vec<Value>, AmpreError>;
}

#[async_trait]
impl<T: ListingSource + ?Sized> ListingSource for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch_properties(&self, query: &PropertyQuery) -> Result<Vec<Value>, AmpreError> {
        (**self).fetch_properties(query).await
    }

    async fn fetch_media(&self, listing_keys: &[String]) -> Result<Vec<Value>, AmpreError> {
        (**self).fetch_media(listing_keys).await
    }
}
