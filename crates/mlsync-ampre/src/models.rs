use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use mlsync_core::ListingRecord;

/// A remote record that could not be turned into a local one. The rest of
/// its page is still processed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed record {}: {reason}", .key.as_deref().unwrap_or("<no key>"))]
pub struct MalformedRecord {
    pub key: Option<String>,
    pub reason: String,
}

/// RESO `Property` fields as AMPRE names them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawProperty {
    listing_key: Option<String>,
    list_price: Option<f64>,
    street_number: Option<String>,
    street_name: Option<String>,
    street_suffix: Option<String>,
    unit_number: Option<String>,
    city: Option<String>,
    state_or_province: Option<String>,
    postal_code: Option<String>,
    standard_status: Option<String>,
    property_type: Option<String>,
    bedrooms_total: Option<u32>,
    bathrooms_total_integer: Option<u32>,
    modification_timestamp: Option<DateTime<Utc>>,
    original_entry_timestamp: Option<DateTime<Utc>>,
}

pub fn decode_property(value: Value) -> Result<ListingRecord, MalformedRecord> {
    let key_hint = value
        .get("ListingKey")
        .and_then(Value::as_str)
        .map(str::to_string);

    let raw: RawProperty = serde_json::from_value(value).map_err(|e| MalformedRecord {
        key: key_hint.clone(),
        reason: e.to_string(),
    })?;

    let listing_key = match raw.listing_key.map(|k| k.trim().to_string()) {
        Some(k) if !k.is_empty() => k,
        _ => {
            return Err(MalformedRecord {
                key: None,
                reason: "missing ListingKey".to_string(),
            })
        }
    };

    Ok(ListingRecord {
        listing_key,
        list_price: raw.list_price,
        street_number: raw.street_number,
        street_name: raw.street_name,
        street_suffix: raw.street_suffix,
        unit_number: raw.unit_number,
        city: raw.city,
        province: raw.state_or_province,
        postal_code: raw.postal_code,
        standard_status: raw.standard_status,
        property_type: raw.property_type,
        bedrooms: raw.bedrooms_total,
        bathrooms: raw.bathrooms_total_integer,
        media: Vec::new(),
        modified_at: raw.modification_timestamp,
        listed_at: raw.original_entry_timestamp,
    })
}

/// One photo of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaItem {
    pub listing_key: String,
    pub url: String,
    pub order: i64,
}

#[derive(Debug, Deserialize)]
struct RawMedia {
    #[serde(rename = "ResourceRecordKey")]
    resource_record_key: Option<String>,
    #[serde(rename = "MediaURL")]
    media_url: Option<String>,
    #[serde(rename = "Order")]
    order: Option<i64>,
    #[serde(rename = "MediaCategory")]
    media_category: Option<String>,
}

/// Decode one `Media` row. `Ok(None)` for rows that are not photos.
pub fn decode_media(value: Value) -> Result<Option<MediaItem>, MalformedRecord> {
    let raw: RawMedia = serde_json::from_value(value).map_err(|e| MalformedRecord {
        key: None,
        reason: e.to_string(),
    })?;

    if raw
        .media_category
        .as_deref()
        .is_some_and(|c| !c.eq_ignore_ascii_case("photo"))
    {
        return Ok(None);
    }

    let listing_key = raw.resource_record_key.filter(|k| !k.is_empty());
    let url = raw.media_url.filter(|u| !u.is_empty());
    match (listing_key, url) {
        (Some(listing_key), Some(url)) => Ok(Some(MediaItem {
            listing_key,
            url,
            order: raw.order.unwrap_or(i64::MAX),
        })),
        (key, _) => Err(MalformedRecord {
            key,
            reason: "media row without ResourceRecordKey or MediaURL".to_string(),
        }),
    }
}

/// Group photos per listing, each list ordered by `Order`.
pub fn group_photos(items: Vec<MediaItem>) -> BTreeMap<String, Vec<String>> {
    let mut by_key: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();
    for item in items {
        by_key
            .entry(item.listing_key)
            .or_default()
            .push((item.order, item.url));
    }
    by_key
        .into_iter()
        .map(|(key, mut photos)| {
            photos.sort_by_key(|(order, _)| *order);
            photos.dedup_by(|a, b| a.1 == b.1);
            (key, photos.into_iter().map(|(_, url)| url).collect())
        })
        .collect()
}
