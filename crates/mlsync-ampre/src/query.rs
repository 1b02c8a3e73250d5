//! OData `$filter` fragments used against the AMPRE resources.

use chrono::{DateTime, SecondsFormat, Utc};

pub const PROPERTY_SELECT: &str = "ListingKey,ListPrice,StreetNumber,StreetName,StreetSuffix,\
UnitNumber,City,StateOrProvince,PostalCode,StandardStatus,PropertyType,BedroomsTotal,\
BathroomsTotalInteger,ModificationTimestamp,OriginalEntryTimestamp";

pub const MEDIA_SELECT: &str = "ResourceRecordKey,MediaURL,Order,MediaCategory";

pub const ORDER_BY_KEY: &str = "ListingKey";
pub const ORDER_BY_MODIFIED: &str = "ModificationTimestamp,ListingKey";

/// Quote a string literal, doubling embedded single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn timestamp_literal(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn modified_since(since: DateTime<Utc>) -> String {
    format!("ModificationTimestamp gt {}", timestamp_literal(since))
}

/// Keyset filter over `(ModificationTimestamp, ListingKey)`: everything after
/// `since`, plus records at exactly `since` whose key sorts after `after_key`.
/// Pairs with [`ORDER_BY_MODIFIED`].
pub fn modified_after(since: DateTime<Utc>, after_key: Option<&str>) -> String {
    match after_key {
        None => modified_since(since),
        Some(key) => {
            let ts = timestamp_literal(since);
            format!(
                "ModificationTimestamp gt {ts} or (ModificationTimestamp eq {ts} and ListingKey gt {})",
                quote(key)
            )
        }
    }
}

pub fn city_eq(city: &str) -> String {
    format!("City eq {}", quote(city))
}

/// `ResourceRecordKey eq 'a' or ResourceRecordKey eq 'b' ...`
pub fn media_for_keys(keys: &[String]) -> String {
    keys.iter()
        .map(|k| format!("ResourceRecordKey eq {}", quote(k)))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// AND together the non-empty clauses, parenthesising when there is more
/// than one. `None` when nothing is left.
pub fn all_of<I>(clauses: I) -> Option<String>
where
    I: IntoIterator<Item = Option<String>>,
{
    let parts: Vec<String> = clauses
        .into_iter()
        .flatten()
        .filter(|c| !c.trim().is_empty())
        .collect();
    match parts.len() {
        0 => None,
        1 => parts.into_iter().next(),
        _ => Some(
            parts
                .iter()
                .map(|p| format!("({p})"))
                .collect::<Vec<_>>()
                .join(" and "),
        ),
    }
}
