//! Cursor arithmetic for the three sync types. Pure functions only.

use chrono::{DateTime, Utc};

/// Offset a full run starts from. A stored offset at or past the ceiling
/// (e.g. after `max_properties` was lowered) restarts the walk.
pub fn full_start_offset(stored: u64, max_properties: u64) -> u64 {
    if stored >= max_properties {
        0
    } else {
        stored
    }
}

/// Offset after a successful full run.
///
/// Progress counts upserted records only, so malformed records never move the
/// cursor. The walk wraps to 0 when it reaches `max_properties` or when the
/// remote ran out of records; the next pass re-upserts what it finds.
pub fn next_full_offset(start: u64, upserted: u64, exhausted: bool, max_properties: u64) -> u64 {
    let next = start.saturating_add(upserted);
    if exhausted || next >= max_properties {
        0
    } else {
        next
    }
}

/// "Modified since" bound for an incremental run.
pub fn incremental_since(
    watermark: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    lookback: chrono::Duration,
) -> DateTime<Utc> {
    watermark.unwrap_or(started_at - lookback)
}

/// Position of an incremental walk: the last `(ModificationTimestamp,
/// ListingKey)` taken. A `None` key means everything at the timestamp is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub at: DateTime<Utc>,
    pub key: Option<String>,
}

impl Watermark {
    fn is_after(&self, at: DateTime<Utc>, key: &str) -> bool {
        at > self.at || (at == self.at && self.key.as_deref().map_or(true, |k| key > k))
    }
}

/// Watermark after a successful incremental run.
///
/// A short slice means everything changed before `started_at` was seen. A
/// full slice means more changes are pending, so the watermark moves to the
/// last `(timestamp, key)` actually received; records sharing that timestamp
/// with a larger key come on the next run. It never moves backwards.
pub fn next_watermark(
    current: &Watermark,
    started_at: DateTime<Utc>,
    exhausted: bool,
    last_seen: Option<(DateTime<Utc>, &str)>,
) -> Watermark {
    if exhausted {
        if started_at > current.at {
            return Watermark {
                at: started_at,
                key: None,
            };
        }
        return current.clone();
    }
    match last_seen {
        Some((at, key)) if current.is_after(at, key) => Watermark {
            at,
            key: Some(key.to_string()),
        },
        _ => current.clone(),
    }
}

/// Start of the local key slice for image refresh.
pub fn image_start_offset(stored: u64, total_keys: u64) -> u64 {
    if stored >= total_keys {
        0
    } else {
        stored
    }
}

/// Key offset after an image refresh examined `examined` keys from `start`.
pub fn next_image_offset(start: u64, examined: u64, limit: u32, total_keys: u64) -> u64 {
    let next = start.saturating_add(examined);
    if examined < u64::from(limit) || next >= total_keys {
        0
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn six_windows_cover_range_then_wrap() {
        let max = 12_500;
        let mut offset = 0;
        let mut visited = Vec::new();
        for _ in 0..6 {
            let start = full_start_offset(offset, max);
            visited.push(start);
            offset = next_full_offset(start, 2_500, false, max);
        }
        assert_eq!(visited, vec![0, 2_500, 5_000, 7_500, 10_000, 0]);
    }

    #[test]
    fn malformed_records_do_not_count_as_progress() {
        assert_eq!(next_full_offset(0, 2_497, false, 15_000), 2_497);
    }

    #[test]
    fn exhausted_remote_wraps_early() {
        assert_eq!(next_full_offset(5_000, 120, true, 15_000), 0);
    }

    #[test]
    fn stale_offset_past_ceiling_restarts() {
        assert_eq!(full_start_offset(20_000, 15_000), 0);
        assert_eq!(full_start_offset(14_999, 15_000), 14_999);
    }

    fn mark(at: DateTime<Utc>, key: Option<&str>) -> Watermark {
        Watermark {
            at,
            key: key.map(str::to_string),
        }
    }

    #[test]
    fn watermark_rules() {
        let since = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let newest = Utc.with_ymd_and_hms(2026, 10, 18, 6, 0, 0).unwrap();
        let current = mark(since, None);

        assert_eq!(
            next_watermark(&current, started, true, Some((newest, "K9"))),
            mark(started, None)
        );
        assert_eq!(
            next_watermark(&current, started, false, Some((newest, "K9"))),
            mark(newest, Some("K9"))
        );
        assert_eq!(next_watermark(&current, started, false, None), current);
        let older = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();
        assert_eq!(
            next_watermark(&current, started, false, Some((older, "K1"))),
            current
        );
    }

    #[test]
    fn watermark_steps_through_keys_sharing_a_timestamp() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 6, 0, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let current = mark(at, Some("K2"));

        assert_eq!(
            next_watermark(&current, started, false, Some((at, "K5"))),
            mark(at, Some("K5"))
        );
        // never back to an earlier key at the same instant
        assert_eq!(
            next_watermark(&current, started, false, Some((at, "K1"))),
            current
        );
        // a run that started before the watermark does not rewind it
        let early = Utc.with_ymd_and_hms(2026, 10, 18, 5, 0, 0).unwrap();
        assert_eq!(next_watermark(&current, early, true, None), current);
    }

    #[test]
    fn first_incremental_run_looks_back() {
        let started = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let since = incremental_since(None, started, chrono::Duration::hours(24));
        assert_eq!(since, Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap());
    }

    #[test]
    fn image_offset_wraps_at_end_of_key_space() {
        assert_eq!(next_image_offset(0, 100, 100, 250), 100);
        assert_eq!(next_image_offset(200, 50, 100, 250), 0);
        assert_eq!(next_image_offset(100, 100, 100, 200), 0);
        assert_eq!(image_start_offset(300, 250), 0);
    }
}
