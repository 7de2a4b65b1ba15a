//! Core domain model and week accounting for boostwatch.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "boostwatch-core";

/// One row of a contribution listing as observed on a single poll.
///
/// Snapshots are produced fresh every cycle and replaced wholesale; nothing
/// mutates an existing record in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub entity_id: i64,
    pub display_name: String,
    pub profile_url: Option<String>,
    pub contribution: i64,
}

/// Durable per-week, per-entity counter pair.
///
/// `baseline` is fixed once the entity is first seen in a week; `current` is
/// overwritten on every poll that observes the entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub week_start: NaiveDate,
    pub entity_id: i64,
    pub display_name: String,
    pub profile_url: Option<String>,
    pub baseline: i64,
    pub current: i64,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Weekly growth shown to readers.
    pub fn delta(&self) -> i64 {
        self.current - self.baseline
    }
}

/// The single live pinned summary message for one (chat, metric) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedMessageRecord {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: i64,
    pub week_start: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

/// The currently featured item on the boost page, plus the auxiliary counters
/// the page shows next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturedItem {
    pub item_id: i64,
    pub display_name: String,
    pub image_url: Option<String>,
    /// Replacement counter as shown, e.g. "7/10".
    pub replacements: Option<String>,
    /// Donation counter as shown, e.g. "82/50".
    pub daily_donated: Option<String>,
    pub owner_ids: Vec<i64>,
    pub discovered_at: DateTime<Utc>,
}

/// Cheap change gate over a snapshot.
///
/// Deterministic over the ordered `(entity_id, contribution)` pairs. Display
/// names are deliberately excluded: a nickname-only change does not refresh
/// the pinned message until some contribution also moves.
pub fn snapshot_fingerprint(records: &[ContributionRecord]) -> String {
    let joined = records
        .iter()
        .map(|r| format!("{}:{}", r.entity_id, r.contribution))
        .collect::<Vec<_>>()
        .join(",");
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hex::encode(hasher.finalize())
}

pub mod week {
    //! Monday-based week windows, evaluated in one fixed reporting timezone
    //! so week boundaries do not depend on where the process happens to run.

    use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc};

    const REPORTING_OFFSET_SECS: i32 = 3 * 3600;

    /// Fixed reporting timezone (UTC+3).
    pub fn reporting_offset() -> FixedOffset {
        FixedOffset::east_opt(REPORTING_OFFSET_SECS).expect("UTC+3 is a valid offset")
    }

    /// Monday of the ISO week containing `instant`, in the reporting timezone.
    pub fn week_start_in(instant: DateTime<Utc>) -> NaiveDate {
        week_start_of_date(instant.with_timezone(&reporting_offset()).date_naive())
    }

    /// Monday on or before `date`.
    pub fn week_start_of_date(date: NaiveDate) -> NaiveDate {
        date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
    }

    /// Sunday closing the week, always `week_start + 6 days`.
    pub fn week_end(week_start: NaiveDate) -> NaiveDate {
        week_start + Duration::days(6)
    }

    pub fn current_week_start() -> NaiveDate {
        week_start_in(Utc::now())
    }

    /// Human week range, "dd.mm — dd.mm".
    pub fn format_week_range(week_start: NaiveDate) -> String {
        let end = week_end(week_start);
        format!(
            "{:02}.{:02} — {:02}.{:02}",
            week_start.day(),
            week_start.month(),
            end.day(),
            end.month()
        )
    }

    /// Timestamp stamp used in rendered messages, "dd.mm HH:MM".
    pub fn format_update_stamp(instant: DateTime<Utc>) -> String {
        instant
            .with_timezone(&reporting_offset())
            .format("%d.%m %H:%M")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn record(entity_id: i64, name: &str, contribution: i64) -> ContributionRecord {
        ContributionRecord {
            entity_id,
            display_name: name.to_string(),
            profile_url: None,
            contribution,
        }
    }

    #[test]
    fn week_start_is_stable_across_one_week() {
        // 2026-02-16 is a Monday.
        let monday = Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).single().unwrap();
        let sunday = Utc.with_ymd_and_hms(2026, 2, 22, 18, 30, 0).single().unwrap();
        assert_eq!(week::week_start_in(monday), date(2026, 2, 16));
        assert_eq!(week::week_start_in(sunday), date(2026, 2, 16));
    }

    #[test]
    fn week_boundary_respects_reporting_timezone() {
        // Sunday 22:30 UTC is already Monday 01:30 in UTC+3.
        let late_sunday = Utc.with_ymd_and_hms(2026, 2, 15, 22, 30, 0).single().unwrap();
        assert_eq!(week::week_start_in(late_sunday), date(2026, 2, 16));
        // Sunday 20:00 UTC is still Sunday 23:00 in UTC+3.
        let earlier = Utc.with_ymd_and_hms(2026, 2, 15, 20, 0, 0).single().unwrap();
        assert_eq!(week::week_start_in(earlier), date(2026, 2, 9));
    }

    #[test]
    fn week_start_crosses_month_and_year_boundaries() {
        // 2025-01-01 is a Wednesday; its week starts the previous year.
        assert_eq!(week::week_start_of_date(date(2025, 1, 1)), date(2024, 12, 30));
        // 2026-03-01 is a Sunday in a week starting in February.
        assert_eq!(week::week_start_of_date(date(2026, 3, 1)), date(2026, 2, 23));
    }

    #[test]
    fn week_start_handles_leap_years() {
        // 2024-02-29 exists and is a Thursday.
        assert_eq!(week::week_start_of_date(date(2024, 2, 29)), date(2024, 2, 26));
        assert_eq!(week::week_end(date(2024, 2, 26)), date(2024, 3, 3));
    }

    #[test]
    fn week_end_is_always_six_days_out() {
        for day in [
            date(2026, 2, 16),
            date(2024, 12, 30),
            date(2024, 2, 26),
            date(2026, 6, 1),
        ] {
            assert_eq!(week::week_end(day) - day, chrono::Duration::days(6));
        }
    }

    #[test]
    fn format_week_range_zero_pads() {
        assert_eq!(week::format_week_range(date(2026, 2, 2)), "02.02 — 08.02");
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let records = vec![record(1, "a", 10), record(2, "b", 20)];
        assert_eq!(snapshot_fingerprint(&records), snapshot_fingerprint(&records));
    }

    #[test]
    fn fingerprint_changes_with_contribution() {
        let before = vec![record(1, "a", 10)];
        let after = vec![record(1, "a", 25)];
        assert_ne!(snapshot_fingerprint(&before), snapshot_fingerprint(&after));
    }

    #[test]
    fn fingerprint_changes_with_order() {
        let one = vec![record(1, "a", 10), record(2, "b", 20)];
        let two = vec![record(2, "b", 20), record(1, "a", 10)];
        assert_ne!(snapshot_fingerprint(&one), snapshot_fingerprint(&two));
    }

    #[test]
    fn fingerprint_ignores_display_name_changes() {
        let before = vec![record(1, "old nick", 10)];
        let after = vec![record(1, "new nick", 10)];
        assert_eq!(snapshot_fingerprint(&before), snapshot_fingerprint(&after));
    }

    #[test]
    fn fingerprint_of_empty_snapshot_is_stable() {
        assert_eq!(snapshot_fingerprint(&[]), snapshot_fingerprint(&[]));
    }

    #[test]
    fn ledger_delta_is_current_minus_baseline() {
        let entry = LedgerEntry {
            week_start: date(2026, 2, 16),
            entity_id: 1,
            display_name: "a".into(),
            profile_url: None,
            baseline: 30,
            current: 45,
            updated_at: Utc::now(),
        };
        assert_eq!(entry.delta(), 15);
    }
}
