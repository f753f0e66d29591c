//! Merges probe output into one ranked, duplicate-free list.

use std::collections::HashMap;

use courtwatch_types::{
    config::PreferenceConfig,
    slot::{PreferenceTier, SlotKey, SlotRecord, TimeRange},
};
use tracing::debug;

/// Deduplicates `records` by [`SlotKey`] (last one wins), attaches preference
/// tiers and sorts preferred first, then by date, start time, venue and court.
///
/// Pure: the input is left untouched.
pub fn aggregate(records: &[SlotRecord], preferences: &PreferenceConfig) -> Vec<SlotRecord> {
    let mut index: HashMap<SlotKey, usize> = HashMap::with_capacity(records.len());
    let mut merged: Vec<SlotRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.key()) {
            Some(&position) => merged[position] = record.clone(),
            None => {
                index.insert(record.key(), merged.len());
                merged.push(record.clone());
            }
        }
    }
    let duplicates = records.len() - merged.len();
    if duplicates > 0 {
        debug!("Dropped {duplicates} duplicate slot records");
    }

    for record in &mut merged {
        record.preference = tier_for(record, preferences);
    }
    if preferences.drop_unranked && !preferences.is_empty() {
        merged.retain(|record| record.preference.is_some());
    }

    merged.sort_by(|a, b| {
        a.preference_rank()
            .cmp(&b.preference_rank())
            .then(a.date.cmp(&b.date))
            .then(a.time.start.cmp(&b.time.start))
            .then(a.venue_id.cmp(&b.venue_id))
            .then(court_number(&a.court).cmp(&court_number(&b.court)))
            .then(a.court.cmp(&b.court))
    });
    merged
}

/// Tier a record earns under `preferences`, if any.
///
/// Time windows decide the tier. A non-empty court list caps records on
/// other courts at acceptable, and on its own (no time windows) makes
/// records on listed courts preferred.
pub fn tier_for(record: &SlotRecord, preferences: &PreferenceConfig) -> Option<PreferenceTier> {
    if preferences.is_empty() {
        return None;
    }
    let courts_listed = !preferences.preferred_courts.is_empty();
    let on_listed_court = preferences
        .preferred_courts
        .iter()
        .any(|wanted| court_matches(wanted, &record.court));

    let has_time_windows =
        !preferences.preferred_times.is_empty() || !preferences.acceptable_times.is_empty();
    if !has_time_windows {
        return on_listed_court.then_some(PreferenceTier::Preferred);
    }

    let by_time = if within_any(&record.time, &preferences.preferred_times) {
        Some(PreferenceTier::Preferred)
    } else if within_any(&record.time, &preferences.acceptable_times) {
        Some(PreferenceTier::Acceptable)
    } else {
        None
    };
    match by_time {
        Some(PreferenceTier::Preferred) if courts_listed && !on_listed_court => {
            Some(PreferenceTier::Acceptable)
        }
        other => other,
    }
}

fn within_any(slot: &TimeRange, windows: &[TimeRange]) -> bool {
    windows
        .iter()
        .any(|window| slot.start >= window.start && slot.end <= window.end)
}

/// `"3"` matches `"Court 3"`; anything else compares case-insensitively.
fn court_matches(wanted: &str, court: &str) -> bool {
    let wanted = wanted.trim();
    let court = court.trim();
    if wanted.eq_ignore_ascii_case(court) {
        return true;
    }
    matches!(
        (wanted.parse::<u32>().ok(), court_number(court)),
        (Some(a), Some(b)) if a == b
    )
}

fn court_number(court: &str) -> Option<u32> {
    court.rsplit(' ').next().and_then(|tail| tail.parse().ok())
}
