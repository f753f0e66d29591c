//! Message bodies for the chat channel.
//!
//! Digests go out inside a fenced block so the court column lines up in the
//! client's monospace rendering.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use courtwatch_types::slot::{PreferenceTier, SlotRecord, Venue};

const FENCE: &str = "```";

struct VenueGroup<'a> {
    id: &'a str,
    name: &'a str,
    dates: BTreeMap<NaiveDate, BTreeMap<CourtOrder, Vec<&'a SlotRecord>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct CourtOrder {
    number: Option<u32>,
    name: String,
}

impl CourtOrder {
    fn of(name: &str) -> Self {
        let number = name
            .rsplit(' ')
            .next()
            .and_then(|tail| tail.parse::<u32>().ok());
        Self {
            number,
            name: name.to_string(),
        }
    }
}

/// Groups records venue, then date, then court, with the times of each court
/// on one line. Venues keep the order in which they first appear.
pub fn format_digest(records: &[SlotRecord], now: DateTime<Utc>) -> String {
    let mut groups: Vec<VenueGroup<'_>> = Vec::new();
    for record in records {
        let index = match groups.iter().position(|g| g.id == record.venue_id) {
            Some(index) => index,
            None => {
                groups.push(VenueGroup {
                    id: &record.venue_id,
                    name: &record.venue_name,
                    dates: BTreeMap::new(),
                });
                groups.len() - 1
            }
        };
        groups[index]
            .dates
            .entry(record.date)
            .or_default()
            .entry(CourtOrder::of(&record.court))
            .or_default()
            .push(record);
    }

    let court_width = records
        .iter()
        .map(|record| record.court.chars().count())
        .max()
        .unwrap_or(0);
    let any_preferred = records
        .iter()
        .any(|record| record.preference == Some(PreferenceTier::Preferred));

    let mut lines = vec![
        format!("🏸 *New court availability* ({} slots)", records.len()),
        format!("_checked {}_", now.format("%Y-%m-%d %H:%M UTC")),
        FENCE.to_string(),
    ];
    for group in &groups {
        lines.push(group.name.to_string());
        for (date, courts) in &group.dates {
            lines.push(format!("  {} ({})", date.format("%Y-%m-%d"), date.format("%a")));
            for (court, slots) in courts {
                let mut slots = slots.clone();
                slots.sort_by_key(|record| record.time);
                let times: Vec<String> = slots.iter().map(|record| time_cell(record)).collect();
                lines.push(format!(
                    "    {:<width$}  {}",
                    court.name,
                    times.join(" "),
                    width = court_width
                ));
            }
        }
    }
    lines.push(FENCE.to_string());
    if any_preferred {
        lines.push("`*` preferred time".to_string());
    }
    lines.join("\n")
}

fn time_cell(record: &SlotRecord) -> String {
    match record.preference {
        Some(PreferenceTier::Preferred) => format!("{}*", record.time),
        _ => record.time.to_string(),
    }
}

pub fn format_heartbeat(now: DateTime<Utc>) -> String {
    format!(
        "😴 No new court availability as of {}",
        now.format("%Y-%m-%d %H:%M UTC")
    )
}

pub fn format_startup(venues: &[Venue], dates: &[NaiveDate], interval_secs: u64) -> String {
    let venue_names: Vec<&str> = venues.iter().map(|venue| venue.short_name.as_str()).collect();
    let days: Vec<String> = dates
        .iter()
        .map(|date| date.format("%Y-%m-%d (%a)").to_string())
        .collect();
    format!(
        "🚀 *Court monitor started*\nVenues: {}\nDates: {}\nChecking every {} min",
        venue_names.join(", "),
        days.join(", "),
        (interval_secs / 60).max(1)
    )
}

pub fn format_failure(error: &str) -> String {
    format!("⚠️ *Court check failed*\n{FENCE}\n{error}\n{FENCE}")
}

pub fn format_code_prompt(timeout_secs: u64) -> String {
    format!(
        "🔐 A login code was sent to the registered phone. Reply with the code within {} min.",
        (timeout_secs / 60).max(1)
    )
}

pub fn format_self_check(now: DateTime<Utc>) -> String {
    format!("✅ Court monitor self-check at {}", now.format("%Y-%m-%d %H:%M UTC"))
}

/// Compact one-line rendering for logs and the CLI.
pub fn describe(record: &SlotRecord) -> String {
    format!(
        "{} {} {} {}",
        record.venue_name,
        record.date.format("%Y-%m-%d"),
        record.court,
        record.time
    )
}
