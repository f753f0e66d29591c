use std::{fmt, str::FromStr};

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{CourtwatchError, Result};

/// A bookable venue, configured externally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub id: String,
    pub name: String,
    pub short_name: String,
    pub url: String,
}

/// Half-open booking window on a single day, rendered as `HH:MM-HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0)?,
            end: NaiveTime::from_hms_opt(end.0, end.1, 0)?,
        })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

impl FromStr for TimeRange {
    type Err = CourtwatchError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || CourtwatchError::Probe(format!("invalid time range '{raw}'"));
        let (start, end) = raw.split_once('-').ok_or_else(invalid)?;
        let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").map_err(|_| invalid())?;
        let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").map_err(|_| invalid())?;
        Ok(Self { start, end })
    }
}

impl Serialize for TimeRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Availability {
    Available,
    Booked,
}

impl Availability {
    pub fn is_available(self) -> bool {
        matches!(self, Availability::Available)
    }
}

/// Ranking attached by the aggregator. Records without a tier are unranked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceTier {
    Preferred,
    Acceptable,
}

impl PreferenceTier {
    /// Lower sorts first; unranked records use [`PreferenceTier::UNRANKED`].
    pub fn rank(self) -> u8 {
        match self {
            PreferenceTier::Preferred => 0,
            PreferenceTier::Acceptable => 1,
        }
    }

    pub const UNRANKED: u8 = 2;
}

/// One observed slot for a venue/date/court/time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub venue_id: String,
    pub venue_name: String,
    pub date: NaiveDate,
    pub court: String,
    pub time: TimeRange,
    pub availability: Availability,
    /// Status exactly as the site reported it, kept for diagnostics.
    pub raw_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preference: Option<PreferenceTier>,
}

impl SlotRecord {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            venue_id: self.venue_id.clone(),
            date: self.date,
            court: self.court.clone(),
            time: self.time,
        }
    }

    pub fn is_available(&self) -> bool {
        self.availability.is_available()
    }

    pub fn preference_rank(&self) -> u8 {
        self.preference
            .map(PreferenceTier::rank)
            .unwrap_or(PreferenceTier::UNRANKED)
    }
}

/// Natural key of a bookable unit, stable across probe passes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub venue_id: String,
    pub date: NaiveDate,
    pub court: String,
    pub time: TimeRange,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.venue_id,
            self.date.format("%Y-%m-%d"),
            self.court,
            self.time
        )
    }
}

impl FromStr for SlotKey {
    type Err = CourtwatchError;

    fn from_str(raw: &str) -> Result<Self> {
        let invalid = || CourtwatchError::Storage(format!("invalid slot key '{raw}'"));
        let mut parts = raw.splitn(4, '|');
        let venue_id = parts.next().ok_or_else(invalid)?;
        let date = parts.next().ok_or_else(invalid)?;
        let court = parts.next().ok_or_else(invalid)?;
        let time = parts.next().ok_or_else(invalid)?;
        Ok(Self {
            venue_id: venue_id.to_string(),
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?,
            court: court.to_string(),
            time: time.parse().map_err(|_| invalid())?,
        })
    }
}
