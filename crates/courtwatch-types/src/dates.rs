use chrono::{Datelike, Duration, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Rule producing the target dates for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatePlan {
    /// Explicit calendar dates. Past entries are dropped at resolve time.
    Fixed { dates: Vec<NaiveDate> },
    /// `count` consecutive days starting today (or tomorrow).
    NextDays {
        count: u32,
        #[serde(default = "default_include_today")]
        include_today: bool,
    },
    /// Next occurrence of each weekday. A weekday equal to today rolls a week ahead.
    Weekdays { days: Vec<Weekday> },
}

fn default_include_today() -> bool {
    true
}

impl Default for DatePlan {
    fn default() -> Self {
        DatePlan::Weekdays {
            days: vec![Weekday::Fri, Weekday::Mon],
        }
    }
}

impl DatePlan {
    pub fn is_empty(&self) -> bool {
        match self {
            DatePlan::Fixed { dates } => dates.is_empty(),
            DatePlan::NextDays { count, .. } => *count == 0,
            DatePlan::Weekdays { days } => days.is_empty(),
        }
    }

    /// Resolves the plan against `today`, sorted ascending without duplicates.
    pub fn resolve(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = match self {
            DatePlan::Fixed { dates } => dates.iter().copied().filter(|d| *d >= today).collect(),
            DatePlan::NextDays {
                count,
                include_today,
            } => {
                let first = if *include_today {
                    today
                } else {
                    today + Duration::days(1)
                };
                (0..i64::from(*count))
                    .map(|offset| first + Duration::days(offset))
                    .collect()
            }
            DatePlan::Weekdays { days } => days
                .iter()
                .map(|day| next_occurrence(today, *day))
                .collect(),
        };
        dates.sort();
        dates.dedup();
        dates
    }

    /// Entries of a fixed plan that already lie in the past.
    pub fn stale_entries(&self, today: NaiveDate) -> usize {
        match self {
            DatePlan::Fixed { dates } => dates.iter().filter(|d| **d < today).count(),
            _ => 0,
        }
    }
}

fn next_occurrence(today: NaiveDate, day: Weekday) -> NaiveDate {
    let current = today.weekday().num_days_from_monday() as i64;
    let target = day.num_days_from_monday() as i64;
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    today + Duration::days(ahead)
}
