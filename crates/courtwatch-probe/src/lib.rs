//! Reads court availability for each venue and date.

use std::time::Duration;

use chrono::NaiveDate;
use courtwatch_site::{CourtListing, CourtSlots, SiteDriver, StatusMarkers};
use courtwatch_types::{
    config::SiteConfig,
    slot::{Availability, SlotRecord, Venue},
    CourtwatchError, Result,
};
use tracing::{debug, info, warn};

/// A slot is booked only when it is both marked blocked and not interactive.
/// Any other combination counts as available.
pub fn classify(markers: StatusMarkers) -> Availability {
    if markers.blocked && markers.not_interactive {
        Availability::Booked
    } else {
        Availability::Available
    }
}

pub fn probe_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Probe(message.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Every slot seen for the venue/date, booked ones included, plus the
    /// courts that could not be read.
    Slots {
        records: Vec<SlotRecord>,
        warnings: Vec<String>,
    },
    /// The site sent us back to its login surface.
    SessionInvalid,
}

/// Result of probing every configured venue and date in one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSweep {
    /// Available slots only.
    pub records: Vec<SlotRecord>,
    /// Slots looked at, booked ones included.
    pub observed: usize,
    pub warnings: Vec<String>,
    pub venues_checked: Vec<String>,
    pub session_invalid: bool,
}

pub struct Prober {
    request_delay: Duration,
}

impl Prober {
    pub fn new(request_delay: Duration) -> Self {
        Self { request_delay }
    }

    pub fn from_config(config: &SiteConfig) -> Self {
        Self::new(Duration::from_millis(config.request_delay_ms))
    }

    pub async fn probe<S>(
        &self,
        site: &mut S,
        venue: &Venue,
        date: NaiveDate,
    ) -> Result<ProbeOutcome>
    where
        S: SiteDriver + ?Sized,
    {
        let listing = site
            .list_courts(venue, date)
            .await
            .map_err(|err| probe_error(format!("{} {date}: {err}", venue.short_name)))?;
        let courts = match listing {
            CourtListing::SessionInvalid => return Ok(ProbeOutcome::SessionInvalid),
            CourtListing::Courts(courts) => courts,
        };
        if courts.is_empty() {
            debug!("{} has no courts on {date}", venue.short_name);
        }

        let mut records = Vec::new();
        let mut warnings = Vec::new();
        for court in &courts {
            match site.court_slots(venue, date, court).await {
                Ok(CourtSlots::SessionInvalid) => return Ok(ProbeOutcome::SessionInvalid),
                Ok(CourtSlots::Slots(slots)) => {
                    records.extend(slots.into_iter().map(|slot| SlotRecord {
                        venue_id: venue.id.clone(),
                        venue_name: venue.name.clone(),
                        date,
                        court: court.name.clone(),
                        time: slot.time,
                        availability: classify(slot.markers),
                        raw_status: slot.token,
                        preference: None,
                    }))
                }
                Err(err) => {
                    let message = format!("{} {date} {}: {err}", venue.short_name, court.name);
                    warn!("Skipping court: {message}");
                    warnings.push(message);
                }
            }
        }
        Ok(ProbeOutcome::Slots { records, warnings })
    }

    /// Probes every venue/date pair in order. Stops early when the session
    /// turns out to be invalid.
    pub async fn probe_all<S>(
        &self,
        site: &mut S,
        venues: &[Venue],
        dates: &[NaiveDate],
    ) -> ProbeSweep
    where
        S: SiteDriver + ?Sized,
    {
        let mut sweep = ProbeSweep::default();
        let mut first_request = true;
        for venue in venues {
            sweep.venues_checked.push(venue.name.clone());
            for &date in dates {
                if !first_request && !self.request_delay.is_zero() {
                    tokio::time::sleep(self.request_delay).await;
                }
                first_request = false;

                match self.probe(site, venue, date).await {
                    Ok(ProbeOutcome::SessionInvalid) => {
                        warn!("Session rejected while probing {} on {date}", venue.short_name);
                        sweep.session_invalid = true;
                        return sweep;
                    }
                    Ok(ProbeOutcome::Slots { records, warnings }) => {
                        sweep.observed += records.len();
                        let available: Vec<SlotRecord> =
                            records.into_iter().filter(SlotRecord::is_available).collect();
                        info!(
                            "{} {date}: {} available slots",
                            venue.short_name,
                            available.len()
                        );
                        sweep.records.extend(available);
                        sweep.warnings.extend(warnings);
                    }
                    Err(err) => {
                        warn!("{err}");
                        sweep.warnings.push(err.to_string());
                    }
                }
            }
        }
        sweep
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtwatch_site::{ScriptedCalendar, ScriptedCourt, ScriptedSite};

    const TAKEN: &str = "color: red; cursor: not-allowed";

    fn venue(id: &str) -> Venue {
        Venue {
            id: id.into(),
            name: format!("Venue{id}"),
            short_name: id.into(),
            url: format!("https://booking.test/venue-details/{id}"),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 9, d).expect("date")
    }

    async fn signed_in(site: &mut ScriptedSite) {
        site.open_login().await.expect("open");
        site.submit_phone("9876543210").await.expect("phone");
        site.request_code().await.expect("request");
        site.submit_code("123456").await.expect("verify");
    }

    #[test]
    fn classification_is_conjunctive() {
        assert_eq!(classify(StatusMarkers::new(false, false)), Availability::Available);
        assert_eq!(classify(StatusMarkers::new(true, false)), Availability::Available);
        assert_eq!(classify(StatusMarkers::new(false, true)), Availability::Available);
        assert_eq!(classify(StatusMarkers::new(true, true)), Availability::Booked);
    }

    #[tokio::test]
    async fn probe_keeps_booked_slots_for_diagnostics() {
        let mut site = ScriptedSite::new().with_calendar(
            "A",
            day(19),
            ScriptedCalendar::Courts(vec![ScriptedCourt::new("Court 1")
                .slot("12:00-13:00", "")
                .slot("13:00-14:00", TAKEN)
                .slot("14:00-15:00", "color: red")]),
        );
        signed_in(&mut site).await;

        let outcome = Prober::new(Duration::ZERO)
            .probe(&mut site, &venue("A"), day(19))
            .await
            .expect("probe");
        let ProbeOutcome::Slots { records, warnings } = outcome else {
            panic!("expected slots");
        };
        assert!(warnings.is_empty());
        let availability: Vec<Availability> = records.iter().map(|r| r.availability).collect();
        assert_eq!(
            availability,
            vec![Availability::Available, Availability::Booked, Availability::Available]
        );
        assert_eq!(records[1].raw_status, TAKEN);
    }

    #[tokio::test]
    async fn failures_are_contained_per_court_and_date() {
        let mut site = ScriptedSite::new()
            .with_calendar("A", day(19), ScriptedCalendar::Fails("timeout".into()))
            .with_calendar(
                "A",
                day(22),
                ScriptedCalendar::Courts(vec![
                    ScriptedCourt::failing("Court 1"),
                    ScriptedCourt::new("Court 2").slot("12:00-13:00", ""),
                ]),
            );
        signed_in(&mut site).await;

        let sweep = Prober::new(Duration::ZERO)
            .probe_all(&mut site, &[venue("A")], &[day(19), day(22)])
            .await;
        assert!(!sweep.session_invalid);
        assert_eq!(sweep.records.len(), 1);
        assert_eq!(sweep.records[0].court, "Court 2");
        assert_eq!(sweep.warnings.len(), 2);
        assert_eq!(sweep.venues_checked, vec!["VenueA"]);
    }

    #[tokio::test]
    async fn session_loss_stops_the_sweep() {
        let mut site = ScriptedSite::new()
            .with_calendar("A", day(19), ScriptedCalendar::SessionInvalid)
            .with_calendar(
                "B",
                day(19),
                ScriptedCalendar::Courts(vec![
                    ScriptedCourt::new("Court 1").slot("12:00-13:00", "")
                ]),
            );
        let handle = site.handle();
        signed_in(&mut site).await;

        let sweep = Prober::new(Duration::ZERO)
            .probe_all(&mut site, &[venue("A"), venue("B")], &[day(19)])
            .await;
        assert!(sweep.session_invalid);
        assert!(sweep.records.is_empty());
        assert_eq!(handle.calendar_requests(), 1);
    }

    #[tokio::test]
    async fn session_lost_between_courts_stops_the_sweep() {
        let mut site = ScriptedSite::new()
            .with_calendar(
                "A",
                day(19),
                ScriptedCalendar::Courts(vec![
                    ScriptedCourt::new("Court 1").slot("12:00-13:00", ""),
                    ScriptedCourt::losing_session("Court 2"),
                ]),
            )
            .with_calendar(
                "A",
                day(22),
                ScriptedCalendar::Courts(vec![
                    ScriptedCourt::new("Court 1").slot("12:00-13:00", "")
                ]),
            );
        let handle = site.handle();
        signed_in(&mut site).await;

        let prober = Prober::new(Duration::ZERO);
        assert_eq!(
            prober.probe(&mut site, &venue("A"), day(19)).await.expect("read"),
            ProbeOutcome::SessionInvalid
        );

        let sweep = prober.probe_all(&mut site, &[venue("A")], &[day(19), day(22)]).await;
        assert!(sweep.session_invalid);
        assert!(sweep.warnings.is_empty());
        assert_eq!(handle.calendar_requests(), 2);
    }

    #[tokio::test]
    async fn empty_dates_are_not_errors() {
        let mut site = ScriptedSite::new();
        signed_in(&mut site).await;
        let sweep = Prober::new(Duration::ZERO)
            .probe_all(&mut site, &[venue("A")], &[day(19)])
            .await;
        assert!(sweep.records.is_empty());
        assert!(sweep.warnings.is_empty());
        assert!(!sweep.session_invalid);
    }
}
