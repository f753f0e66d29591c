use std::collections::HashSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use courtwatch_types::{
    config::NotifyConfig,
    slot::{SlotRecord, Venue},
    Result,
};
use tracing::{info, warn};

use crate::{
    format::{format_digest, format_failure, format_heartbeat, format_startup},
    notify_error, ChatChannel, NotificationLedger,
};

/// Announces newly available slots at most once per retention window.
pub struct Notifier<C: ChatChannel> {
    channel: C,
    ledger: NotificationLedger,
    config: NotifyConfig,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl<C: ChatChannel> Notifier<C> {
    pub fn new(channel: C, ledger: NotificationLedger, config: NotifyConfig) -> Self {
        Self {
            channel,
            ledger,
            config,
            last_heartbeat: None,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn ledger(&self) -> &NotificationLedger {
        &self.ledger
    }

    fn retention(&self) -> Duration {
        Duration::days(self.config.retention_days)
    }

    /// Records not yet announced within the retention window, one per key.
    pub fn pending(&self, records: &[SlotRecord], now: DateTime<Utc>) -> Vec<SlotRecord> {
        let retention = self.retention();
        let mut seen = HashSet::new();
        records
            .iter()
            .filter(|record| !self.ledger.contains_fresh(&record.key(), now, retention))
            .filter(|record| seen.insert(record.key()))
            .cloned()
            .collect()
    }

    pub async fn notify(&mut self, records: &[SlotRecord]) -> Result<Vec<SlotRecord>> {
        self.notify_at(records, Utc::now()).await
    }

    /// Dispatches one digest of unannounced records and returns what was sent.
    ///
    /// The ledger only changes after the channel confirmed the message.
    pub async fn notify_at(
        &mut self,
        records: &[SlotRecord],
        now: DateTime<Utc>,
    ) -> Result<Vec<SlotRecord>> {
        let mut batch = self.pending(records, now);
        if batch.is_empty() {
            info!("No new slots to announce");
            self.maybe_heartbeat(now).await;
            return Ok(Vec::new());
        }

        let cap = self.config.max_slots_per_message.max(1);
        if batch.len() > cap {
            info!(
                "Holding back {} slots until the next cycle",
                batch.len() - cap
            );
            batch.truncate(cap);
        }

        self.dispatch(&format_digest(&batch, now)).await?;

        for record in &batch {
            self.ledger.insert(&record.key(), now);
        }
        if let Err(err) = self.ledger.save() {
            warn!("Failed to persist notification ledger: {err}");
        }
        info!("Announced {} new slots", batch.len());
        Ok(batch)
    }

    async fn maybe_heartbeat(&mut self, now: DateTime<Utc>) {
        let Some(hours) = self.config.heartbeat_hours else {
            return;
        };
        let due = self
            .last_heartbeat
            .map(|last| now - last >= Duration::hours(hours as i64))
            .unwrap_or(true);
        if !due {
            return;
        }
        match self.dispatch(&format_heartbeat(now)).await {
            Ok(()) => self.last_heartbeat = Some(now),
            Err(err) => warn!("Heartbeat not delivered: {err}"),
        }
    }

    /// Sends `text`, retrying with a linear backoff.
    pub async fn dispatch(&self, text: &str) -> Result<()> {
        let attempts = self.config.dispatch_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.channel.send(text).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!("Dispatch attempt {attempt}/{attempts} failed: {err}");
                    last_error = Some(err);
                }
            }
            if attempt < attempts {
                let backoff = self.config.retry_backoff_ms * u64::from(attempt);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }
        Err(notify_error(format!(
            "message not delivered after {attempts} attempts: {}",
            last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "unknown error".into())
        )))
    }

    pub async fn announce_startup(
        &self,
        venues: &[Venue],
        dates: &[NaiveDate],
        interval_secs: u64,
    ) {
        if !self.config.startup_message {
            return;
        }
        if let Err(err) = self.dispatch(&format_startup(venues, dates, interval_secs)).await {
            warn!("Startup message not delivered: {err}");
        }
    }

    /// Best-effort report of a failed cycle.
    pub async fn report_failure(&self, error: &str) {
        if !self.config.error_messages {
            return;
        }
        if let Err(err) = self.dispatch(&format_failure(error)).await {
            warn!("Failure report not delivered: {err}");
        }
    }

    pub fn prune(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.retention();
        let removed = self.ledger.prune(now, retention);
        if removed > 0 {
            self.ledger.save()?;
            info!("Pruned {removed} expired ledger entries");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryChannel;
    use courtwatch_types::slot::{Availability, TimeRange};
    use std::path::PathBuf;

    fn slot(court: &str) -> SlotRecord {
        SlotRecord {
            venue_id: "a".into(),
            venue_name: "VenueA".into(),
            date: NaiveDate::from_ymd_opt(2025, 9, 19).expect("date"),
            court: court.into(),
            time: TimeRange::hm((12, 0), (13, 0)).expect("range"),
            availability: Availability::Available,
            raw_status: "12:00-13:00|1|405".into(),
            preference: None,
        }
    }

    fn ledger_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("courtwatch-notifier-{}", uuid::Uuid::new_v4()))
            .join("sent_notifications.json")
    }

    fn notifier(config: NotifyConfig) -> (Notifier<MemoryChannel>, MemoryChannel, PathBuf) {
        let channel = MemoryChannel::new();
        let path = ledger_path();
        let notifier = Notifier::new(channel.clone(), NotificationLedger::load(&path), config);
        (notifier, channel, path)
    }

    fn quick() -> NotifyConfig {
        NotifyConfig {
            retry_backoff_ms: 0,
            ..NotifyConfig::default()
        }
    }

    #[tokio::test]
    async fn happy_path_then_repeat_cycle() {
        let (mut notifier, channel, path) = notifier(quick());
        let records = vec![slot("Court 1")];

        let sent = notifier.notify(&records).await.expect("notify");
        assert_eq!(sent, records);
        let messages = channel.sent().await;
        assert_eq!(messages.len(), 1);
        for part in ["VenueA", "2025-09-19", "Court 1", "12:00-13:00"] {
            assert!(messages[0].contains(part));
        }
        assert!(NotificationLedger::load(&path).notified_at(&records[0].key()).is_some());

        let again = notifier.notify(&records).await.expect("notify again");
        assert!(again.is_empty());
        assert_eq!(channel.sent().await.len(), 1);
        assert_eq!(notifier.ledger().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_ledger_untouched() {
        let (mut notifier, channel, path) = notifier(quick());
        let records = vec![slot("Court 1")];
        channel.fail_next(3).await;

        assert!(notifier.notify(&records).await.is_err());
        assert!(notifier.ledger().is_empty());
        assert!(!path.exists());
        assert_eq!(notifier.pending(&records, Utc::now()), records);

        let sent = notifier.notify(&records).await.expect("retry next cycle");
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let (mut notifier, channel, _) = notifier(quick());
        channel.fail_next(2).await;
        let sent = notifier.notify(&[slot("Court 1")]).await.expect("notify");
        assert_eq!(sent.len(), 1);
        assert_eq!(channel.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn overflow_waits_for_next_cycle() {
        let (mut notifier, _, _) = notifier(NotifyConfig {
            max_slots_per_message: 2,
            ..quick()
        });
        let records = vec![slot("Court 1"), slot("Court 2"), slot("Court 3"), slot("Court 1")];
        assert_eq!(notifier.pending(&records, Utc::now()).len(), 3);
        assert_eq!(notifier.notify(&records).await.expect("first").len(), 2);
        let rest = notifier.notify(&records).await.expect("second");
        assert_eq!(rest, vec![slot("Court 3")]);
    }

    #[tokio::test]
    async fn heartbeat_is_rate_limited() {
        let (mut notifier, channel, _) = notifier(NotifyConfig {
            heartbeat_hours: Some(6),
            ..quick()
        });
        let now = Utc::now();
        notifier.notify_at(&[], now).await.expect("first");
        notifier.notify_at(&[], now + Duration::hours(1)).await.expect("second");
        assert_eq!(channel.sent().await.len(), 1);
        notifier.notify_at(&[], now + Duration::hours(7)).await.expect("third");
        assert_eq!(channel.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn silent_by_default_when_nothing_new() {
        let (mut notifier, channel, _) = notifier(quick());
        notifier.notify(&[]).await.expect("notify");
        assert!(channel.sent().await.is_empty());
    }
}
