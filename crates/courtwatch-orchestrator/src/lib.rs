//! Poll scheduler coordinating authentication, probing, aggregation and
//! notification, one cycle at a time.

use std::{any::Any, panic::AssertUnwindSafe, time::Instant};

use chrono::{Local, NaiveDate, Utc};
use courtwatch_aggregate::aggregate;
use courtwatch_auth::{
    AuthFailure, AuthOutcome, AuthSettings, Authenticator, CodeSource, SessionStore,
};
use courtwatch_notify::{format::describe, ChatChannel, NotificationLedger, Notifier};
use courtwatch_ops::{ensure_data_dir, CheckHistory, Shutdown};
use courtwatch_probe::Prober;
use courtwatch_site::SiteDriver;
use courtwatch_types::{
    config::CourtwatchConfig,
    history::CheckCycleResult,
    session::Session,
    slot::SlotRecord,
    CourtwatchError, Result,
};
use futures::{stream::BoxStream, FutureExt, StreamExt};
use tokio::{sync::broadcast, time::Duration};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const LEDGER_FILE: &str = "sent_notifications.json";
const HISTORY_FILE: &str = "check_history.json";
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Authenticating,
    Probing,
    Aggregating,
    Notifying,
}

/// Everything one cycle produced.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub result: CheckCycleResult,
    /// Aggregated available slots, announced or not.
    pub slots: Vec<SlotRecord>,
    /// Slots that went out on the chat this cycle.
    pub announced: Vec<SlotRecord>,
}

#[derive(Debug, Clone)]
pub enum CycleEvent {
    Phase { cycle_id: Uuid, phase: CyclePhase },
    Finished(CycleReport),
}

pub fn orchestrator_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Orchestrator(message.into())
}

/// Runs monitoring cycles against one site, one authenticated context at a
/// time.
pub struct Monitor<S, K, C>
where
    S: SiteDriver,
    K: CodeSource,
    C: ChatChannel,
{
    site: S,
    auth: Authenticator<K>,
    prober: Prober,
    notifier: Notifier<C>,
    history: CheckHistory,
    config: CourtwatchConfig,
    shutdown: Shutdown,
    events: broadcast::Sender<CycleEvent>,
    phase: CyclePhase,
    force_login: bool,
    cycles: u64,
}

impl<S, K, C> Monitor<S, K, C>
where
    S: SiteDriver,
    K: CodeSource,
    C: ChatChannel,
{
    pub fn new(
        config: CourtwatchConfig,
        site: S,
        auth: Authenticator<K>,
        notifier: Notifier<C>,
        history: CheckHistory,
        shutdown: Shutdown,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            site,
            auth,
            prober: Prober::from_config(&config.site),
            notifier,
            history,
            config,
            shutdown,
            events,
            phase: CyclePhase::Idle,
            force_login: false,
            cycles: 0,
        }
    }

    /// Wires the session store, ledger and history under the configured data
    /// directory.
    pub fn assemble(
        config: CourtwatchConfig,
        site: S,
        codes: K,
        channel: C,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let data_dir = ensure_data_dir(&config.storage.data_dir)?;
        let store = SessionStore::new(&data_dir, config.session_max_age());
        let auth = Authenticator::new(
            AuthSettings::from_config(&config),
            codes,
            store,
            shutdown.clone(),
        );
        let notifier = Notifier::new(
            channel,
            NotificationLedger::load(data_dir.join(LEDGER_FILE)),
            config.notify.clone(),
        );
        let history = CheckHistory::load(data_dir.join(HISTORY_FILE), config.ops.history_len);
        Ok(Self::new(config, site, auth, notifier, history, shutdown))
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub fn history(&self) -> &CheckHistory {
        &self.history
    }

    pub fn notifier(&self) -> &Notifier<C> {
        &self.notifier
    }

    pub fn subscribe(&self) -> BoxStream<'static, CycleEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| async move { event.ok() })
            .boxed()
    }

    fn publish(&self, event: CycleEvent) {
        let _ = self.events.send(event);
    }

    fn enter(&mut self, cycle_id: Uuid, phase: CyclePhase) {
        info!("Cycle {} {:?} -> {:?}", cycle_id, self.phase, phase);
        self.phase = phase;
        self.publish(CycleEvent::Phase { cycle_id, phase });
    }

    /// Loops cycles on the configured interval until shutdown is requested.
    pub async fn run(&mut self) {
        let interval = Duration::from_secs(self.config.scheduler.interval_secs);
        let dates = self.config.dates.resolve(today());
        self.notifier
            .announce_startup(&self.config.venues, &dates, self.config.scheduler.interval_secs)
            .await;

        while !self.shutdown.is_triggered() {
            self.run_cycle().await;
            info!("Next check in {}s", interval.as_secs());
            let shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Scheduler stopped");
    }

    /// Runs one full cycle. Never fails: every error, panics included, ends
    /// up in the returned report and the check history.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let clock = Instant::now();
        let mut result = CheckCycleResult::started(Utc::now());
        let cycle_id = result.cycle_id;
        info!("Cycle {cycle_id} started");

        let outcome = AssertUnwindSafe(self.try_cycle(&mut result))
            .catch_unwind()
            .await;
        let (slots, announced) = match outcome {
            Ok(Ok(work)) => work,
            Ok(Err(err)) => {
                self.fail_cycle(&mut result, err.to_string()).await;
                (Vec::new(), Vec::new())
            }
            Err(payload) => {
                let message = format!("cycle panicked: {}", panic_message(payload.as_ref()));
                self.force_login = true;
                self.fail_cycle(&mut result, message).await;
                (Vec::new(), Vec::new())
            }
        };

        self.enter(cycle_id, CyclePhase::Idle);
        result.success = result.error.is_none();
        result.duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        if result.success {
            info!(
                "Cycle {cycle_id} finished: {} slots, {} announced, {} warnings in {}ms",
                result.slots_found,
                announced.len(),
                result.warnings.len(),
                result.duration_ms
            );
        }
        if let Err(err) = self.history.record(result.clone()).await {
            warn!("Failed to record check history: {err}");
        }

        self.cycles += 1;
        let every = u64::from(self.config.notify.prune_every_cycles);
        if every > 0 && self.cycles % every == 0 {
            if let Err(err) = self.notifier.prune(Utc::now()) {
                warn!("Failed to prune notification ledger: {err}");
            }
        }

        let report = CycleReport {
            result,
            slots,
            announced,
        };
        self.publish(CycleEvent::Finished(report.clone()));
        report
    }

    async fn fail_cycle(&mut self, result: &mut CheckCycleResult, message: String) {
        error!("Cycle {} failed: {message}", result.cycle_id);
        if !self.shutdown.is_triggered() {
            self.notifier.report_failure(&message).await;
        }
        result.error = Some(message);
    }

    async fn try_cycle(
        &mut self,
        result: &mut CheckCycleResult,
    ) -> Result<(Vec<SlotRecord>, Vec<SlotRecord>)> {
        let cycle_id = result.cycle_id;
        let today = today();
        let stale = self.config.dates.stale_entries(today);
        if stale > 0 {
            warn!("Ignoring {stale} configured dates that are already past");
        }
        let dates = self.config.dates.resolve(today);
        if dates.is_empty() {
            return Err(orchestrator_error("date plan has no upcoming dates"));
        }

        self.enter(cycle_id, CyclePhase::Authenticating);
        let force_fresh = std::mem::take(&mut self.force_login);
        let restored = match self.auth.ensure_session(&mut self.site, force_fresh).await {
            AuthOutcome::Restored(session) => Some(session),
            AuthOutcome::LoggedIn(_) => None,
            AuthOutcome::Failed(AuthFailure::Cancelled) => {
                return Err(orchestrator_error("cycle cancelled during login"))
            }
            AuthOutcome::Failed(failure) => {
                return Err(orchestrator_error(format!("authentication failed: {failure}")))
            }
        };

        self.enter(cycle_id, CyclePhase::Probing);
        let sweep = self
            .prober
            .probe_all(&mut self.site, &self.config.venues, &dates)
            .await;
        debug!("Observed {} slots in total", sweep.observed);
        result.venues_checked = sweep.venues_checked;
        result.warnings = sweep.warnings;
        if sweep.session_invalid {
            warn!("Session became invalid mid-probe, next cycle logs in from scratch");
            self.force_login = true;
            self.auth.store().clear();
            result
                .warnings
                .push("session became invalid while probing".to_string());
        } else if let Some(session) = restored {
            self.resave(&session).await;
        }

        self.enter(cycle_id, CyclePhase::Aggregating);
        let slots = aggregate(&sweep.records, &self.config.preferences);
        result.slots_found = slots.len();
        for slot in &slots {
            debug!("Available: {}", describe(slot));
        }

        self.enter(cycle_id, CyclePhase::Notifying);
        let announced = match self.notifier.notify(&slots).await {
            Ok(sent) => sent,
            Err(err) => {
                // The ledger is untouched, so these slots are offered again next cycle.
                warn!("Notification failed: {err}");
                result.error = Some(err.to_string());
                Vec::new()
            }
        };
        Ok((slots, announced))
    }

    /// Keeps the restored session's clock running after it proved itself.
    async fn resave(&self, restored: &Session) {
        let live = match self.site.capture_session().await {
            Ok(live) => live,
            Err(err) => {
                debug!("Could not capture live session, re-saving the restored one: {err}");
                restored.clone()
            }
        };
        self.auth.store().save(&live.restamped(Utc::now()));
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use courtwatch_auth::OneTimeCode;
    use courtwatch_notify::MemoryChannel;
    use courtwatch_site::{ScriptHandle, ScriptedCalendar, ScriptedCourt, ScriptedSite};
    use courtwatch_types::{dates::DatePlan, slot::Venue};

    /// Answers every prompt with the same code.
    struct RepeatingCode(&'static str);

    #[async_trait]
    impl CodeSource for RepeatingCode {
        async fn next_code(&mut self) -> Result<Option<OneTimeCode>> {
            Ok(OneTimeCode::parse(self.0))
        }
    }

    fn venue(id: &str) -> Venue {
        Venue {
            id: id.into(),
            name: format!("Venue{id}"),
            short_name: id.into(),
            url: format!("https://booking.test/venue-details/{id}"),
        }
    }

    fn config(venues: Vec<Venue>) -> CourtwatchConfig {
        let dir = std::env::temp_dir().join(format!("courtwatch-monitor-{}", Uuid::new_v4()));
        let mut config = CourtwatchConfig::default();
        config.credentials.phone_number = "9876543210".into();
        config.credentials.bot_token = "token".into();
        config.credentials.chat_id = "42".into();
        config.venues = venues;
        config.dates = DatePlan::NextDays {
            count: 1,
            include_today: true,
        };
        config.site.request_delay_ms = 0;
        config.auth.code_timeout_secs = 5;
        config.notify.dispatch_attempts = 1;
        config.notify.retry_backoff_ms = 0;
        config.storage.data_dir = dir.to_string_lossy().into_owned();
        config
    }

    fn monitor(
        config: CourtwatchConfig,
        site: ScriptedSite,
        channel: MemoryChannel,
    ) -> Monitor<ScriptedSite, RepeatingCode, MemoryChannel> {
        Monitor::assemble(config, site, RepeatingCode("123456"), channel, Shutdown::new())
            .expect("assemble")
    }

    fn open_court(handle: &ScriptHandle, venue_id: &str) {
        handle.set_calendar(
            venue_id,
            today(),
            ScriptedCalendar::Courts(vec![ScriptedCourt::new("Court 1")
                .slot("12:00-13:00", "")
                .slot("13:00-14:00", "color: red; cursor: not-allowed")]),
        );
    }

    fn cleanup(config: &CourtwatchConfig) {
        let _ = std::fs::remove_dir_all(&config.storage.data_dir);
    }

    #[tokio::test]
    async fn happy_path_announces_once() {
        let config = config(vec![venue("A")]);
        let site = ScriptedSite::new();
        let handle = site.handle();
        open_court(&handle, "A");
        let channel = MemoryChannel::new();
        let mut monitor = monitor(config.clone(), site, channel.clone());

        let first = monitor.run_cycle().await;
        assert!(first.result.success, "{:?}", first.result.error);
        assert_eq!(first.result.slots_found, 1);
        assert_eq!(first.announced.len(), 1);
        let sent = channel.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("VenueA"));
        assert!(sent[0].contains("Court 1"));
        assert!(sent[0].contains("12:00-13:00"));
        assert!(!sent[0].contains("13:00-14:00"));

        let second = monitor.run_cycle().await;
        assert!(second.result.success);
        assert_eq!(second.result.slots_found, 1);
        assert!(second.announced.is_empty());
        assert_eq!(channel.sent().await.len(), 1);
        assert_eq!(handle.logins(), 1);
        assert_eq!(monitor.history().snapshot().await.len(), 2);
        assert_eq!(monitor.phase(), CyclePhase::Idle);
        cleanup(&config);
    }

    #[tokio::test]
    async fn partial_failure_still_succeeds() {
        let config = config(vec![venue("A"), venue("B")]);
        let site = ScriptedSite::new();
        let handle = site.handle();
        handle.set_calendar("A", today(), ScriptedCalendar::Fails("timeout".into()));
        open_court(&handle, "B");
        let channel = MemoryChannel::new();
        let mut monitor = monitor(config.clone(), site, channel.clone());

        let report = monitor.run_cycle().await;
        assert!(report.result.success);
        assert_eq!(report.result.slots_found, 1);
        assert_eq!(report.result.warnings.len(), 1);
        assert_eq!(report.result.venues_checked, vec!["VenueA", "VenueB"]);
        assert_eq!(report.announced[0].venue_id, "B");
        cleanup(&config);
    }

    #[tokio::test]
    async fn session_loss_forces_login_next_cycle() {
        let config = config(vec![venue("A")]);
        let site = ScriptedSite::new();
        let handle = site.handle();
        open_court(&handle, "A");
        let mut monitor = monitor(config.clone(), site, MemoryChannel::new());

        assert!(monitor.run_cycle().await.result.success);
        assert_eq!(handle.logins(), 1);

        handle.set_calendar("A", today(), ScriptedCalendar::SessionInvalid);
        let lost = monitor.run_cycle().await;
        assert!(lost.result.success);
        assert!(lost.result.warnings.iter().any(|w| w.contains("invalid")));
        assert_eq!(handle.logins(), 1);

        open_court(&handle, "A");
        let recovered = monitor.run_cycle().await;
        assert!(recovered.result.success);
        assert_eq!(handle.logins(), 2);
        cleanup(&config);
    }

    #[tokio::test]
    async fn failed_dispatch_is_retried_next_cycle() {
        let config = config(vec![venue("A")]);
        let site = ScriptedSite::new();
        open_court(&site.handle(), "A");
        let channel = MemoryChannel::new();
        let mut monitor = monitor(config.clone(), site, channel.clone());

        channel.fail_next(1).await;
        let failed = monitor.run_cycle().await;
        assert!(!failed.result.success);
        assert!(failed.announced.is_empty());
        assert!(monitor.notifier().ledger().is_empty());

        let retried = monitor.run_cycle().await;
        assert!(retried.result.success);
        assert_eq!(retried.announced.len(), 1);
        cleanup(&config);
    }

    #[tokio::test]
    async fn login_failure_is_reported_and_survived() {
        let config = config(vec![venue("A")]);
        let site = ScriptedSite::new().with_accepted_code("999999");
        let channel = MemoryChannel::new();
        let mut monitor = monitor(config.clone(), site, channel.clone());
        let mut events = monitor.subscribe();

        let report = monitor.run_cycle().await;
        assert!(!report.result.success);
        assert!(report
            .result
            .error
            .as_deref()
            .is_some_and(|e| e.contains("authentication failed")));
        let sent = channel.sent().await;
        assert!(sent.iter().any(|text| text.contains("Court check failed")));

        let mut phases = Vec::new();
        while let Some(event) = events.next().await {
            match event {
                CycleEvent::Phase { phase, .. } => phases.push(phase),
                CycleEvent::Finished(_) => break,
            }
        }
        assert_eq!(phases, vec![CyclePhase::Authenticating, CyclePhase::Idle]);
        cleanup(&config);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let mut config = config(vec![venue("A")]);
        config.scheduler.interval_secs = 3600;
        config.notify.startup_message = false;
        let shutdown = Shutdown::new();
        let mut monitor = Monitor::assemble(
            config.clone(),
            ScriptedSite::new(),
            RepeatingCode("123456"),
            MemoryChannel::new(),
            shutdown.clone(),
        )
        .expect("assemble");

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();
        });
        tokio::time::timeout(Duration::from_secs(5), monitor.run())
            .await
            .expect("loop stops");
        trigger.await.expect("join");
        assert_eq!(monitor.history().snapshot().await.len(), 1);
        cleanup(&config);
    }
}
