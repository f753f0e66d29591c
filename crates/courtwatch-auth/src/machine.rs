//! Phone + one-time-code login as an explicit state machine.

use std::{fmt, time::Duration};

use courtwatch_ops::Shutdown;
use courtwatch_site::{mask_phone, ControlOutcome, Intent, SiteDriver, Surface};
use courtwatch_types::{config::CourtwatchConfig, session::Session, Result};
use tracing::{info, warn};

use crate::{
    code::{CodeSource, OneTimeCode},
    store::SessionStore,
};

/// Why a login attempt ended in [`AuthState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No code arrived before the deadline.
    Timeout,
    /// The site refused the phone, the code or the resulting session.
    Rejected(String),
    /// Every strategy for a control was exhausted.
    ControlNotFound(Intent),
    /// Shutdown was requested while waiting.
    Cancelled,
    /// The site could not be reached or answered garbage.
    Site(String),
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthFailure::Timeout => f.write_str("timed out waiting for the login code"),
            AuthFailure::Rejected(reason) => write!(f, "login rejected: {reason}"),
            AuthFailure::ControlNotFound(intent) => {
                write!(f, "could not locate the {intent} control")
            }
            AuthFailure::Cancelled => f.write_str("login cancelled by shutdown"),
            AuthFailure::Site(reason) => write!(f, "site error during login: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    PhoneSubmitted,
    CodeRequested,
    AwaitingCode,
    Verifying(OneTimeCode),
    Authenticated(Session),
    Failed(AuthFailure),
}

impl AuthState {
    pub fn name(&self) -> &'static str {
        match self {
            AuthState::Anonymous => "Anonymous",
            AuthState::PhoneSubmitted => "PhoneSubmitted",
            AuthState::CodeRequested => "CodeRequested",
            AuthState::AwaitingCode => "AwaitingCode",
            AuthState::Verifying(_) => "Verifying",
            AuthState::Authenticated(_) => "Authenticated",
            AuthState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthState::Authenticated(_) | AuthState::Failed(_))
    }
}

/// How a cycle obtained its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// A saved session passed verification.
    Restored(Session),
    /// The full login flow ran and succeeded.
    LoggedIn(Session),
    Failed(AuthFailure),
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub phone: String,
    pub code_timeout: Duration,
    /// How many times to try leaving a registration form for the login form.
    pub switch_attempts: u8,
}

impl AuthSettings {
    pub fn from_config(config: &CourtwatchConfig) -> Self {
        Self {
            phone: config.credentials.phone_number.clone(),
            code_timeout: Duration::from_secs(config.auth.code_timeout_secs),
            switch_attempts: config.auth.switch_attempts,
        }
    }
}

pub struct Authenticator<K: CodeSource> {
    settings: AuthSettings,
    codes: K,
    store: SessionStore,
    shutdown: Shutdown,
}

impl<K: CodeSource> Authenticator<K> {
    pub fn new(settings: AuthSettings, codes: K, store: SessionStore, shutdown: Shutdown) -> Self {
        Self {
            settings,
            codes,
            store,
            shutdown,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Returns a verified session, restoring the saved one when possible.
    ///
    /// With `force_fresh` the saved session is discarded without asking the
    /// site about it.
    pub async fn ensure_session<S>(&mut self, site: &mut S, force_fresh: bool) -> AuthOutcome
    where
        S: SiteDriver + ?Sized,
    {
        if force_fresh {
            info!("Previous session was invalidated, logging in from scratch");
            self.store.clear();
        } else if let Some(session) = self.store.load() {
            match self.verify_restored(site, &session).await {
                Ok(true) => {
                    info!("Restored session is still valid");
                    return AuthOutcome::Restored(session);
                }
                Ok(false) => info!("Restored session was rejected by the site"),
                Err(err) => warn!("Could not verify restored session: {err}"),
            }
        }

        match self.login(site).await {
            AuthState::Authenticated(session) => AuthOutcome::LoggedIn(session),
            AuthState::Failed(failure) => AuthOutcome::Failed(failure),
            other => AuthOutcome::Failed(AuthFailure::Site(format!(
                "login stopped in state {}",
                other.name()
            ))),
        }
    }

    async fn verify_restored<S>(&self, site: &mut S, session: &Session) -> Result<bool>
    where
        S: SiteDriver + ?Sized,
    {
        self.store.apply(session, site).await?;
        if site.protected_landing().await?.is_login() {
            return Ok(false);
        }
        site.reach_authenticated_resource().await
    }

    /// Runs the full flow from [`AuthState::Anonymous`] to a terminal state.
    /// A successful login is persisted before it is returned.
    pub async fn login<S>(&mut self, site: &mut S) -> AuthState
    where
        S: SiteDriver + ?Sized,
    {
        let mut state = AuthState::Anonymous;
        info!("Logging in as {}", mask_phone(&self.settings.phone));
        while !state.is_terminal() {
            let next = match self.step(site, &state).await {
                Ok(next) => next,
                Err(err) => AuthState::Failed(AuthFailure::Site(err.to_string())),
            };
            match &next {
                AuthState::Failed(failure) => {
                    warn!("Login {} -> Failed: {failure}", state.name())
                }
                _ => info!("Login {} -> {}", state.name(), next.name()),
            }
            state = next;
        }
        if let AuthState::Authenticated(session) = &state {
            self.store.save(session);
        }
        state
    }

    async fn step<S>(&mut self, site: &mut S, state: &AuthState) -> Result<AuthState>
    where
        S: SiteDriver + ?Sized,
    {
        if self.shutdown.is_triggered() {
            return Ok(AuthState::Failed(AuthFailure::Cancelled));
        }
        let next = match state {
            AuthState::Anonymous => self.submit_phone(site).await?,
            AuthState::PhoneSubmitted => {
                advance(site.request_code().await?, AuthState::CodeRequested)
            }
            AuthState::CodeRequested => {
                if let Err(err) = self.codes.prompt(self.settings.code_timeout).await {
                    warn!("Could not prompt for the login code: {err}");
                }
                AuthState::AwaitingCode
            }
            AuthState::AwaitingCode => match self.await_code().await? {
                Ok(code) => AuthState::Verifying(code),
                Err(failure) => AuthState::Failed(failure),
            },
            AuthState::Verifying(code) => self.verify(site, code).await?,
            AuthState::Authenticated(_) | AuthState::Failed(_) => state.clone(),
        };
        Ok(next)
    }

    async fn submit_phone<S>(&mut self, site: &mut S) -> Result<AuthState>
    where
        S: SiteDriver + ?Sized,
    {
        site.clear_session().await?;
        let mut surface = site.open_login().await?;
        let mut switches = 0;
        while surface == Surface::Registration && switches < self.settings.switch_attempts {
            switches += 1;
            info!("Registration form shown, switching to login (attempt {switches})");
            surface = site.switch_to_login().await?;
        }
        match surface {
            Surface::Login => {}
            Surface::Registration => {
                return Ok(AuthState::Failed(AuthFailure::ControlNotFound(
                    Intent::SwitchToLogin,
                )))
            }
            Surface::Content | Surface::Unknown => {
                return Ok(AuthState::Failed(AuthFailure::ControlNotFound(
                    Intent::OpenLogin,
                )))
            }
        }
        Ok(advance(
            site.submit_phone(&self.settings.phone).await?,
            AuthState::PhoneSubmitted,
        ))
    }

    async fn await_code(&mut self) -> Result<std::result::Result<OneTimeCode, AuthFailure>> {
        let shutdown = self.shutdown.clone();
        let deadline = tokio::time::sleep(self.settings.code_timeout);
        tokio::select! {
            _ = shutdown.wait() => Ok(Err(AuthFailure::Cancelled)),
            _ = deadline => Ok(Err(AuthFailure::Timeout)),
            code = self.codes.next_code() => match code? {
                Some(code) => Ok(Ok(code)),
                None => {
                    warn!("Code source ran dry before a code arrived");
                    Ok(Err(AuthFailure::Timeout))
                }
            },
        }
    }

    /// Submits the code, then requires both a non-login landing and a
    /// reachable authenticated resource.
    async fn verify<S>(&mut self, site: &mut S, code: &OneTimeCode) -> Result<AuthState>
    where
        S: SiteDriver + ?Sized,
    {
        let outcome = site.submit_code(code.as_str()).await?;
        if outcome != ControlOutcome::Done {
            return Ok(advance(outcome, AuthState::Anonymous));
        }
        if site.protected_landing().await?.is_login() {
            return Ok(AuthState::Failed(AuthFailure::Rejected(
                "site returned to the login form after verification".into(),
            )));
        }
        if !site.reach_authenticated_resource().await? {
            return Ok(AuthState::Failed(AuthFailure::Rejected(
                "authenticated resource not reachable after verification".into(),
            )));
        }
        Ok(AuthState::Authenticated(site.capture_session().await?))
    }
}

fn advance(outcome: ControlOutcome, next: AuthState) -> AuthState {
    match outcome {
        ControlOutcome::Done => next,
        ControlOutcome::Missing(intent) => AuthState::Failed(AuthFailure::ControlNotFound(intent)),
        ControlOutcome::Rejected(reason) => AuthState::Failed(AuthFailure::Rejected(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{ChatCodeSource, StaticCodeSource};
    use chrono::Duration as ChronoDuration;
    use courtwatch_notify::MemoryChannel;
    use courtwatch_site::ScriptedSite;

    fn settings(timeout: Duration) -> AuthSettings {
        AuthSettings {
            phone: "9876543210".into(),
            code_timeout: timeout,
            switch_attempts: 2,
        }
    }

    fn store() -> SessionStore {
        let dir = std::env::temp_dir().join(format!("courtwatch-auth-{}", uuid::Uuid::new_v4()));
        SessionStore::new(dir, ChronoDuration::minutes(30))
    }

    fn authenticator<K: CodeSource>(codes: K) -> Authenticator<K> {
        Authenticator::new(settings(Duration::from_secs(5)), codes, store(), Shutdown::new())
    }

    #[tokio::test]
    async fn happy_login_is_persisted() {
        let mut site = ScriptedSite::new();
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        let state = auth.login(&mut site).await;
        let AuthState::Authenticated(session) = state else {
            panic!("expected login, got {state:?}");
        };
        assert_eq!(auth.store().load().map(|s| s.cookies), Some(session.cookies));
        assert_eq!(site.handle().code_requests(), 1);
    }

    #[tokio::test]
    async fn registration_surface_is_switched_away() {
        let mut site = ScriptedSite::new().with_registration_first();
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        assert!(matches!(auth.login(&mut site).await, AuthState::Authenticated(_)));

        let mut stuck = ScriptedSite::new().with_registration_first();
        stuck.handle().remove_control("a.switch-to-login");
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        assert_eq!(
            auth.login(&mut stuck).await,
            AuthState::Failed(AuthFailure::ControlNotFound(Intent::SwitchToLogin))
        );
    }

    #[tokio::test]
    async fn wrong_code_fails_the_attempt() {
        let mut site = ScriptedSite::new();
        let mut auth = authenticator(StaticCodeSource::new("000000").expect("code"));
        assert!(matches!(
            auth.login(&mut site).await,
            AuthState::Failed(AuthFailure::Rejected(_))
        ));
        assert!(auth.store().load().is_none());
    }

    #[tokio::test]
    async fn unreachable_account_resource_rejects_login() {
        let mut site = ScriptedSite::new();
        site.handle().deny_resource(true);
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        let state = auth.login(&mut site).await;
        let AuthState::Failed(AuthFailure::Rejected(reason)) = state else {
            panic!("expected rejection, got {state:?}");
        };
        assert!(reason.contains("authenticated resource"));
        assert!(auth.store().load().is_none());
    }

    #[tokio::test]
    async fn saved_session_needs_the_account_resource() {
        let mut site = ScriptedSite::new();
        let handle = site.handle();
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        assert!(matches!(
            auth.ensure_session(&mut site, false).await,
            AuthOutcome::LoggedIn(_)
        ));

        handle.deny_resource(true);
        assert!(matches!(
            auth.ensure_session(&mut site, false).await,
            AuthOutcome::Failed(AuthFailure::Rejected(_))
        ));

        handle.deny_resource(false);
        assert!(matches!(
            auth.ensure_session(&mut site, false).await,
            AuthOutcome::LoggedIn(_) | AuthOutcome::Restored(_)
        ));
    }

    #[tokio::test]
    async fn missing_send_button_is_reported() {
        let mut site = ScriptedSite::new();
        site.handle().remove_control("input.custom-button[value='Send OTP']");
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        assert_eq!(
            auth.login(&mut site).await,
            AuthState::Failed(AuthFailure::ControlNotFound(Intent::SendCode))
        );
    }

    #[tokio::test]
    async fn silent_operator_times_out() {
        let mut site = ScriptedSite::new();
        let channel = MemoryChannel::new();
        let codes = ChatCodeSource::new(channel.clone(), "42", Duration::from_millis(5));
        let quick = settings(Duration::from_millis(50));
        let mut auth = Authenticator::new(quick, codes, store(), Shutdown::new());
        assert_eq!(
            auth.login(&mut site).await,
            AuthState::Failed(AuthFailure::Timeout)
        );
        assert_eq!(channel.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_the_wait() {
        let mut site = ScriptedSite::new();
        let shutdown = Shutdown::new();
        let codes = ChatCodeSource::new(MemoryChannel::new(), "42", Duration::from_millis(5));
        let mut auth =
            Authenticator::new(settings(Duration::from_secs(30)), codes, store(), shutdown.clone());
        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.trigger();
        });
        assert_eq!(
            auth.login(&mut site).await,
            AuthState::Failed(AuthFailure::Cancelled)
        );
        trigger.await.expect("join");
    }

    #[tokio::test]
    async fn saved_session_skips_login() {
        let mut site = ScriptedSite::new();
        let handle = site.handle();
        let mut auth = authenticator(StaticCodeSource::new("123456").expect("code"));
        assert!(matches!(
            auth.ensure_session(&mut site, false).await,
            AuthOutcome::LoggedIn(_)
        ));
        assert!(matches!(
            auth.ensure_session(&mut site, false).await,
            AuthOutcome::Restored(_)
        ));
        assert_eq!(handle.logins(), 1);
    }

    #[tokio::test]
    async fn rejected_saved_session_falls_back_to_login() {
        let mut site = ScriptedSite::new();
        let handle = site.handle();
        let mut first = authenticator(StaticCodeSource::new("123456").expect("code"));
        first.ensure_session(&mut site, false).await;
        handle.expire_session();

        let mut second = Authenticator::new(
            settings(Duration::from_secs(5)),
            StaticCodeSource::new("123456").expect("code"),
            first.store().clone(),
            Shutdown::new(),
        );
        assert!(matches!(
            second.ensure_session(&mut site, false).await,
            AuthOutcome::LoggedIn(_)
        ));
        assert_eq!(handle.logins(), 2);

        assert!(matches!(
            second.ensure_session(&mut site, true).await,
            AuthOutcome::Failed(AuthFailure::Timeout)
        ));
    }
}
