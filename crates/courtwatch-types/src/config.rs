use std::{collections::HashSet, fs, path::Path};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{
    dates::DatePlan,
    slot::{TimeRange, Venue},
    CourtwatchError, Result,
};

const MAX_PLAN_DAYS: u32 = 366;
const MAX_RETENTION_DAYS: i64 = 3_650;
const MAX_SESSION_AGE_MINS: i64 = 60 * 24 * 365;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
}

/// Candidate lists tried in order when locating a control on the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub open_login: Vec<String>,
    pub switch_to_login: Vec<String>,
    pub send_code: Vec<String>,
    pub verify_code: Vec<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            open_login: vec!["/".into(), "/login".into()],
            switch_to_login: vec!["/login".into(), "/?mode=login".into(), "/signin".into()],
            send_code: vec![
                "Customer/Login/SendOTP".into(),
                "Customer/SendOTP".into(),
                "Login/SendOTP".into(),
            ],
            verify_code: vec![
                "Customer/Login/VerifyOTP".into(),
                "Customer/VerifyOTP".into(),
                "Login/VerifyOTP".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    pub base_url: String,
    pub api_base: String,
    pub protected_path: String,
    pub profile_endpoint: String,
    pub calendar_endpoint: String,
    pub token_key: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// Pause between consecutive calendar requests.
    pub request_delay_ms: u64,
    pub strategies: StrategyConfig,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://booking.gopichandacademy.com".into(),
            api_base: "https://adminbooking.gopichandacademy.com/API".into(),
            protected_path: "/venuePage/1".into(),
            profile_endpoint: "Customer/Data/Get/Profile".into(),
            calendar_endpoint: "Get/Calender".into(),
            token_key: "loginToken".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36"
                .into(),
            request_timeout_secs: 20,
            request_delay_ms: 1_000,
            strategies: StrategyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreferenceConfig {
    pub preferred_times: Vec<TimeRange>,
    pub acceptable_times: Vec<TimeRange>,
    pub preferred_courts: Vec<String>,
    /// Drop records that end up without a tier.
    pub drop_unranked: bool,
}

impl PreferenceConfig {
    pub fn is_empty(&self) -> bool {
        self.preferred_times.is_empty()
            && self.acceptable_times.is_empty()
            && self.preferred_courts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSourceKind {
    /// Operator types the code on stdin.
    Stdin,
    /// Operator replies with the code on the notification chat.
    Chat,
    /// Code provided up front (e.g. `OTP_CODE`) for one-shot unattended runs.
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub code_source: CodeSourceKind,
    pub code_timeout_secs: u64,
    pub code_poll_secs: u64,
    pub static_code: Option<String>,
    pub switch_attempts: u8,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_source: CodeSourceKind::Chat,
            code_timeout_secs: 300,
            code_poll_secs: 3,
            static_code: None,
            switch_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Send a "nothing new" message at most this often. `None` disables it.
    pub heartbeat_hours: Option<u64>,
    pub max_slots_per_message: usize,
    pub dispatch_attempts: u32,
    pub retry_backoff_ms: u64,
    pub retention_days: i64,
    pub prune_every_cycles: u32,
    pub startup_message: bool,
    pub error_messages: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            heartbeat_hours: None,
            max_slots_per_message: 40,
            dispatch_attempts: 3,
            retry_backoff_ms: 2_000,
            retention_days: 7,
            prune_every_cycles: 10,
            startup_message: true,
            error_messages: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// An operator is around to answer code prompts; sessions are short lived.
    #[default]
    Interactive,
    /// Headless long-running polling; sessions are kept for up to a day.
    Unattended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub mode: RunMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15 * 60,
            mode: RunMode::Interactive,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Overrides the mode-derived session freshness threshold.
    pub session_max_age_mins: Option<i64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".into(),
            session_max_age_mins: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub log_level: String,
    pub history_len: usize,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            history_len: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourtwatchConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default = "default_venues")]
    pub venues: Vec<Venue>,
    #[serde(default)]
    pub dates: DatePlan,
    #[serde(default)]
    pub preferences: PreferenceConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub ops: OpsConfig,
}

impl Default for CourtwatchConfig {
    fn default() -> Self {
        Self {
            credentials: CredentialsConfig::default(),
            site: SiteConfig::default(),
            venues: default_venues(),
            dates: DatePlan::default(),
            preferences: PreferenceConfig::default(),
            auth: AuthConfig::default(),
            notify: NotifyConfig::default(),
            scheduler: SchedulerConfig::default(),
            storage: StorageConfig::default(),
            ops: OpsConfig::default(),
        }
    }
}

pub fn default_venues() -> Vec<Venue> {
    let base = SiteConfig::default().base_url;
    [
        ("1", "Kotak Pullela Gopichand Badminton Academy", "Kotak"),
        ("2", "Pullela Gopichand Badminton Academy", "Pullela"),
        ("3", "SAI Pullela Gopichand National Badminton Academy", "SAI"),
    ]
    .into_iter()
    .map(|(id, name, short)| Venue {
        id: id.into(),
        name: name.into(),
        short_name: short.into(),
        url: format!("{base}/venue-details/{id}"),
    })
    .collect()
}

impl CourtwatchConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|err| {
            CourtwatchError::Configuration(format!(
                "unable to read config file {}: {err}",
                path_ref.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|err| {
            CourtwatchError::Configuration(format!(
                "failed to parse config file {}: {err}",
                path_ref.display()
            ))
        })
    }

    /// Lets secrets come from the environment instead of the config file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(phone) = non_empty("PHONE_NUMBER") {
            self.credentials.phone_number = phone;
        }
        if let Some(token) = non_empty("TELEGRAM_BOT_TOKEN") {
            self.credentials.bot_token = token;
        }
        if let Some(chat) = non_empty("TELEGRAM_CHAT_ID") {
            self.credentials.chat_id = chat;
        }
        if let Some(code) = non_empty("OTP_CODE") {
            self.auth.static_code = Some(code);
        }
    }

    /// Freshness threshold for a restored session.
    pub fn session_max_age(&self) -> Duration {
        match self.storage.session_max_age_mins {
            Some(minutes) => Duration::minutes(minutes),
            None => match self.scheduler.mode {
                RunMode::Interactive => Duration::minutes(30),
                RunMode::Unattended => Duration::hours(24),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        let missing = [
            ("credentials.phone_number", &self.credentials.phone_number),
            ("credentials.bot_token", &self.credentials.bot_token),
            ("credentials.chat_id", &self.credentials.chat_id),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(CourtwatchError::Configuration(format!(
                "missing required configuration: {}",
                missing.join(", ")
            )));
        }
        if self.venues.is_empty() {
            return Err(CourtwatchError::Configuration(
                "at least one venue must be configured".into(),
            ));
        }
        let mut seen = HashSet::new();
        for venue in &self.venues {
            if !seen.insert(venue.id.as_str()) {
                return Err(CourtwatchError::Configuration(format!(
                    "duplicate venue id '{}'",
                    venue.id
                )));
            }
        }
        if self.dates.is_empty() {
            return Err(CourtwatchError::Configuration(
                "date plan does not produce any dates".into(),
            ));
        }
        if self.scheduler.interval_secs == 0 {
            return Err(CourtwatchError::Configuration(
                "scheduler.interval_secs must be greater than zero".into(),
            ));
        }
        if let DatePlan::NextDays { count, .. } = &self.dates {
            if *count > MAX_PLAN_DAYS {
                return Err(CourtwatchError::Configuration(format!(
                    "dates.count must be at most {MAX_PLAN_DAYS}"
                )));
            }
        }
        if self
            .storage
            .session_max_age_mins
            .is_some_and(|minutes| !(1..=MAX_SESSION_AGE_MINS).contains(&minutes))
        {
            return Err(CourtwatchError::Configuration(format!(
                "storage.session_max_age_mins must be between 1 and {MAX_SESSION_AGE_MINS}"
            )));
        }
        if self.auth.code_timeout_secs == 0 {
            return Err(CourtwatchError::Configuration(
                "auth.code_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.auth.code_source == CodeSourceKind::Static
            && self.auth.static_code.is_none()
        {
            return Err(CourtwatchError::Configuration(
                "auth.code_source = \"static\" requires auth.static_code or OTP_CODE".into(),
            ));
        }
        if self.site.request_timeout_secs == 0 {
            return Err(CourtwatchError::Configuration(
                "site.request_timeout_secs must be greater than zero".into(),
            ));
        }
        if !(1..=MAX_RETENTION_DAYS).contains(&self.notify.retention_days) {
            return Err(CourtwatchError::Configuration(format!(
                "notify.retention_days must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        if self.notify.dispatch_attempts == 0 {
            return Err(CourtwatchError::Configuration(
                "notify.dispatch_attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
