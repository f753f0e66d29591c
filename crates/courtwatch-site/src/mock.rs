use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use courtwatch_types::{
    session::{Session, SessionCookie},
    slot::Venue,
    CourtwatchError, Result,
};

use crate::{
    locate::{Attempt, Locator},
    site_error, ControlOutcome, CourtListing, CourtRef, CourtSlots, Intent, Landing, RawSlot,
    SiteDriver, StatusMarkers, Surface,
};

const BASE_URL: &str = "https://booking.test";
const TOKEN_KEY: &str = "loginToken";

const OPEN_LOGIN: &[&str] = &["button.login-btn", "text=Login / SignUp", "#login-button"];
const SWITCH_TO_LOGIN: &[&str] = &["text=Login", "a.switch-to-login", "button.login-tab"];
const PHONE_FIELD: &[&str] = &["input#mobile", "input[type=tel]", "input[name=mobile]"];
const SEND_CODE: &[&str] = &[
    "button.send-otp",
    "input.custom-button[value='Send OTP']",
    "text=Send OTP",
];
const CODE_FIELD: &[&str] = &["input#otp", "input[name=otp]", "input[maxlength='6']"];
const VERIFY: &[&str] = &["button.verify-otp", "text=Verify", "button[type=submit]"];

/// Controls the scripted page renders by default. The first strategy of each
/// intent is deliberately absent.
const DEFAULT_CONTROLS: &[&str] = &[
    "text=Login / SignUp",
    "a.switch-to-login",
    "input[type=tel]",
    "input.custom-button[value='Send OTP']",
    "input[name=otp]",
    "text=Verify",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCourt {
    pub name: String,
    /// `(HH:MM-HH:MM, inline style)` pairs.
    pub slots: Vec<(String, String)>,
    pub fails: bool,
    /// Reading this court finds the session gone.
    pub loses_session: bool,
}

impl ScriptedCourt {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            fails: false,
            loses_session: false,
        }
    }

    pub fn slot(mut self, range: &str, style: &str) -> Self {
        self.slots.push((range.to_string(), style.to_string()));
        self
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            fails: true,
            ..Self::new(name)
        }
    }

    pub fn losing_session(name: impl Into<String>) -> Self {
        Self {
            loses_session: true,
            ..Self::new(name)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedCalendar {
    SessionInvalid,
    Fails(String),
    Courts(Vec<ScriptedCourt>),
}

#[derive(Debug)]
struct ScriptState {
    controls: HashSet<String>,
    registration_first: bool,
    accepted_code: String,
    valid_sid: Option<String>,
    deny_resource: bool,
    calendars: HashMap<(String, NaiveDate), ScriptedCalendar>,
    code_requests: usize,
    logins: usize,
    calendar_requests: usize,
    submitted_codes: Vec<String>,
}

impl Default for ScriptState {
    fn default() -> Self {
        Self {
            controls: DEFAULT_CONTROLS.iter().map(|c| c.to_string()).collect(),
            registration_first: false,
            accepted_code: "123456".into(),
            valid_sid: None,
            deny_resource: false,
            calendars: HashMap::new(),
            code_requests: 0,
            logins: 0,
            calendar_requests: 0,
            submitted_codes: Vec::new(),
        }
    }
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Inspects and reshapes the remote side of a [`ScriptedSite`] while a
/// pipeline is holding the driver.
#[derive(Debug, Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    pub fn set_calendar(&self, venue_id: &str, date: NaiveDate, calendar: ScriptedCalendar) {
        lock(&self.state)
            .calendars
            .insert((venue_id.to_string(), date), calendar);
    }

    /// Makes the site forget every issued session.
    pub fn expire_session(&self) {
        lock(&self.state).valid_sid = None;
    }

    /// Keeps the landing page reachable but refuses the account resource,
    /// like a half-established session would.
    pub fn deny_resource(&self, denied: bool) {
        lock(&self.state).deny_resource = denied;
    }

    pub fn remove_control(&self, selector: &str) {
        lock(&self.state).controls.remove(selector);
    }

    pub fn set_registration_first(&self, enabled: bool) {
        lock(&self.state).registration_first = enabled;
    }

    pub fn code_requests(&self) -> usize {
        lock(&self.state).code_requests
    }

    pub fn logins(&self) -> usize {
        lock(&self.state).logins
    }

    pub fn calendar_requests(&self) -> usize {
        lock(&self.state).calendar_requests
    }

    pub fn submitted_codes(&self) -> Vec<String> {
        lock(&self.state).submitted_codes.clone()
    }
}

/// In-process stand-in for the booking site.
///
/// Login succeeds when the accepted code is submitted; a session stays valid
/// until [`ScriptHandle::expire_session`] is called.
#[derive(Debug, Default)]
pub struct ScriptedSite {
    state: Arc<Mutex<ScriptState>>,
    cookies: Vec<SessionCookie>,
    local_storage: BTreeMap<String, String>,
    session_storage: BTreeMap<String, String>,
    url: String,
    surface: Option<Surface>,
    phone: Option<String>,
}

impl ScriptedSite {
    pub fn new() -> Self {
        Self {
            url: BASE_URL.into(),
            ..Self::default()
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            state: Arc::clone(&self.state),
        }
    }

    pub fn with_calendar(
        self,
        venue_id: &str,
        date: NaiveDate,
        calendar: ScriptedCalendar,
    ) -> Self {
        self.handle().set_calendar(venue_id, date, calendar);
        self
    }

    pub fn with_registration_first(self) -> Self {
        self.handle().set_registration_first(true);
        self
    }

    pub fn with_accepted_code(self, code: &str) -> Self {
        lock(&self.state).accepted_code = code.to_string();
        self
    }

    fn current_sid(&self) -> Option<&str> {
        self.cookies
            .iter()
            .find(|cookie| cookie.name == "sid")
            .map(|cookie| cookie.value.as_str())
    }

    fn authenticated(&self) -> bool {
        let state = lock(&self.state);
        match (&state.valid_sid, self.current_sid(), self.local_storage.get(TOKEN_KEY)) {
            (Some(valid), Some(sid), Some(token)) => valid == sid && valid == token,
            _ => false,
        }
    }

    async fn locate(&self, intent: Intent, strategies: &[&str]) -> Result<Option<String>> {
        let present = lock(&self.state).controls.clone();
        Locator::new(intent, strategies.iter().copied())
            .first_match(|candidate| {
                let hit = present.contains(&candidate);
                async move {
                    Ok::<_, CourtwatchError>(if hit {
                        Attempt::Found(candidate)
                    } else {
                        Attempt::Miss
                    })
                }
            })
            .await
    }
}

#[async_trait]
impl SiteDriver for ScriptedSite {
    async fn install_session(&mut self, session: &Session) -> Result<()> {
        self.cookies = session.cookies.clone();
        self.local_storage = session.local_storage.clone();
        self.session_storage = session.session_storage.clone();
        self.url = session.url.clone();
        Ok(())
    }

    async fn capture_session(&self) -> Result<Session> {
        Ok(Session {
            cookies: self.cookies.clone(),
            local_storage: self.local_storage.clone(),
            session_storage: self.session_storage.clone(),
            url: self.url.clone(),
            captured_at: Utc::now(),
        })
    }

    async fn clear_session(&mut self) -> Result<()> {
        self.cookies.clear();
        self.local_storage.clear();
        self.session_storage.clear();
        self.surface = None;
        self.phone = None;
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<Landing> {
        self.url = url.to_string();
        Ok(Landing {
            url: url.to_string(),
            surface: Surface::Content,
        })
    }

    async fn protected_landing(&mut self) -> Result<Landing> {
        let landing = if self.authenticated() {
            Landing {
                url: format!("{BASE_URL}/venuePage/1"),
                surface: Surface::Content,
            }
        } else {
            Landing {
                url: format!("{BASE_URL}/login"),
                surface: Surface::Login,
            }
        };
        self.url = landing.url.clone();
        Ok(landing)
    }

    async fn reach_authenticated_resource(&mut self) -> Result<bool> {
        Ok(self.authenticated() && !lock(&self.state).deny_resource)
    }

    async fn open_login(&mut self) -> Result<Surface> {
        if self.locate(Intent::OpenLogin, OPEN_LOGIN).await?.is_none() {
            return Ok(Surface::Unknown);
        }
        let surface = if lock(&self.state).registration_first {
            Surface::Registration
        } else {
            Surface::Login
        };
        self.surface = Some(surface);
        Ok(surface)
    }

    async fn switch_to_login(&mut self) -> Result<Surface> {
        let surface = match self.locate(Intent::SwitchToLogin, SWITCH_TO_LOGIN).await? {
            Some(_) => Surface::Login,
            None => Surface::Registration,
        };
        self.surface = Some(surface);
        Ok(surface)
    }

    async fn submit_phone(&mut self, phone: &str) -> Result<ControlOutcome> {
        if self.surface != Some(Surface::Login) {
            return Ok(ControlOutcome::Rejected("login form is not open".into()));
        }
        if self.locate(Intent::PhoneField, PHONE_FIELD).await?.is_none() {
            return Ok(ControlOutcome::Missing(Intent::PhoneField));
        }
        self.phone = Some(phone.to_string());
        Ok(ControlOutcome::Done)
    }

    async fn request_code(&mut self) -> Result<ControlOutcome> {
        if self.phone.is_none() {
            return Ok(ControlOutcome::Rejected("no phone number submitted".into()));
        }
        if self.locate(Intent::SendCode, SEND_CODE).await?.is_none() {
            return Ok(ControlOutcome::Missing(Intent::SendCode));
        }
        lock(&self.state).code_requests += 1;
        Ok(ControlOutcome::Done)
    }

    async fn submit_code(&mut self, code: &str) -> Result<ControlOutcome> {
        if self.locate(Intent::CodeField, CODE_FIELD).await?.is_none() {
            return Ok(ControlOutcome::Missing(Intent::CodeField));
        }
        if self.locate(Intent::Verify, VERIFY).await?.is_none() {
            return Ok(ControlOutcome::Missing(Intent::Verify));
        }
        let sid = {
            let mut state = lock(&self.state);
            state.submitted_codes.push(code.to_string());
            if code != state.accepted_code {
                return Ok(ControlOutcome::Rejected("Invalid OTP".into()));
            }
            state.logins += 1;
            let sid = format!("sid-{}", state.logins);
            state.valid_sid = Some(sid.clone());
            sid
        };
        let mut cookie = SessionCookie::new("sid", sid.clone(), "booking.test");
        cookie.http_only = true;
        cookie.secure = true;
        self.cookies.retain(|existing| existing.name != "sid");
        self.cookies.push(cookie);
        self.local_storage.insert(TOKEN_KEY.into(), sid);
        self.surface = Some(Surface::Content);
        Ok(ControlOutcome::Done)
    }

    async fn list_courts(&mut self, venue: &Venue, date: NaiveDate) -> Result<CourtListing> {
        if !self.authenticated() {
            return Ok(CourtListing::SessionInvalid);
        }
        let mut state = lock(&self.state);
        state.calendar_requests += 1;
        match state.calendars.get(&(venue.id.clone(), date)) {
            None => Ok(CourtListing::Courts(Vec::new())),
            Some(ScriptedCalendar::SessionInvalid) => Ok(CourtListing::SessionInvalid),
            Some(ScriptedCalendar::Fails(message)) => Err(site_error(message.clone())),
            Some(ScriptedCalendar::Courts(courts)) => Ok(CourtListing::Courts(
                courts
                    .iter()
                    .enumerate()
                    .map(|(index, court)| CourtRef {
                        id: (index + 1).to_string(),
                        name: court.name.clone(),
                    })
                    .collect(),
            )),
        }
    }

    async fn court_slots(
        &mut self,
        venue: &Venue,
        date: NaiveDate,
        court: &CourtRef,
    ) -> Result<CourtSlots> {
        if !self.authenticated() {
            return Ok(CourtSlots::SessionInvalid);
        }
        let state = lock(&self.state);
        let Some(ScriptedCalendar::Courts(courts)) = state.calendars.get(&(venue.id.clone(), date))
        else {
            return Err(site_error(format!("no courts scripted for venue {}", venue.id)));
        };
        let scripted = court
            .id
            .parse::<usize>()
            .ok()
            .and_then(|index| courts.get(index.wrapping_sub(1)))
            .ok_or_else(|| site_error(format!("unknown court {}", court.name)))?;
        if scripted.fails {
            return Err(site_error(format!("{} did not render", scripted.name)));
        }
        if scripted.loses_session {
            return Ok(CourtSlots::SessionInvalid);
        }
        let slots = scripted
            .slots
            .iter()
            .map(|(range, style)| -> Result<RawSlot> {
                Ok(RawSlot {
                    time: range.parse()?,
                    markers: StatusMarkers::from_style(style),
                    token: style.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CourtSlots::Slots(slots))
    }
}
