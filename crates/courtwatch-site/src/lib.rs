//! Browsing/request context abstraction for the booking site.
//!
//! The rest of the pipeline only ever talks to [`SiteDriver`]. How a control
//! is found on the remote side (which selector, which endpoint) stays inside
//! the driver and its [`locate::Locator`]s.

use async_trait::async_trait;
use chrono::NaiveDate;
use courtwatch_types::{session::Session, slot::TimeRange, slot::Venue, CourtwatchError, Result};

pub mod http;
pub mod locate;
pub mod markers;
pub mod mock;
pub mod surface;

pub use http::HttpSite;
pub use locate::{Intent, Locator};
pub use markers::StatusMarkers;
pub use mock::{ScriptHandle, ScriptedCalendar, ScriptedCourt, ScriptedSite};
pub use surface::{classify_surface, Surface};

/// Where a navigation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Landing {
    pub url: String,
    pub surface: Surface,
}

impl Landing {
    pub fn is_login(&self) -> bool {
        self.surface.is_login_like()
    }
}

/// Result of acting on a located control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Done,
    /// Every strategy for the intent was tried without finding the control.
    Missing(Intent),
    /// The site answered but refused the action.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CourtRef {
    pub id: String,
    pub name: String,
}

/// Courts offered by a venue on a date, or proof that the session is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourtListing {
    Courts(Vec<CourtRef>),
    SessionInvalid,
}

/// Slots rendered for one court, or proof that the session is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CourtSlots {
    Slots(Vec<RawSlot>),
    SessionInvalid,
}

/// A slot exactly as the site rendered it, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSlot {
    pub time: TimeRange,
    pub markers: StatusMarkers,
    pub token: String,
}

#[async_trait]
pub trait SiteDriver: Send + Sync {
    /// Installs cookies and client storage ahead of any navigation.
    async fn install_session(&mut self, session: &Session) -> Result<()>;
    async fn capture_session(&self) -> Result<Session>;
    async fn clear_session(&mut self) -> Result<()>;

    async fn navigate(&mut self, url: &str) -> Result<Landing>;
    /// Navigates to the page only signed-in users should be able to see.
    async fn protected_landing(&mut self) -> Result<Landing>;
    /// Requests a resource that only answers for an authenticated identity.
    async fn reach_authenticated_resource(&mut self) -> Result<bool>;

    async fn open_login(&mut self) -> Result<Surface>;
    async fn switch_to_login(&mut self) -> Result<Surface>;
    async fn submit_phone(&mut self, phone: &str) -> Result<ControlOutcome>;
    async fn request_code(&mut self) -> Result<ControlOutcome>;
    async fn submit_code(&mut self, code: &str) -> Result<ControlOutcome>;

    async fn list_courts(&mut self, venue: &Venue, date: NaiveDate) -> Result<CourtListing>;
    async fn court_slots(
        &mut self,
        venue: &Venue,
        date: NaiveDate,
        court: &CourtRef,
    ) -> Result<CourtSlots>;
}

/// Generate an error aligned with site semantics.
pub fn site_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Site(message.into())
}

/// Presents a numeric court name the way the booking page does.
pub fn court_label(id: &str, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        format!("Court {}", id.trim())
    } else if name.chars().all(|c| c.is_ascii_digit()) {
        format!("Court {name}")
    } else {
        name.to_string()
    }
}

/// Keeps the last four digits of a phone number for log lines.
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail: String = digits.iter().skip(digits.len().saturating_sub(4)).collect();
    format!("******{tail}")
}
