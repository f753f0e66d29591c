use std::{collections::BTreeMap, collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use courtwatch_types::{
    config::SiteConfig,
    session::{Session, SessionCookie},
    slot::Venue,
    CourtwatchError, Result,
};
use reqwest::{header::COOKIE, redirect::Policy, Client, Method, RequestBuilder, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    classify_surface, court_label,
    locate::{Attempt, Locator},
    markers::parse_slot_token,
    site_error, ControlOutcome, CourtListing, CourtRef, CourtSlots, Intent, Landing, SiteDriver,
    Surface,
};

const TOKEN_HEADER: &str = "LoginToken";
const SESSION_HINTS: &[&str] = &["login", "token", "unauthor", "session expired"];

/// One court's row of the calendar response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtSheet {
    pub court: CourtRef,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarReply {
    Courts(Vec<CourtSheet>),
    SessionInvalid,
}

struct Fetched {
    status: StatusCode,
    final_url: String,
    cookies: Vec<SessionCookie>,
    body: String,
}

/// Drives the booking site over plain HTTP.
///
/// Cookies are kept by the driver rather than by a `reqwest` jar so that they
/// can be captured into a [`Session`] and restored verbatim.
pub struct HttpSite {
    config: SiteConfig,
    client: Client,
    cookies: Vec<SessionCookie>,
    local_storage: BTreeMap<String, String>,
    session_storage: BTreeMap<String, String>,
    current_url: String,
    phone: Option<String>,
    sheets: HashMap<(String, NaiveDate), Vec<CourtSheet>>,
}

impl HttpSite {
    pub fn new(config: SiteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(config.user_agent.clone())
            .redirect(Policy::limited(5))
            .build()
            .map_err(|err| site_error(format!("failed to build HTTP client: {err}")))?;
        let current_url = config.base_url.clone();
        Ok(Self {
            config,
            client,
            cookies: Vec::new(),
            local_storage: BTreeMap::new(),
            session_storage: BTreeMap::new(),
            current_url,
            phone: None,
            sheets: HashMap::new(),
        })
    }

    fn site_url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    fn api_url(&self, path: &str) -> String {
        join_url(&self.config.api_base, path)
    }

    fn token(&self) -> Option<&str> {
        self.local_storage
            .get(&self.config.token_key)
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }

    fn prepare(&self, method: Method, url: Url, body: Option<&Value>) -> RequestBuilder {
        let mut request = self.client.request(method, url.clone());
        if let Some(header) = cookie_header(&self.cookies, &url, Utc::now()) {
            request = request.header(COOKIE, header);
        }
        if let Some(token) = self.token() {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request
    }

    fn absorb(&mut self, fresh: &[SessionCookie]) {
        let now = Utc::now();
        for cookie in fresh {
            self.cookies.retain(|existing| {
                !(existing.name == cookie.name
                    && existing.domain == cookie.domain
                    && existing.path == cookie.path)
            });
            if !cookie.is_expired_at(now) {
                self.cookies.push(cookie.clone());
            }
        }
    }

    async fn get(&mut self, url: &str) -> Result<Fetched> {
        let url = parse_url(url)?;
        let fetched = execute(self.prepare(Method::GET, url, None)).await?;
        self.absorb(&fetched.cookies);
        Ok(fetched)
    }

    /// Posts `payload` to each candidate endpoint until one exists.
    async fn post_first(
        &mut self,
        intent: Intent,
        candidates: &[String],
        payload: Value,
    ) -> Result<Option<Fetched>> {
        let locator = Locator::new(intent, candidates.iter().cloned());
        let this = &*self;
        let found = locator
            .first_match(|candidate| {
                let request = parse_url(&this.api_url(&candidate))
                    .map(|url| this.prepare(Method::POST, url, Some(&payload)));
                async move {
                    let fetched = execute(request?).await?;
                    if matches!(
                        fetched.status,
                        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED
                    ) {
                        return Ok(Attempt::Miss);
                    }
                    Ok::<_, CourtwatchError>(Attempt::Found(fetched))
                }
            })
            .await?;
        if let Some(fetched) = &found {
            self.absorb(&fetched.cookies);
        }
        Ok(found)
    }

    async fn fetch_calendar(&mut self, venue: &Venue, date: NaiveDate) -> Result<CalendarReply> {
        let day = date.format("%Y-%m-%d").to_string();
        let url = Url::parse_with_params(
            &self.api_url(&self.config.calendar_endpoint),
            &[("venue_id", venue.id.as_str()), ("date", day.as_str())],
        )
        .map_err(|err| site_error(format!("invalid calendar url: {err}")))?;
        let fetched = execute(self.prepare(Method::GET, url, None)).await?;
        self.absorb(&fetched.cookies);

        if matches!(fetched.status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Ok(CalendarReply::SessionInvalid);
        }
        if classify_surface(&fetched.final_url, "") == Surface::Login {
            return Ok(CalendarReply::SessionInvalid);
        }
        if !fetched.status.is_success() {
            return Err(site_error(format!(
                "calendar for venue {} on {date} answered {}",
                venue.id, fetched.status
            )));
        }
        let document: Value = serde_json::from_str(&fetched.body)
            .map_err(|err| site_error(format!("unreadable calendar response: {err}")))?;
        parse_calendar(&document)
    }
}

#[async_trait]
impl SiteDriver for HttpSite {
    async fn install_session(&mut self, session: &Session) -> Result<()> {
        let now = Utc::now();
        self.cookies = session
            .cookies
            .iter()
            .filter(|cookie| !cookie.is_expired_at(now))
            .cloned()
            .collect();
        self.local_storage = session.local_storage.clone();
        self.session_storage = session.session_storage.clone();
        self.current_url = session.url.clone();
        self.sheets.clear();
        debug!(
            "Installed session with {} cookies and {} storage keys",
            self.cookies.len(),
            self.local_storage.len()
        );
        Ok(())
    }

    async fn capture_session(&self) -> Result<Session> {
        Ok(Session {
            cookies: self.cookies.clone(),
            local_storage: self.local_storage.clone(),
            session_storage: self.session_storage.clone(),
            url: self.current_url.clone(),
            captured_at: Utc::now(),
        })
    }

    async fn clear_session(&mut self) -> Result<()> {
        self.cookies.clear();
        self.local_storage.clear();
        self.session_storage.clear();
        self.phone = None;
        self.sheets.clear();
        Ok(())
    }

    async fn navigate(&mut self, url: &str) -> Result<Landing> {
        let fetched = self.get(url).await?;
        self.current_url = fetched.final_url.clone();
        let surface = if fetched.status == StatusCode::UNAUTHORIZED {
            Surface::Login
        } else {
            classify_surface(&fetched.final_url, &fetched.body)
        };
        Ok(Landing {
            url: fetched.final_url,
            surface,
        })
    }

    async fn protected_landing(&mut self) -> Result<Landing> {
        let url = self.site_url(&self.config.protected_path);
        self.navigate(&url).await
    }

    async fn reach_authenticated_resource(&mut self) -> Result<bool> {
        if self.token().is_none() {
            debug!("No {} in local storage", self.config.token_key);
            return Ok(false);
        }
        let url = self.api_url(&self.config.profile_endpoint);
        let fetched = self.get(&url).await?;
        if !fetched.status.is_success() {
            debug!("Profile endpoint answered {}", fetched.status);
            return Ok(false);
        }
        let Ok(document) = serde_json::from_str::<Value>(&fetched.body) else {
            return Ok(false);
        };
        Ok(reply_succeeded(&document))
    }

    async fn open_login(&mut self) -> Result<Surface> {
        let locator = Locator::new(Intent::OpenLogin, self.config.strategies.open_login.clone());
        let this = &*self;
        let found = locator
            .first_match(|path| {
                let request = parse_url(&this.site_url(&path))
                    .map(|url| this.prepare(Method::GET, url, None));
                async move {
                    let fetched = execute(request?).await?;
                    if !fetched.status.is_success() {
                        return Ok(Attempt::Miss);
                    }
                    Ok::<_, CourtwatchError>(Attempt::Found(fetched))
                }
            })
            .await?;
        let Some(fetched) = found else {
            return Ok(Surface::Unknown);
        };
        self.absorb(&fetched.cookies);
        self.current_url = fetched.final_url.clone();
        // The form itself is rendered client-side; the code endpoints are the login surface.
        Ok(match classify_surface(&fetched.final_url, &fetched.body) {
            Surface::Registration => Surface::Registration,
            _ => Surface::Login,
        })
    }

    async fn switch_to_login(&mut self) -> Result<Surface> {
        let locator = Locator::new(
            Intent::SwitchToLogin,
            self.config.strategies.switch_to_login.clone(),
        );
        let this = &*self;
        let found = locator
            .first_match(|path| {
                let request = parse_url(&this.site_url(&path))
                    .map(|url| this.prepare(Method::GET, url, None));
                async move {
                    let fetched = execute(request?).await?;
                    let surface = classify_surface(&fetched.final_url, &fetched.body);
                    if fetched.status.is_success() && surface != Surface::Registration {
                        return Ok(Attempt::Found(fetched));
                    }
                    Ok::<_, CourtwatchError>(Attempt::Miss)
                }
            })
            .await?;
        match found {
            Some(fetched) => {
                self.absorb(&fetched.cookies);
                self.current_url = fetched.final_url;
                Ok(Surface::Login)
            }
            None => Ok(Surface::Registration),
        }
    }

    async fn submit_phone(&mut self, phone: &str) -> Result<ControlOutcome> {
        let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 10 {
            return Ok(ControlOutcome::Rejected("phone number needs at least 10 digits".into()));
        }
        // The site expects the national number without the country prefix.
        let national = digits[digits.len() - 10..].to_string();
        self.phone = Some(national);
        Ok(ControlOutcome::Done)
    }

    async fn request_code(&mut self) -> Result<ControlOutcome> {
        let Some(phone) = self.phone.clone() else {
            return Ok(ControlOutcome::Rejected("no phone number submitted".into()));
        };
        let candidates = self.config.strategies.send_code.clone();
        let Some(fetched) = self
            .post_first(Intent::SendCode, &candidates, json!({ "mobile": phone }))
            .await?
        else {
            return Ok(ControlOutcome::Missing(Intent::SendCode));
        };
        if !fetched.status.is_success() {
            return Ok(ControlOutcome::Rejected(format!("send code answered {}", fetched.status)));
        }
        match serde_json::from_str::<Value>(&fetched.body) {
            Ok(document) if !reply_succeeded(&document) => {
                Ok(ControlOutcome::Rejected(reply_message(&document)))
            }
            _ => {
                info!("Code dispatch accepted by the site");
                Ok(ControlOutcome::Done)
            }
        }
    }

    async fn submit_code(&mut self, code: &str) -> Result<ControlOutcome> {
        let Some(phone) = self.phone.clone() else {
            return Ok(ControlOutcome::Rejected("no phone number submitted".into()));
        };
        let candidates = self.config.strategies.verify_code.clone();
        let Some(fetched) = self
            .post_first(
                Intent::Verify,
                &candidates,
                json!({ "mobile": phone, "otp": code }),
            )
            .await?
        else {
            return Ok(ControlOutcome::Missing(Intent::Verify));
        };
        let document: Value = match serde_json::from_str(&fetched.body) {
            Ok(document) => document,
            Err(_) => {
                return Ok(ControlOutcome::Rejected(format!(
                    "verify answered {} without JSON",
                    fetched.status
                )))
            }
        };
        if !fetched.status.is_success() || !reply_succeeded(&document) {
            return Ok(ControlOutcome::Rejected(reply_message(&document)));
        }
        match extract_token(&document) {
            Some(token) => {
                self.local_storage
                    .insert(self.config.token_key.clone(), token);
                Ok(ControlOutcome::Done)
            }
            None => Ok(ControlOutcome::Rejected("verify response carried no token".into())),
        }
    }

    async fn list_courts(&mut self, venue: &Venue, date: NaiveDate) -> Result<CourtListing> {
        match self.fetch_calendar(venue, date).await? {
            CalendarReply::SessionInvalid => {
                self.sheets.remove(&(venue.id.clone(), date));
                Ok(CourtListing::SessionInvalid)
            }
            CalendarReply::Courts(sheets) => {
                let courts = sheets.iter().map(|sheet| sheet.court.clone()).collect();
                self.sheets.insert((venue.id.clone(), date), sheets);
                Ok(CourtListing::Courts(courts))
            }
        }
    }

    async fn court_slots(
        &mut self,
        venue: &Venue,
        date: NaiveDate,
        court: &CourtRef,
    ) -> Result<CourtSlots> {
        let cache_key = (venue.id.clone(), date);
        if !self.sheets.contains_key(&cache_key) {
            match self.fetch_calendar(venue, date).await? {
                CalendarReply::Courts(sheets) => {
                    self.sheets.insert(cache_key.clone(), sheets);
                }
                CalendarReply::SessionInvalid => {
                    warn!("Session rejected while reading {} on {date}", court.name);
                    return Ok(CourtSlots::SessionInvalid);
                }
            }
        }
        let sheet = self
            .sheets
            .get(&cache_key)
            .and_then(|sheets| sheets.iter().find(|sheet| sheet.court.id == court.id))
            .ok_or_else(|| site_error(format!("{} not offered on {date}", court.name)))?;

        let mut slots = Vec::with_capacity(sheet.tokens.len());
        for token in &sheet.tokens {
            match parse_slot_token(token) {
                Ok(slot) => slots.push(slot),
                Err(err) => warn!("Skipping slot on {}: {err}", court.name),
            }
        }
        Ok(CourtSlots::Slots(slots))
    }
}

async fn execute(request: RequestBuilder) -> Result<Fetched> {
    let response = request
        .send()
        .await
        .map_err(|err| site_error(format!("request failed: {err}")))?;
    let status = response.status();
    let final_url = response.url().clone();
    let host = final_url.host_str().unwrap_or_default().to_string();
    let now = Utc::now();
    let cookies = response
        .cookies()
        .map(|cookie| captured_cookie(&cookie, &host, now))
        .collect();
    let body = response
        .text()
        .await
        .map_err(|err| site_error(format!("failed to read response body: {err}")))?;
    Ok(Fetched {
        status,
        final_url: final_url.to_string(),
        cookies,
        body,
    })
}

fn captured_cookie(
    cookie: &reqwest::cookie::Cookie<'_>,
    host: &str,
    now: DateTime<Utc>,
) -> SessionCookie {
    let expires = cookie
        .max_age()
        .and_then(|age| chrono::Duration::from_std(age).ok())
        .map(|age| now + age)
        .or_else(|| cookie.expires().map(DateTime::<Utc>::from));
    let same_site = if cookie.same_site_strict() {
        Some("Strict".to_string())
    } else if cookie.same_site_lax() {
        Some("Lax".to_string())
    } else {
        None
    };
    SessionCookie {
        name: cookie.name().to_string(),
        value: cookie.value().to_string(),
        domain: cookie.domain().unwrap_or(host).to_string(),
        path: cookie.path().unwrap_or("/").to_string(),
        expires,
        http_only: cookie.http_only(),
        secure: cookie.secure(),
        same_site,
    }
}

/// Builds the `Cookie` header for a request to `url`.
pub fn cookie_header(cookies: &[SessionCookie], url: &Url, now: DateTime<Utc>) -> Option<String> {
    let host = url.host_str()?;
    let path = url.path();
    let https = url.scheme() == "https";
    let pairs: Vec<String> = cookies
        .iter()
        .filter(|cookie| !cookie.is_expired_at(now))
        .filter(|cookie| cookie.matches_host(host))
        .filter(|cookie| path.starts_with(cookie.path.as_str()))
        .filter(|cookie| https || !cookie.secure)
        .map(|cookie| format!("{}={}", cookie.name, cookie.value))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Interprets a calendar document.
pub fn parse_calendar(document: &Value) -> Result<CalendarReply> {
    if !reply_succeeded(document) {
        let message = reply_message(document);
        let lowered = message.to_ascii_lowercase();
        if SESSION_HINTS.iter().any(|hint| lowered.contains(hint)) {
            return Ok(CalendarReply::SessionInvalid);
        }
        return Err(site_error(format!("calendar request refused: {message}")));
    }

    let Some(courts) = document.get("Result").and_then(Value::as_object) else {
        return Ok(CalendarReply::Courts(Vec::new()));
    };
    let mut sheets: Vec<CourtSheet> = courts
        .iter()
        .map(|(id, entry)| {
            let name = match entry.get("court_name") {
                Some(Value::String(name)) => name.clone(),
                Some(Value::Number(number)) => number.to_string(),
                _ => String::new(),
            };
            let tokens = entry
                .get("court_available_slots")
                .and_then(Value::as_array)
                .map(|slots| {
                    slots
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            CourtSheet {
                court: CourtRef {
                    id: id.clone(),
                    name: court_label(id, &name),
                },
                tokens,
            }
        })
        .collect();
    sheets.sort_by(|a, b| {
        let a_key = (a.court.id.parse::<u32>().ok(), &a.court.id);
        let b_key = (b.court.id.parse::<u32>().ok(), &b.court.id);
        a_key.cmp(&b_key)
    });
    Ok(CalendarReply::Courts(sheets))
}

fn reply_succeeded(document: &Value) -> bool {
    document
        .get("Status")
        .and_then(Value::as_str)
        .map(|status| status.eq_ignore_ascii_case("success"))
        .unwrap_or(false)
}

fn reply_message(document: &Value) -> String {
    document
        .get("Message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "no message".into())
}

fn extract_token(document: &Value) -> Option<String> {
    [
        document.pointer("/Result/loginToken"),
        document.pointer("/Result/token"),
        document.get("loginToken"),
    ]
    .into_iter()
    .flatten()
    .filter_map(Value::as_str)
    .find(|token| !token.is_empty())
    .map(str::to_string)
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|err| site_error(format!("invalid url '{raw}': {err}")))
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn calendar_document_is_parsed() {
        let document = json!({
            "Status": "Success",
            "Message": "ok",
            "Result": {
                "10": { "court_name": "10", "court_available_slots": ["06:00-07:00|1|405"] },
                "2": {
                    "court_name": 2,
                    "court_available_slots": ["12:00-13:00|1|405", "13:00-14:00|0|405"]
                },
                "3": { "court_name": "Synthetic", "court_available_slots": [] }
            }
        });
        let CalendarReply::Courts(sheets) = parse_calendar(&document).expect("parse") else {
            panic!("expected courts");
        };
        let names: Vec<&str> = sheets.iter().map(|s| s.court.name.as_str()).collect();
        assert_eq!(names, vec!["Court 2", "Synthetic", "Court 10"]);
        assert_eq!(sheets[0].tokens.len(), 2);
    }

    #[test]
    fn empty_result_means_no_courts() {
        let document = json!({ "Status": "Success", "Message": "", "Result": [] });
        assert_eq!(
            parse_calendar(&document).expect("parse"),
            CalendarReply::Courts(Vec::new())
        );
        let missing = json!({ "Status": "Success" });
        assert_eq!(
            parse_calendar(&missing).expect("parse"),
            CalendarReply::Courts(Vec::new())
        );
    }

    #[test]
    fn refused_calendar_distinguishes_session_loss() {
        let expired = json!({ "Status": "Failed", "Message": "Invalid LoginToken" });
        assert_eq!(
            parse_calendar(&expired).expect("parse"),
            CalendarReply::SessionInvalid
        );
        let closed = json!({ "Status": "Failed", "Message": "Venue closed" });
        assert!(parse_calendar(&closed).is_err());
    }

    #[test]
    fn verify_token_locations() {
        assert_eq!(
            extract_token(&json!({ "Result": { "loginToken": "abc" } })).as_deref(),
            Some("abc")
        );
        assert_eq!(
            extract_token(&json!({ "Result": { "token": "" }, "loginToken": "top" })).as_deref(),
            Some("top")
        );
        assert_eq!(extract_token(&json!({ "Result": {} })), None);
    }

    #[test]
    fn cookie_header_respects_scope() {
        let now = Utc::now();
        let mut secure = SessionCookie::new("sid", "abc", ".gopichandacademy.com");
        secure.secure = true;
        let mut scoped = SessionCookie::new("pref", "x", "booking.gopichandacademy.com");
        scoped.path = "/venuePage".into();
        let mut stale = SessionCookie::new("old", "y", "booking.gopichandacademy.com");
        stale.expires = Some(now - ChronoDuration::minutes(1));
        let cookies = vec![secure, scoped, stale];

        let page = Url::parse("https://booking.gopichandacademy.com/venuePage/1").expect("url");
        assert_eq!(
            cookie_header(&cookies, &page, now).as_deref(),
            Some("sid=abc; pref=x")
        );
        let plain = Url::parse("http://booking.gopichandacademy.com/").expect("url");
        assert_eq!(cookie_header(&cookies, &plain, now), None);
    }

    #[test]
    fn urls_are_joined() {
        assert_eq!(
            join_url("https://api.test/API/", "/Get/Calender"),
            "https://api.test/API/Get/Calender"
        );
        assert_eq!(join_url("https://a.test", "https://b.test/x"), "https://b.test/x");
    }

    #[tokio::test]
    async fn phone_is_normalised() {
        let mut site = HttpSite::new(SiteConfig::default()).expect("client");
        assert_eq!(
            site.submit_phone("+91 98765 43210").await.expect("submit"),
            ControlOutcome::Done
        );
        assert_eq!(site.phone.as_deref(), Some("9876543210"));
        assert!(matches!(
            site.submit_phone("123").await.expect("submit"),
            ControlOutcome::Rejected(_)
        ));
    }
}
