use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Utc};
use courtwatch_ops::write_atomic;
use courtwatch_site::SiteDriver;
use courtwatch_types::{
    session::{Session, SessionCookie},
    CourtwatchError, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const COOKIES_FILE: &str = "cookies.json";
const SESSION_FILE: &str = "session.json";

/// On-disk shape of everything in a session except its cookies.
#[derive(Debug, Serialize, Deserialize)]
struct SessionBlob {
    url: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    local_storage: BTreeMap<String, String>,
    #[serde(default)]
    session_storage: BTreeMap<String, String>,
}

/// Persists the live session as `cookies.json` + `session.json`.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    max_age: Duration,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>, max_age: Duration) -> Self {
        Self {
            dir: dir.into(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn cookies_path(&self) -> PathBuf {
        self.dir.join(COOKIES_FILE)
    }

    fn session_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    /// Persists `session`. Failures are logged and otherwise ignored: a fresh
    /// login can always replace a session that did not make it to disk.
    pub fn save(&self, session: &Session) {
        match self.try_save(session) {
            Ok(()) => debug!("Session saved to {:?}", self.dir),
            Err(err) => warn!("Failed to persist session: {err}"),
        }
    }

    pub fn try_save(&self, session: &Session) -> Result<()> {
        let cookies = serde_json::to_vec_pretty(&session.cookies)
            .map_err(|err| CourtwatchError::Storage(format!("failed to encode cookies: {err}")))?;
        let blob = SessionBlob {
            url: session.url.clone(),
            timestamp: session.captured_at,
            local_storage: session.local_storage.clone(),
            session_storage: session.session_storage.clone(),
        };
        let blob = serde_json::to_vec_pretty(&blob)
            .map_err(|err| CourtwatchError::Storage(format!("failed to encode session: {err}")))?;
        write_atomic(&self.cookies_path(), &cookies)?;
        write_atomic(&self.session_path(), &blob)
    }

    pub fn load(&self) -> Option<Session> {
        self.load_at(Utc::now())
    }

    /// Returns the saved session if it exists and is fresh at `now`.
    pub fn load_at(&self, now: DateTime<Utc>) -> Option<Session> {
        let session = match self.read() {
            Ok(Some(session)) => session,
            Ok(None) => {
                debug!("No saved session in {:?}", self.dir);
                return None;
            }
            Err(err) => {
                warn!("Ignoring unreadable saved session: {err}");
                return None;
            }
        };
        if !session.is_fresh_at(now, self.max_age) {
            info!(
                "Saved session is {} minutes old, limit is {}",
                session.age_at(now).num_minutes(),
                self.max_age.num_minutes()
            );
            return None;
        }
        Some(session)
    }

    fn read(&self) -> Result<Option<Session>> {
        let Some(raw_session) = read_optional(&self.session_path())? else {
            return Ok(None);
        };
        let Some(raw_cookies) = read_optional(&self.cookies_path())? else {
            return Ok(None);
        };
        let blob: SessionBlob = serde_json::from_str(&raw_session)
            .map_err(|err| CourtwatchError::Storage(format!("corrupt session file: {err}")))?;
        let cookies: Vec<SessionCookie> = serde_json::from_str(&raw_cookies)
            .map_err(|err| CourtwatchError::Storage(format!("corrupt cookie file: {err}")))?;
        Ok(Some(Session {
            cookies,
            local_storage: blob.local_storage,
            session_storage: blob.session_storage,
            url: blob.url,
            captured_at: blob.timestamp,
        }))
    }

    /// Forgets the saved session.
    pub fn clear(&self) {
        for path in [self.cookies_path(), self.session_path()] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove {:?}: {err}", path);
                }
            }
        }
    }

    /// Installs `session` into a live driver before any navigation.
    pub async fn apply<S>(&self, session: &Session, driver: &mut S) -> Result<()>
    where
        S: SiteDriver + ?Sized,
    {
        driver.install_session(session).await
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(CourtwatchError::Storage(format!(
            "failed to read {}: {err}",
            path.display()
        ))),
    }
}
