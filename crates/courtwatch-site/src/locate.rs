//! Prioritised strategies for finding a control by what it is for.

use std::{fmt, future::Future};

use courtwatch_types::Result;
use tracing::{debug, info};

/// What the caller wants to interact with, independent of how it is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intent {
    OpenLogin,
    SwitchToLogin,
    PhoneField,
    SendCode,
    CodeField,
    Verify,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Intent::OpenLogin => "open-login",
            Intent::SwitchToLogin => "switch-to-login",
            Intent::PhoneField => "phone-field",
            Intent::SendCode => "send-code",
            Intent::CodeField => "code-field",
            Intent::Verify => "verify",
        };
        f.write_str(label)
    }
}

/// Outcome of trying one strategy.
#[derive(Debug)]
pub enum Attempt<T> {
    Found(T),
    Miss,
}

/// Ordered list of strategies for one intent.
#[derive(Debug, Clone)]
pub struct Locator {
    intent: Intent,
    strategies: Vec<String>,
}

impl Locator {
    pub fn new<I, S>(intent: Intent, strategies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            intent,
            strategies: strategies.into_iter().map(Into::into).collect(),
        }
    }

    /// Tries each strategy in order and returns the first hit.
    ///
    /// A strategy that errors counts as a miss; `Ok(None)` means every
    /// strategy was exhausted.
    pub async fn first_match<T, F, Fut>(&self, mut attempt: F) -> Result<Option<T>>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        for (rank, strategy) in self.strategies.iter().enumerate() {
            match attempt(strategy.clone()).await {
                Ok(Attempt::Found(value)) => {
                    info!("Located {} via strategy #{} ({})", self.intent, rank + 1, strategy);
                    return Ok(Some(value));
                }
                Ok(Attempt::Miss) => {
                    debug!("Strategy {} missed for {}", strategy, self.intent);
                }
                Err(err) => {
                    debug!("Strategy {} failed for {}: {err}", strategy, self.intent);
                }
            }
        }
        debug!(
            "Exhausted {} strategies for {}",
            self.strategies.len(),
            self.intent
        );
        Ok(None)
    }
}
