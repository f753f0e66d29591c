use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use courtwatch_notify::{format::format_code_prompt, reply_stream, ChatChannel};
use courtwatch_types::Result;
use futures::StreamExt;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing::{debug, info, warn};

use crate::auth_error;

/// A login code as typed by the operator: 4 to 6 ASCII digits.
#[derive(Clone, PartialEq, Eq)]
pub struct OneTimeCode(String);

impl OneTimeCode {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let well_formed = (4..=6).contains(&trimmed.len())
            && trimmed.chars().all(|c| c.is_ascii_digit());
        well_formed.then(|| Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OneTimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OneTimeCode(****)")
    }
}

/// Out-of-band supplier of login codes.
#[async_trait]
pub trait CodeSource: Send {
    /// Tells the operator that a code is on its way.
    async fn prompt(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    /// Waits for the next well-formed code, skipping anything else.
    /// `None` means the source has nothing more to offer.
    async fn next_code(&mut self) -> Result<Option<OneTimeCode>>;
}

#[async_trait]
impl<K: CodeSource + ?Sized> CodeSource for Box<K> {
    async fn prompt(&mut self, timeout: Duration) -> Result<()> {
        (**self).prompt(timeout).await
    }

    async fn next_code(&mut self) -> Result<Option<OneTimeCode>> {
        (**self).next_code().await
    }
}

/// Reads codes typed on the terminal.
pub struct StdinCodeSource {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for StdinCodeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinCodeSource {
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl CodeSource for StdinCodeSource {
    async fn prompt(&mut self, timeout: Duration) -> Result<()> {
        let mut stdout = io::stdout();
        let text = format!(
            "Enter the login code sent to your phone ({}s): ",
            timeout.as_secs()
        );
        stdout
            .write_all(text.as_bytes())
            .await
            .map_err(|err| auth_error(format!("failed to write prompt: {err}")))?;
        stdout
            .flush()
            .await
            .map_err(|err| auth_error(format!("failed to write prompt: {err}")))
    }

    async fn next_code(&mut self) -> Result<Option<OneTimeCode>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|err| auth_error(format!("failed to read stdin: {err}")))?;
            let Some(line) = line else {
                return Ok(None);
            };
            match OneTimeCode::parse(&line) {
                Some(code) => return Ok(Some(code)),
                None => warn!("Ignoring input that is not a 4-6 digit code"),
            }
        }
    }
}

/// Collects the code from replies on the notification chat.
pub struct ChatCodeSource<C: ChatChannel> {
    channel: C,
    chat_id: String,
    poll_every: Duration,
    since: DateTime<Utc>,
}

impl<C: ChatChannel> ChatCodeSource<C> {
    pub fn new(channel: C, chat_id: impl Into<String>, poll_every: Duration) -> Self {
        Self {
            channel,
            chat_id: chat_id.into(),
            poll_every,
            since: Utc::now().trunc_subsecs(0),
        }
    }
}

#[async_trait]
impl<C: ChatChannel> CodeSource for ChatCodeSource<C> {
    async fn prompt(&mut self, timeout: Duration) -> Result<()> {
        // Replies that predate the prompt belong to an earlier login.
        self.since = Utc::now().trunc_subsecs(0);
        self.channel.send(&format_code_prompt(timeout.as_secs())).await
    }

    async fn next_code(&mut self) -> Result<Option<OneTimeCode>> {
        let mut replies = reply_stream(
            &self.channel,
            self.chat_id.clone(),
            self.poll_every,
            self.since,
        );
        while let Some(text) = replies.next().await {
            match OneTimeCode::parse(&text) {
                Some(code) => {
                    info!("Login code received on chat {}", self.chat_id);
                    self.since = Utc::now();
                    return Ok(Some(code));
                }
                None => debug!("Ignoring chat reply that is not a code"),
            }
        }
        Ok(None)
    }
}

/// A code supplied up front, handed out once.
#[derive(Debug, Default)]
pub struct StaticCodeSource {
    code: Option<OneTimeCode>,
}

impl StaticCodeSource {
    pub fn new(raw: &str) -> Result<Self> {
        let code = OneTimeCode::parse(raw)
            .ok_or_else(|| auth_error("static login code must be 4-6 digits"))?;
        Ok(Self { code: Some(code) })
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeSource for StaticCodeSource {
    async fn next_code(&mut self) -> Result<Option<OneTimeCode>> {
        Ok(self.code.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtwatch_notify::MemoryChannel;

    #[test]
    fn only_short_digit_strings_are_codes() {
        assert_eq!(OneTimeCode::parse(" 123456\n").map(|c| c.0), Some("123456".into()));
        assert!(OneTimeCode::parse("1234").is_some());
        assert!(OneTimeCode::parse("123").is_none());
        assert!(OneTimeCode::parse("1234567").is_none());
        assert!(OneTimeCode::parse("12a456").is_none());
        assert!(OneTimeCode::parse("١٢٣٤").is_none());
        assert!(OneTimeCode::parse("").is_none());
    }

    #[test]
    fn codes_are_not_logged() {
        let code = OneTimeCode::parse("123456").expect("code");
        assert!(!format!("{code:?}").contains("123456"));
    }

    #[tokio::test]
    async fn static_source_hands_out_once() {
        let mut source = StaticCodeSource::new("4321").expect("valid");
        assert_eq!(source.next_code().await.expect("next").map(|c| c.0), Some("4321".into()));
        assert!(source.next_code().await.expect("next").is_none());
        assert!(StaticCodeSource::new("abc").is_err());
    }

    #[tokio::test]
    async fn chat_source_skips_noise_and_other_chats() {
        let channel = MemoryChannel::new();
        let mut source = ChatCodeSource::new(channel.clone(), "42", Duration::from_millis(5));
        source.prompt(Duration::from_secs(300)).await.expect("prompt");
        assert_eq!(channel.sent().await.len(), 1);

        channel.push_reply("42", "what code?").await;
        channel.push_reply("7", "111111").await;
        channel.push_reply("42", "654321").await;
        let code = tokio::time::timeout(Duration::from_secs(1), source.next_code())
            .await
            .expect("code in time")
            .expect("next");
        assert_eq!(code.map(|c| c.0), Some("654321".into()));
    }
}
