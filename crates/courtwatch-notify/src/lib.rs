//! Messaging channel, notification ledger and digest dispatch.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courtwatch_types::{CourtwatchError, Result};
use futures::{stream::BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::warn;

pub mod format;
pub mod ledger;
pub mod notifier;
pub mod telegram;

pub use ledger::NotificationLedger;
pub use notifier::Notifier;
pub use telegram::TelegramChannel;

/// A message received on the chat, used to collect one-time codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub chat_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// One page of chat updates.
///
/// `last_update_id` covers every update on the page, including ones that
/// carried no text, so the next poll can acknowledge all of them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateBatch {
    pub messages: Vec<InboundMessage>,
    pub last_update_id: Option<i64>,
}

#[async_trait]
pub trait ChatChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
    /// Updates from `offset` (an update id) on; `None` returns everything
    /// still pending.
    async fn updates(&self, offset: Option<i64>) -> Result<UpdateBatch>;
}

#[async_trait]
impl<C: ChatChannel + ?Sized> ChatChannel for Arc<C> {
    async fn send(&self, text: &str) -> Result<()> {
        (**self).send(text).await
    }

    async fn updates(&self, offset: Option<i64>) -> Result<UpdateBatch> {
        (**self).updates(offset).await
    }
}

/// Texts sent to `chat_id` after `since`, polled every `poll_every`.
///
/// The stream never ends on its own; callers bound it with a timeout.
pub fn reply_stream<'a, C>(
    channel: &'a C,
    chat_id: String,
    poll_every: Duration,
    since: DateTime<Utc>,
) -> BoxStream<'a, String>
where
    C: ChatChannel + ?Sized,
{
    let replies = async_stream::stream! {
        let mut offset: Option<i64> = None;
        loop {
            match channel.updates(offset).await {
                Ok(batch) => {
                    if let Some(last) = batch.last_update_id {
                        offset = Some(last + 1);
                    }
                    for message in batch.messages {
                        if message.chat_id == chat_id && message.sent_at >= since {
                            yield message.text;
                        }
                    }
                }
                Err(err) => warn!("Polling chat replies failed: {err}"),
            }
            tokio::time::sleep(poll_every).await;
        }
    };
    replies.boxed()
}

pub fn notify_error(message: impl Into<String>) -> CourtwatchError {
    CourtwatchError::Notify(message.into())
}

const MEMORY_PAGE: usize = 100;

#[derive(Default)]
struct MemoryState {
    sent: Vec<String>,
    failures_left: usize,
    /// Update ids in arrival order; `None` marks an update without text.
    inbound: Vec<(i64, Option<InboundMessage>)>,
    next_update: i64,
}

/// In-process channel that records what was sent.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` sends fail.
    pub async fn fail_next(&self, count: usize) {
        self.state.lock().await.failures_left = count;
    }

    /// Queues a reply as if the operator typed it on `chat_id`.
    pub async fn push_reply(&self, chat_id: &str, text: &str) {
        let mut state = self.state.lock().await;
        state.next_update += 1;
        let update_id = state.next_update;
        state.inbound.push((
            update_id,
            Some(InboundMessage {
                update_id,
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                sent_at: Utc::now(),
            }),
        ));
    }

    /// Queues `count` updates that carry no text, like stickers or joins.
    pub async fn push_non_text(&self, count: usize) {
        let mut state = self.state.lock().await;
        for _ in 0..count {
            state.next_update += 1;
            let update_id = state.next_update;
            state.inbound.push((update_id, None));
        }
    }

    pub async fn sent(&self) -> Vec<String> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl ChatChannel for MemoryChannel {
    async fn send(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(notify_error("memory channel refused the message"));
        }
        state.sent.push(text.to_string());
        Ok(())
    }

    async fn updates(&self, offset: Option<i64>) -> Result<UpdateBatch> {
        let floor = offset.unwrap_or(0);
        let state = self.state.lock().await;
        let page: Vec<_> = state
            .inbound
            .iter()
            .filter(|(update_id, _)| *update_id >= floor)
            .take(MEMORY_PAGE)
            .collect();
        Ok(UpdateBatch {
            last_update_id: page.last().map(|(update_id, _)| *update_id),
            messages: page
                .into_iter()
                .filter_map(|(_, message)| message.clone())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_are_filtered_by_chat() {
        let channel = MemoryChannel::new();
        let since = Utc::now() - chrono::Duration::seconds(1);
        channel.push_reply("99", "not for us").await;
        channel.push_reply("42", "123456").await;

        let mut replies = reply_stream(&channel, "42".into(), Duration::from_millis(5), since);
        let first = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .expect("reply in time");
        assert_eq!(first.as_deref(), Some("123456"));
    }

    #[tokio::test]
    async fn replies_arrive_after_a_full_page_without_text() {
        let channel = MemoryChannel::new();
        let since = Utc::now() - chrono::Duration::seconds(1);
        channel.push_non_text(MEMORY_PAGE).await;
        channel.push_reply("42", "246810").await;

        let mut replies = reply_stream(&channel, "42".into(), Duration::from_millis(5), since);
        let first = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .expect("reply in time");
        assert_eq!(first.as_deref(), Some("246810"));
    }

    #[tokio::test]
    async fn failures_are_counted_down() {
        let channel = MemoryChannel::new();
        channel.fail_next(1).await;
        assert!(channel.send("one").await.is_err());
        assert!(channel.send("two").await.is_ok());
        assert_eq!(channel.sent().await, vec!["two"]);
    }
}
