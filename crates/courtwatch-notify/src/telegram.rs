use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courtwatch_types::Result;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{notify_error, ChatChannel, InboundMessage, UpdateBatch};

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Deserialize)]
struct Reply<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Bot API client bound to a single chat.
#[derive(Clone)]
pub struct TelegramChannel {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(bot_token: &str, chat_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| notify_error(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            endpoint: format!("{API_BASE}/bot{bot_token}"),
            chat_id: chat_id.to_string(),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }
}

#[async_trait]
impl ChatChannel for TelegramChannel {
    async fn send(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/sendMessage", self.endpoint))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .map_err(|err| notify_error(format!("sendMessage failed: {err}")))?;
        let status = response.status();
        let reply: Reply<serde_json::Value> = response
            .json()
            .await
            .map_err(|err| notify_error(format!("sendMessage answered {status}: {err}")))?;
        if !reply.ok {
            return Err(notify_error(format!(
                "sendMessage rejected: {}",
                reply.description.unwrap_or_else(|| status.to_string())
            )));
        }
        debug!("Message delivered to chat {}", self.chat_id);
        Ok(())
    }

    async fn updates(&self, offset: Option<i64>) -> Result<UpdateBatch> {
        let mut request = self
            .client
            .get(format!("{}/getUpdates", self.endpoint))
            .query(&[("timeout", "0")]);
        if let Some(offset) = offset {
            request = request.query(&[("offset", offset.to_string())]);
        }
        let body = request
            .send()
            .await
            .map_err(|err| notify_error(format!("getUpdates failed: {err}")))?
            .text()
            .await
            .map_err(|err| notify_error(format!("getUpdates body unreadable: {err}")))?;
        parse_updates(&body)
    }
}

/// Converts a `getUpdates` body into text messages plus the highest update id
/// on the page.
pub fn parse_updates(body: &str) -> Result<UpdateBatch> {
    let reply: Reply<Vec<Update>> = serde_json::from_str(body)
        .map_err(|err| notify_error(format!("unreadable getUpdates reply: {err}")))?;
    if !reply.ok {
        return Err(notify_error(format!(
            "getUpdates rejected: {}",
            reply.description.unwrap_or_default()
        )));
    }
    let updates = reply.result.unwrap_or_default();
    let last_update_id = updates.iter().map(|update| update.update_id).max();
    let messages = updates
        .into_iter()
        .filter_map(|update| {
            let message = update.message?;
            let text = message.text?;
            Some(InboundMessage {
                update_id: update.update_id,
                chat_id: message.chat.id.to_string(),
                text,
                sent_at: DateTime::<Utc>::from_timestamp(message.date, 0)
                    .unwrap_or_else(Utc::now),
            })
        })
        .collect();
    Ok(UpdateBatch {
        messages,
        last_update_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_keep_text_messages_only() {
        let body = r#"{
            "ok": true,
            "result": [
                {"update_id": 10, "message": {
                    "chat": {"id": 42}, "date": 1758268800, "text": " 123456 "
                }},
                {"update_id": 11, "message": {
                    "chat": {"id": 42}, "date": 1758268801, "sticker": {}
                }},
                {"update_id": 12, "edited_message": {}}
            ]
        }"#;
        let batch = parse_updates(body).expect("parse");
        assert_eq!(batch.last_update_id, Some(12));
        let messages = batch.messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].update_id, 10);
        assert_eq!(messages[0].chat_id, "42");
        assert_eq!(messages[0].text, " 123456 ");
        assert_eq!(messages[0].sent_at.timestamp(), 1_758_268_800);
    }

    #[test]
    fn pages_without_text_still_advance() {
        let body = r#"{
            "ok": true,
            "result": [
                {"update_id": 30, "message": {
                    "chat": {"id": 42}, "date": 1758268800, "sticker": {}
                }},
                {"update_id": 31, "my_chat_member": {}}
            ]
        }"#;
        let batch = parse_updates(body).expect("parse");
        assert!(batch.messages.is_empty());
        assert_eq!(batch.last_update_id, Some(31));
        let empty = parse_updates(r#"{"ok": true, "result": []}"#).expect("parse");
        assert_eq!(empty, UpdateBatch::default());
    }

    #[test]
    fn rejected_reply_is_an_error() {
        assert!(parse_updates(r#"{"ok": false, "description": "Unauthorized"}"#).is_err());
    }
}
