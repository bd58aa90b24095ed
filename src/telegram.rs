//! Telegram delivery of wallet activity.

use async_trait::async_trait;
use teloxide::RequestError;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use tracing::{info, warn};

use crate::watcher::{NotificationEvent, Notifier, NotifyError};

pub struct TelegramNotifier {
    bot: Bot,
    chat_id: ChatId,
    explorer_tx_url: String,
    dry_run: bool,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, chat_id: ChatId, explorer_tx_url: impl Into<String>, dry_run: bool) -> Self {
        Self {
            bot,
            chat_id,
            explorer_tx_url: explorer_tx_url.into(),
            dry_run,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let text = format_activity(event, &self.explorer_tx_url);
        if self.dry_run {
            info!(id = %event.record.id, "[dry run] would notify: {}", text);
            return Ok(());
        }

        self.bot
            .send_message(self.chat_id, text)
            .parse_mode(ParseMode::Html)
            .await
            .map(|_| ())
            .map_err(to_notify_error)
    }

    async fn alert(&self, text: &str) -> Result<(), NotifyError> {
        if self.dry_run {
            info!("[dry run] would alert: {}", text);
            return Ok(());
        }
        self.bot
            .send_message(self.chat_id, text)
            .await
            .map(|_| ())
            .map_err(to_notify_error)
    }
}

fn to_notify_error(e: RequestError) -> NotifyError {
    match e {
        RequestError::RetryAfter(after) => {
            warn!("Telegram rate limit hit, retry after {}s", after.seconds());
            NotifyError::RateLimited(after.seconds() as u64)
        }
        other => NotifyError::Failed(other.to_string()),
    }
}

/// Render one activity as a Telegram HTML message.
pub fn format_activity(event: &NotificationEvent, explorer_tx_url: &str) -> String {
    let addresses = event
        .addresses
        .iter()
        .map(|a| format!("<code>{}</code>", escape_html(a)))
        .collect::<Vec<_>>()
        .join(", ");
    let id = &event.record.id;
    let link = format!("{}{}", explorer_tx_url, id);

    format!(
        "🔔 New activity on {}\n<a href=\"{}\">{}</a>\n{}",
        addresses,
        escape_html(&link),
        escape_html(&short_id(id)),
        event.record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// First and last 8 characters of a long signature.
fn short_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() <= 20 {
        return id.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{head}…{tail}")
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
