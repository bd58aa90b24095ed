//! Forwards WARN and ERROR events to an operator chat.
//!
//! A reconnect storm logs the same warning many times, so lines are batched
//! for a few seconds and consecutive repeats are collapsed into one.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatId;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BUFFERED: usize = 50;
const MAX_MESSAGE_CHARS: usize = 4000;

pub struct TelegramLogLayer {
    tx: mpsc::UnboundedSender<String>,
}

impl TelegramLogLayer {
    /// Must be called inside a tokio runtime.
    pub fn new(bot: Bot, chat_id: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut buffer: Vec<String> = Vec::new();
            let mut interval = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    line = rx.recv() => match line {
                        Some(line) => {
                            buffer.push(line);
                            if buffer.len() >= MAX_BUFFERED {
                                flush(&bot, chat_id, &mut buffer).await;
                            }
                        }
                        None => {
                            flush(&bot, chat_id, &mut buffer).await;
                            break;
                        }
                    },
                    _ = interval.tick() => flush(&bot, chat_id, &mut buffer).await,
                }
            }
        });

        Self { tx }
    }
}

async fn flush(bot: &Bot, chat_id: ChatId, buffer: &mut Vec<String>) {
    if buffer.is_empty() {
        return;
    }
    let text = truncate(&collapse(buffer).join("\n"));
    buffer.clear();
    // Logging from here would feed back into this layer
    if let Err(e) = bot.send_message(chat_id, text).await {
        eprintln!("Failed to send log to Telegram: {e}");
    }
}

/// Merge runs of identical lines into `line (×n)`.
fn collapse(lines: &[String]) -> Vec<String> {
    let mut out: Vec<(String, usize)> = Vec::new();
    for line in lines {
        match out.last_mut() {
            Some((last, count)) if last == line => *count += 1,
            _ => out.push((line.clone(), 1)),
        }
    }
    out.into_iter()
        .map(|(line, count)| if count > 1 { format!("{line} (×{count})") } else { line })
        .collect()
}

fn truncate(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_MESSAGE_CHARS).collect();
    format!("{head}...")
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

impl MessageVisitor {
    fn render(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl<S: Subscriber> Layer<S> for TelegramLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let prefix = if level == Level::ERROR { "❌" } else { "⚠️" };

        if self.tx.send(format!("{prefix} {}", visitor.render())).is_err() {
            eprintln!("Log channel closed, message dropped");
        }
    }
}
