use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode};
use tracing::{info, warn};

use crate::models::callback::Callback;

/// A chat message produced by the core. Text is Telegram HTML.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outbound {
    pub text: String,
    /// Access link appended as a copyable code block.
    pub link: Option<String>,
    /// One button per row.
    pub buttons: Vec<(String, Callback)>,
}

impl Outbound {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_button(mut self, label: impl Into<String>, cb: Callback) -> Self {
        self.buttons.push((label.into(), cb));
        self
    }

    pub fn render_text(&self) -> String {
        match &self.link {
            Some(link) => format!("{}\n\n<code>{}</code>", self.text, escape_html(link)),
            None => self.text.clone(),
        }
    }

    pub fn keyboard(&self) -> Option<InlineKeyboardMarkup> {
        if self.buttons.is_empty() {
            return None;
        }
        let rows = self
            .buttons
            .iter()
            .map(|(label, cb)| vec![InlineKeyboardButton::callback(label.clone(), cb.to_string())])
            .collect::<Vec<_>>();
        Some(InlineKeyboardMarkup::new(rows))
    }
}

pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Where outbound messages go.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, chat_id: i64, message: &Outbound) -> Result<()>;
}

pub struct TelegramSink {
    bot: Bot,
}

impl TelegramSink {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessageSink for TelegramSink {
    async fn deliver(&self, chat_id: i64, message: &Outbound) -> Result<()> {
        let req = self
            .bot
            .send_message(ChatId(chat_id), message.render_text())
            .parse_mode(ParseMode::Html);
        match message.keyboard() {
            Some(kb) => req.reply_markup(kb).await?,
            None => req.await?,
        };
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

/// Best-effort delivery: failures are logged and counted, never propagated.
#[derive(Clone)]
pub struct NotificationService {
    sink: Arc<dyn MessageSink>,
    admin_ids: Arc<Vec<i64>>,
    pace: Duration,
}

impl NotificationService {
    pub fn new(sink: Arc<dyn MessageSink>, admin_ids: Vec<i64>) -> Self {
        Self {
            sink,
            admin_ids: Arc::new(admin_ids),
            pace: Duration::from_millis(50),
        }
    }

    /// Delay between messages of a mass send.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    pub fn admin_ids(&self) -> &[i64] {
        &self.admin_ids
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }

    pub async fn notify_user(&self, user_id: i64, message: Outbound) -> bool {
        match self.sink.deliver(user_id, &message).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to notify user {}: {}", user_id, e);
                false
            }
        }
    }

    pub async fn notify_admins(&self, message: Outbound) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for &admin in self.admin_ids.iter() {
            match self.sink.deliver(admin, &message).await {
                Ok(()) => report.sent += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to notify admin {}: {}", admin, e);
                }
            }
        }
        report
    }

    pub async fn broadcast(&self, recipients: &[i64], message: Outbound) -> DeliveryReport {
        info!("Broadcasting to {} users", recipients.len());
        let mut report = DeliveryReport::default();
        for &user in recipients {
            if self.notify_user(user, message.clone()).await {
                report.sent += 1;
            } else {
                report.failed += 1;
            }
            if !self.pace.is_zero() {
                tokio::time::sleep(self.pace).await;
            }
        }
        info!(
            "Broadcast complete: {}/{} sent, {} failed",
            report.sent,
            recipients.len(),
            report.failed
        );
        report
    }
}
