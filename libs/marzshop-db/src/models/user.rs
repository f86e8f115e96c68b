use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A chat user. `id` is the Telegram user id.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub full_name: Option<String>,
    /// Account name on the VPN panel, generated once at registration.
    pub panel_username: String,
    pub is_banned: bool,
    pub referred_by: Option<i64>,
    pub trial_used: bool,
    /// Referral bonus days waiting for the next provisioning.
    pub bonus_days_banked: i64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        match (&self.username, &self.full_name) {
            (Some(u), _) => format!("@{}", u),
            (None, Some(n)) if !n.trim().is_empty() => n.clone(),
            _ => self.id.to_string(),
        }
    }
}
