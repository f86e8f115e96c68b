use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub tariff_id: String,
    pub status: SubscriptionStatus,
    pub is_trial: bool,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 0 means unlimited.
    pub traffic_limit_bytes: i64,
    pub traffic_used_bytes: i64,
    pub traffic_synced_at: Option<DateTime<Utc>>,
    pub panel_username: String,
    pub subscription_url: Option<String>,
    /// Smallest reminder threshold (hours) already sent for the current term.
    pub last_reminder_hours: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active && self.expires_at > now
    }

    pub fn is_unlimited(&self) -> bool {
        self.traffic_limit_bytes == 0
    }

    pub fn remaining_bytes(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some((self.traffic_limit_bytes - self.traffic_used_bytes).max(0))
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub tariff_id: String,
    pub is_trial: bool,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub traffic_limit_bytes: i64,
    pub panel_username: String,
    pub subscription_url: Option<String>,
}
