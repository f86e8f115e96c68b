use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Referral {
    pub id: i64,
    pub referrer_id: i64,
    pub referred_id: i64,
    pub bonus_granted: bool,
    pub bonus_days: i64,
    pub granted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
