use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::referral::Referral;

#[derive(Debug, Clone)]
pub struct ReferralRepository {
    pool: SqlitePool,
}

impl ReferralRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// `false` if the referred user already has a referrer.
    pub async fn register(&self, referrer_id: i64, referred_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO referrals (referrer_id, referred_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (referred_id) DO NOTHING
            "#,
        )
        .bind(referrer_id)
        .bind(referred_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to register referral")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn get_by_referred(&self, referred_id: i64) -> Result<Option<Referral>> {
        sqlx::query_as::<_, Referral>("SELECT * FROM referrals WHERE referred_id = $1")
            .bind(referred_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch referral")
    }

    /// Grants the bonus once. `false` means it was already granted.
    pub async fn mark_granted<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE referrals SET bonus_granted = 1, bonus_days = $2, granted_at = $3
            WHERE id = $1 AND bonus_granted = 0
            "#,
        )
        .bind(id)
        .bind(days)
        .bind(now)
        .execute(executor)
        .await
        .context("Failed to mark referral bonus as granted")?;
        Ok(res.rows_affected() == 1)
    }

    /// (invited users, bonus days earned)
    pub async fn stats_for_referrer(&self, referrer_id: i64) -> Result<(i64, i64)> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT COUNT(*), COALESCE(SUM(bonus_days), 0) FROM referrals WHERE referrer_id = $1",
        )
        .bind(referrer_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to load referral stats")
    }
}
