use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::subscription::{NewSubscription, Subscription};

#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscription")
    }

    /// The row with status `active`, whether or not its end already passed.
    pub async fn current_for_user<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        user_id: i64,
    ) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND status = 'active'",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await
        .context("Failed to fetch current subscription")
    }

    pub async fn latest_for_user(&self, user_id: i64) -> Result<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY expires_at DESC, id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch latest subscription")
    }

    pub async fn has_trial<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        user_id: i64,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE user_id = $1 AND is_trial = 1",
        )
        .bind(user_id)
        .fetch_one(executor)
        .await
        .context("Failed to check trial history")?;
        Ok(count > 0)
    }

    pub async fn insert<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        new: &NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (user_id, tariff_id, status, is_trial, started_at, expires_at,
                 traffic_limit_bytes, panel_username, subscription_url, created_at)
            VALUES ($1, $2, 'active', $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(&new.tariff_id)
        .bind(new.is_trial)
        .bind(new.started_at)
        .bind(new.expires_at)
        .bind(new.traffic_limit_bytes)
        .bind(&new.panel_username)
        .bind(&new.subscription_url)
        .bind(now)
        .fetch_one(executor)
        .await
        .context("Failed to insert subscription")
    }

    /// Renewal: new end, tariff and quota; the reminder marker starts over.
    pub async fn extend<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        tariff_id: &str,
        expires_at: DateTime<Utc>,
        traffic_limit_bytes: i64,
        subscription_url: Option<&str>,
    ) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET tariff_id = $2,
                expires_at = $3,
                traffic_limit_bytes = $4,
                subscription_url = COALESCE($5, subscription_url),
                is_trial = 0,
                last_reminder_hours = NULL
            WHERE id = $1 AND status = 'active'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(tariff_id)
        .bind(expires_at)
        .bind(traffic_limit_bytes)
        .bind(subscription_url)
        .fetch_one(executor)
        .await
        .context("Failed to extend subscription")
    }

    /// Moves only the end timestamp, e.g. for a referral bonus.
    pub async fn push_expiry<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE subscriptions
            SET expires_at = $2, last_reminder_hours = NULL
            WHERE id = $1 AND status = 'active' AND expires_at < $2
            "#,
        )
        .bind(id)
        .bind(expires_at)
        .execute(executor)
        .await
        .context("Failed to push subscription expiry")?;
        Ok(res.rows_affected() == 1)
    }

    /// Retires a lapsed row unconditionally (used while replacing it).
    pub async fn mark_expired<'e>(&self, executor: impl SqliteExecutor<'e>, id: i64) -> Result<()> {
        sqlx::query("UPDATE subscriptions SET status = 'expired' WHERE id = $1")
            .bind(id)
            .execute(executor)
            .await
            .context("Failed to mark subscription expired")?;
        Ok(())
    }

    /// Expires the row only if it is still active and still due at `now`.
    pub async fn expire_if_due(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'expired'
            WHERE id = $1 AND status = 'active' AND expires_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to expire subscription")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active' AND expires_at <= $1
            ORDER BY expires_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list due subscriptions")
    }

    pub async fn list_live(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE status = 'active' AND expires_at > $1 ORDER BY id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active subscriptions")
    }

    pub async fn list_expiring(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE status = 'active' AND expires_at > $1 AND expires_at <= $2
            ORDER BY expires_at
            "#,
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expiring subscriptions")
    }

    /// Records a reminder threshold if it is smaller than the last one sent.
    /// `false` means this threshold (or a smaller one) was already handled.
    pub async fn record_reminder(&self, id: i64, hours: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE subscriptions SET last_reminder_hours = $2
            WHERE id = $1 AND (last_reminder_hours IS NULL OR last_reminder_hours > $2)
            "#,
        )
        .bind(id)
        .bind(hours)
        .execute(&self.pool)
        .await
        .context("Failed to record reminder")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn update_traffic(&self, id: i64, used_bytes: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET traffic_used_bytes = $2, traffic_synced_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(used_bytes)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to update traffic usage")?;
        Ok(())
    }

    pub async fn count_live(&self, now: DateTime<Utc>) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE status = 'active' AND expires_at > $1",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count active subscriptions")
    }
}
