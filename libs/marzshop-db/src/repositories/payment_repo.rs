use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::payment::{Payment, PaymentStatus};

#[derive(Debug, Clone)]
pub struct PaymentRepository {
    pool: SqlitePool,
}

impl PaymentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: i64,
        tariff_id: &str,
        amount: i64,
        comment: &str,
        now: DateTime<Utc>,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (user_id, tariff_id, amount, status, comment, created_at)
            VALUES ($1, $2, $3, 'requested', $4, $5)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(tariff_id)
        .bind(amount)
        .bind(comment)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create payment")
    }

    pub async fn get(&self, id: i64) -> Result<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch payment")
    }

    /// `requested -> pending` for the owner. `false` if the payment moved on.
    pub async fn confirm(&self, id: i64, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE payments SET status = 'pending', confirmed_at = $3
            WHERE id = $1 AND user_id = $2 AND status = 'requested'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to confirm payment")?;
        Ok(res.rows_affected() == 1)
    }

    /// `pending -> approved | rejected`. Exactly one caller ever sees `true`.
    pub async fn decide<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        status: PaymentStatus,
        admin_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !status.is_decided() {
            return Err(anyhow::anyhow!(
                "Payment can only be decided as approved or rejected, got {}",
                status.as_str()
            ));
        }
        let res = sqlx::query(
            r#"
            UPDATE payments SET status = $2, decided_at = $3, decided_by = $4
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(now)
        .bind(admin_id)
        .execute(executor)
        .await
        .context("Failed to record payment decision")?;
        Ok(res.rows_affected() == 1)
    }

    /// Drops a draft the user has not confirmed yet.
    pub async fn cancel_request(&self, id: i64, user_id: i64) -> Result<bool> {
        let res = sqlx::query(
            "DELETE FROM payments WHERE id = $1 AND user_id = $2 AND status = 'requested'",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel payment request")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_pending(&self, limit: i64) -> Result<Vec<Payment>> {
        sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE status = 'pending' ORDER BY confirmed_at, id LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pending payments")
    }

    pub async fn count_with_status(&self, status: PaymentStatus) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE status = $1")
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count payments")
    }

    /// Deletes decided payments older than `cutoff`. Open payments are kept.
    pub async fn purge_decided_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM payments
            WHERE status IN ('approved', 'rejected') AND decided_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to purge old payments")?;
        Ok(res.rows_affected())
    }

    /// Deletes drafts created before `cutoff` that were never confirmed.
    pub async fn purge_stale_requests(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM payments WHERE status = 'requested' AND created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("Failed to purge abandoned payment requests")?;
        Ok(res.rows_affected())
    }
}
