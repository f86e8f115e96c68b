use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::user::User;

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>> {
        self.get_with(&self.pool, id).await
    }

    pub async fn get_with<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
    ) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(executor)
            .await
            .context("Failed to fetch user by ID")
    }

    /// Inserts the user if unknown, otherwise refreshes the display fields.
    /// Returns the stored user and whether it was created by this call.
    pub async fn register(
        &self,
        id: i64,
        username: Option<&str>,
        full_name: Option<&str>,
        panel_username: &str,
        referred_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(User, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO users (id, username, full_name, panel_username, referred_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(username)
        .bind(full_name)
        .bind(panel_username)
        .bind(referred_by)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query("UPDATE users SET username = $2, full_name = $3 WHERE id = $1")
                .bind(id)
                .bind(username)
                .bind(full_name)
                .execute(&self.pool)
                .await
                .context("Failed to refresh user names")?;
        }

        let user = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User {} vanished after upsert", id))?;
        Ok((user, inserted))
    }

    /// Matches a numeric id exactly, otherwise a case-insensitive substring of
    /// username or full name. A leading `@` is ignored.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<User>> {
        let query = query.trim().trim_start_matches('@');
        if query.is_empty() {
            return Ok(Vec::new());
        }
        if let Ok(id) = query.parse::<i64>() {
            return Ok(self.get(id).await?.into_iter().collect());
        }

        let pattern = format!("%{}%", escape_like(query));
        sqlx::query_as::<_, User>(
            r#"
            SELECT * FROM users
            WHERE username LIKE $1 ESCAPE '\' OR full_name LIKE $1 ESCAPE '\'
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to search users")
    }

    pub async fn set_banned(&self, id: i64, banned: bool) -> Result<bool> {
        let res = sqlx::query("UPDATE users SET is_banned = $2 WHERE id = $1")
            .bind(id)
            .bind(banned)
            .execute(&self.pool)
            .await
            .context("Failed to update ban flag")?;
        Ok(res.rows_affected() == 1)
    }

    /// Flips the trial flag once. `false` means the trial was already taken.
    pub async fn mark_trial_used<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE users SET trial_used = 1 WHERE id = $1 AND trial_used = 0")
            .bind(id)
            .execute(executor)
            .await
            .context("Failed to mark trial as used")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn bank_bonus_days<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        days: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE users SET bonus_days_banked = bonus_days_banked + $2 WHERE id = $1")
            .bind(id)
            .bind(days)
            .execute(executor)
            .await
            .context("Failed to bank bonus days")?;
        Ok(())
    }

    /// Subtracts days that were just applied to a subscription.
    pub async fn consume_banked_days<'e>(
        &self,
        executor: impl SqliteExecutor<'e>,
        id: i64,
        days: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE users SET bonus_days_banked = MAX(bonus_days_banked - $2, 0) WHERE id = $1",
        )
        .bind(id)
        .bind(days)
        .execute(executor)
        .await
        .context("Failed to consume banked bonus days")?;
        Ok(())
    }

    /// Recipients of a broadcast.
    pub async fn list_unbanned_ids(&self) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT id FROM users WHERE is_banned = 0 ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list user ids")
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count users")
    }

    pub async fn count_banned(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE is_banned = 1")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count banned users")
    }
}

/// Makes `%`, `_` and `\` match literally under `ESCAPE '\'`.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
