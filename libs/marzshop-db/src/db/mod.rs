use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;

use crate::repositories::{
    payment_repo::PaymentRepository, referral_repo::ReferralRepository,
    subscription_repo::SubscriptionRepository, user_repo::UserRepository,
};

/// Current time truncated to whole seconds.
///
/// Every timestamp is bound from here (or derived from it by whole days/hours),
/// so the TEXT encoding stays fixed-width and compares chronologically.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    if !database_url.starts_with("sqlite:") {
        return Err(anyhow::anyhow!("DATABASE_URL must start with sqlite://"));
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .context("Invalid DATABASE_URL")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(10));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!("Database ready at {}", database_url);
    Ok(pool)
}

/// Private in-memory database. A single connection that never recycles,
/// otherwise each new connection would see an empty database.
pub async fn init_memory_db() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("Failed to open in-memory SQLite")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    Ok(pool)
}

/// All repositories over one pool.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    pub users: UserRepository,
    pub subscriptions: SubscriptionRepository,
    pub payments: PaymentRepository,
    pub referrals: ReferralRepository,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            subscriptions: SubscriptionRepository::new(pool.clone()),
            payments: PaymentRepository::new(pool.clone()),
            referrals: ReferralRepository::new(pool.clone()),
            pool,
        }
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(init_memory_db().await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to start transaction")
    }
}
