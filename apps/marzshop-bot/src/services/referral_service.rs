use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use marzshop_db::{utc_now, Store};
use tracing::{info, warn};

use crate::errors::WorkflowResult;
use crate::panel::AccountSpec;
use crate::services::notification_service::NotificationService;
use crate::services::subscription_service::SubscriptionService;
use crate::texts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    NoReferral,
    AlreadyGranted,
    /// The referrer's live subscription was extended.
    Extended {
        referrer_id: i64,
        days: i64,
        expires_at: DateTime<Utc>,
    },
    /// Kept on the referrer's record until their next provisioning.
    Banked { referrer_id: i64, days: i64 },
}

#[derive(Clone)]
pub struct ReferralService {
    store: Store,
    subscriptions: SubscriptionService,
    notifier: NotificationService,
    bonus_days: i64,
}

impl ReferralService {
    pub fn new(
        store: Store,
        subscriptions: SubscriptionService,
        notifier: NotificationService,
        bonus_days: i64,
    ) -> Self {
        Self {
            store,
            subscriptions,
            notifier,
            bonus_days,
        }
    }

    pub fn bonus_days(&self) -> i64 {
        self.bonus_days
    }

    /// Links `referred` to `referrer` unless it is a self-referral, the
    /// referrer is unknown, or `referred` already has a referrer.
    pub async fn register_referral(&self, referred_id: i64, referrer_id: i64) -> anyhow::Result<bool> {
        if referred_id == referrer_id {
            return Ok(false);
        }
        if self.store.users.get(referrer_id).await?.is_none() {
            return Ok(false);
        }
        let created = self
            .store
            .referrals
            .register(referrer_id, referred_id, utc_now())
            .await?;
        if created {
            info!(referrer_id, referred_id, "Referral registered");
        }
        Ok(created)
    }

    /// Grants the referrer's bonus the first time it is called for
    /// `referred_id`; later calls are no-ops. A banned referrer only gets
    /// the days banked.
    pub async fn maybe_grant(&self, referred_id: i64) -> WorkflowResult<GrantOutcome> {
        let Some(referral) = self.store.referrals.get_by_referred(referred_id).await? else {
            return Ok(GrantOutcome::NoReferral);
        };
        if referral.bonus_granted {
            return Ok(GrantOutcome::AlreadyGranted);
        }
        let referrer_id = referral.referrer_id;
        let days = self.bonus_days;

        let _guard = self.subscriptions.lock_user(referrer_id).await?;
        let now = utc_now();
        let banned = self
            .store
            .users
            .get(referrer_id)
            .await?
            .is_some_and(|u| u.is_banned);
        let live = if banned {
            None
        } else {
            self.store
                .subscriptions
                .current_for_user(self.store.pool(), referrer_id)
                .await?
                .filter(|s| s.is_live(now))
        };

        if let Some(sub) = live {
            let expires_at = sub.expires_at + Duration::days(days);
            let spec = AccountSpec {
                username: sub.panel_username.clone(),
                quota_bytes: sub.traffic_limit_bytes,
                expire_at: expires_at,
                device_limit: self.subscriptions.device_limit_for(&sub.tariff_id),
            };
            match self.subscriptions.apply(&spec).await {
                Ok(_) => {
                    let mut tx = self.store.begin().await?;
                    if !self
                        .store
                        .referrals
                        .mark_granted(&mut *tx, referral.id, days, now)
                        .await?
                    {
                        drop(tx);
                        if let Err(e) = self.subscriptions.reapply_stored(referrer_id).await {
                            warn!(referrer_id, "Failed to re-apply subscription: {}", e);
                        }
                        return Ok(GrantOutcome::AlreadyGranted);
                    }
                    let pushed = self
                        .store
                        .subscriptions
                        .push_expiry(&mut *tx, sub.id, expires_at)
                        .await?;
                    if !pushed {
                        // Renewed in the meantime; keep the days for later.
                        self.store
                            .users
                            .bank_bonus_days(&mut *tx, referrer_id, days)
                            .await?;
                    }
                    tx.commit().await.context("Failed to commit referral bonus")?;

                    if pushed {
                        info!(referrer_id, referred_id, days, "Referral bonus applied");
                        self.notifier
                            .notify_user(referrer_id, texts::referral_extended(days, expires_at))
                            .await;
                        return Ok(GrantOutcome::Extended {
                            referrer_id,
                            days,
                            expires_at,
                        });
                    }
                    // The panel now holds a shorter end than the store.
                    if let Err(e) = self.subscriptions.reapply_stored(referrer_id).await {
                        warn!(referrer_id, "Failed to re-apply renewed subscription: {}", e);
                    }
                    self.notifier
                        .notify_user(referrer_id, texts::referral_banked(days))
                        .await;
                    return Ok(GrantOutcome::Banked { referrer_id, days });
                }
                Err(e) => {
                    warn!(referrer_id, "Panel refused referral extension, banking bonus: {}", e);
                }
            }
        }

        let mut tx = self.store.begin().await?;
        if !self
            .store
            .referrals
            .mark_granted(&mut *tx, referral.id, days, now)
            .await?
        {
            return Ok(GrantOutcome::AlreadyGranted);
        }
        self.store
            .users
            .bank_bonus_days(&mut *tx, referrer_id, days)
            .await?;
        tx.commit().await.context("Failed to commit banked referral bonus")?;

        info!(referrer_id, referred_id, days, "Referral bonus banked");
        self.notifier
            .notify_user(referrer_id, texts::referral_banked(days))
            .await;
        Ok(GrantOutcome::Banked { referrer_id, days })
    }

    /// (invited users, bonus days earned)
    pub async fn stats(&self, referrer_id: i64) -> anyhow::Result<(i64, i64)> {
        self.store.referrals.stats_for_referrer(referrer_id).await
    }
}
