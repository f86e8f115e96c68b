use anyhow::Context;
use chrono::{DateTime, Duration};
use chrono::Utc;
use marzshop_db::models::{NewSubscription, Subscription, User};
use marzshop_db::sqlx::SqliteConnection;
use marzshop_db::{utc_now, Store};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::catalog::{Tariff, TariffCatalog};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::panel::{AccessDescriptor, AccountSpec, PanelApi, PanelError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanKind {
    /// Extend the live subscription in place.
    Extend { subscription_id: i64 },
    /// Start a new term now, retiring a lapsed row first if there is one.
    Create { replaces: Option<i64> },
}

/// Everything needed to provision a tariff for a user, computed from the
/// stored state before the panel is touched.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub user_id: i64,
    pub tariff_id: String,
    pub is_trial: bool,
    pub kind: PlanKind,
    pub started_at: DateTime<Utc>,
    pub spec: AccountSpec,
    pub bonus_days_applied: i64,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub subscription: Subscription,
    pub access: AccessDescriptor,
}

/// Quota after adding `tariff` on top of `current`.
fn renewed_quota(current: &Subscription, tariff: &Tariff) -> i64 {
    if tariff.is_unlimited() {
        0
    } else if current.is_unlimited() {
        tariff.quota_bytes() + current.traffic_used_bytes.max(0)
    } else {
        current.traffic_limit_bytes + tariff.quota_bytes()
    }
}

type UserLocks = Arc<Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Clone)]
pub struct SubscriptionService {
    store: Store,
    catalog: Arc<TariffCatalog>,
    panel: Arc<dyn PanelApi>,
    locks: UserLocks,
}

impl SubscriptionService {
    pub fn new(store: Store, catalog: Arc<TariffCatalog>, panel: Arc<dyn PanelApi>) -> Self {
        Self {
            store,
            catalog,
            panel,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Held by everything that writes a user's panel account: purchase,
    /// trial, referral bonus, ban, unban and restore. Specs are absolute,
    /// so two unserialized writers can move an expiry backwards.
    pub async fn lock_user(&self, user_id: i64) -> WorkflowResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| anyhow::anyhow!("provisioning lock registry is poisoned"))?;
            locks.retain(|id, l| *id == user_id || Arc::strong_count(l) > 1);
            locks.entry(user_id).or_default().clone()
        };
        Ok(lock.lock_owned().await)
    }

    pub async fn plan(
        &self,
        user: &User,
        tariff: &Tariff,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ProvisionPlan> {
        let current = self
            .store
            .subscriptions
            .current_for_user(self.store.pool(), user.id)
            .await?;
        let bonus_days = user.bonus_days_banked.max(0);
        let bonus = Duration::days(bonus_days);

        let (kind, started_at, expire_at, quota_bytes) = match current {
            Some(sub) if sub.expires_at > now => (
                PlanKind::Extend {
                    subscription_id: sub.id,
                },
                sub.started_at,
                sub.expires_at + tariff.duration() + bonus,
                renewed_quota(&sub, tariff),
            ),
            lapsed => (
                PlanKind::Create {
                    replaces: lapsed.map(|s| s.id),
                },
                now,
                now + tariff.duration() + bonus,
                tariff.quota_bytes(),
            ),
        };

        Ok(ProvisionPlan {
            user_id: user.id,
            tariff_id: tariff.id.clone(),
            is_trial: tariff.is_trial,
            kind,
            started_at,
            spec: AccountSpec {
                username: user.panel_username.clone(),
                quota_bytes,
                expire_at,
                device_limit: tariff.max_ips,
            },
            bonus_days_applied: bonus_days,
        })
    }

    pub async fn provision(&self, plan: &ProvisionPlan) -> Result<AccessDescriptor, PanelError> {
        self.apply(&plan.spec).await
    }

    /// Writes `spec` to the panel. The caller holds the user's lock.
    pub async fn apply(&self, spec: &AccountSpec) -> Result<AccessDescriptor, PanelError> {
        self.panel.ensure_account(spec).await
    }

    /// Writes the planned subscription. Runs inside the caller's transaction.
    pub async fn commit_plan(
        &self,
        conn: &mut SqliteConnection,
        plan: &ProvisionPlan,
        access: &AccessDescriptor,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Subscription> {
        let subscription = match plan.kind {
            PlanKind::Extend { subscription_id } => {
                self.store
                    .subscriptions
                    .extend(
                        &mut *conn,
                        subscription_id,
                        &plan.tariff_id,
                        plan.spec.expire_at,
                        plan.spec.quota_bytes,
                        Some(&access.subscription_url),
                    )
                    .await?
            }
            PlanKind::Create { replaces } => {
                if let Some(old) = replaces {
                    self.store.subscriptions.mark_expired(&mut *conn, old).await?;
                }
                let new = NewSubscription {
                    user_id: plan.user_id,
                    tariff_id: plan.tariff_id.clone(),
                    is_trial: plan.is_trial,
                    started_at: plan.started_at,
                    expires_at: plan.spec.expire_at,
                    traffic_limit_bytes: plan.spec.quota_bytes,
                    panel_username: plan.spec.username.clone(),
                    subscription_url: Some(access.subscription_url.clone()),
                };
                self.store.subscriptions.insert(&mut *conn, &new, now).await?
            }
        };

        if plan.bonus_days_applied > 0 {
            self.store
                .users
                .consume_banked_days(&mut *conn, plan.user_id, plan.bonus_days_applied)
                .await?;
        }
        Ok(subscription)
    }

    pub async fn activate_trial(&self, user_id: i64) -> WorkflowResult<Activation> {
        let _guard = self.lock_user(user_id).await?;
        let now = utc_now();
        let user = self
            .store
            .users
            .get(user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(user_id))?;
        if user.is_banned {
            return Err(WorkflowError::UserBanned(user_id));
        }
        let tariff = self.catalog.trial().ok_or(WorkflowError::TrialUnavailable)?;

        if user.trial_used
            || self
                .store
                .subscriptions
                .has_trial(self.store.pool(), user_id)
                .await?
        {
            return Err(WorkflowError::TrialAlreadyUsed);
        }
        let current = self
            .store
            .subscriptions
            .current_for_user(self.store.pool(), user_id)
            .await?;
        if current.is_some_and(|s| s.is_live(now)) {
            return Err(WorkflowError::SubscriptionActive);
        }

        let plan = self.plan(&user, tariff, now).await?;
        let access = self.provision(&plan).await?;

        let mut tx = self.store.begin().await?;
        if !self.store.users.mark_trial_used(&mut *tx, user_id).await? {
            return Err(WorkflowError::TrialAlreadyUsed);
        }
        let subscription = self.commit_plan(&mut tx, &plan, &access, now).await?;
        tx.commit().await.context("Failed to commit trial activation")?;

        info!(
            user_id,
            expires_at = %subscription.expires_at,
            "Trial activated"
        );
        Ok(Activation {
            subscription,
            access,
        })
    }

    /// Most recent subscription (live or not) and its tariff, if still listed.
    pub async fn status(&self, user_id: i64) -> WorkflowResult<(Option<Subscription>, Option<Tariff>)> {
        if self.store.users.get(user_id).await?.is_none() {
            return Err(WorkflowError::UnknownUser(user_id));
        }
        let sub = self.store.subscriptions.latest_for_user(user_id).await?;
        let tariff = sub
            .as_ref()
            .and_then(|s| self.catalog.get(&s.tariff_id))
            .cloned();
        Ok((sub, tariff))
    }

    /// Re-applies the stored state of a live subscription to the panel,
    /// e.g. after a lost race with the expiry sweep. Returns `false` if
    /// there is nothing to restore or the user is banned.
    pub async fn restore_account(&self, user_id: i64) -> WorkflowResult<bool> {
        let _guard = self.lock_user(user_id).await?;
        self.reapply_stored(user_id).await
    }

    /// `restore_account` for callers already holding the user's lock.
    pub async fn reapply_stored(&self, user_id: i64) -> WorkflowResult<bool> {
        let now = utc_now();
        match self.store.users.get(user_id).await? {
            Some(user) if !user.is_banned => {}
            _ => return Ok(false),
        }
        let Some(sub) = self
            .store
            .subscriptions
            .current_for_user(self.store.pool(), user_id)
            .await?
            .filter(|s| s.is_live(now))
        else {
            return Ok(false);
        };

        let spec = AccountSpec {
            username: sub.panel_username.clone(),
            quota_bytes: sub.traffic_limit_bytes,
            expire_at: sub.expires_at,
            device_limit: self.device_limit_for(&sub.tariff_id),
        };
        if let Err(e) = self.apply(&spec).await {
            warn!(user_id, "Failed to restore panel account: {}", e);
            return Err(e.into());
        }
        Ok(true)
    }

    pub fn device_limit_for(&self, tariff_id: &str) -> u32 {
        self.catalog.get(tariff_id).map(|t| t.max_ips).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use marzshop_db::models::SubscriptionStatus;

    #[tokio::test]
    async fn trial_is_granted_once() {
        let h = Harness::new().await;
        h.user(42).await;

        let first = h.subscriptions.activate_trial(42).await.unwrap();
        let sub = &first.subscription;
        assert!(sub.is_trial);
        assert_eq!(sub.expires_at - sub.started_at, Duration::days(3));
        assert_eq!(sub.traffic_limit_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(h.panel.ensure_calls().len(), 1);

        let second = h.subscriptions.activate_trial(42).await;
        assert!(matches!(second, Err(WorkflowError::TrialAlreadyUsed)));
        assert_eq!(h.panel.ensure_calls().len(), 1);
    }

    #[tokio::test]
    async fn trial_refused_for_paying_user() {
        let h = Harness::new().await;
        h.user_with_subscription(42, utc_now() + Duration::days(10)).await;

        let res = h.subscriptions.activate_trial(42).await;
        assert!(matches!(res, Err(WorkflowError::SubscriptionActive)));
        assert!(h.panel.calls().is_empty());
    }

    #[tokio::test]
    async fn trial_failure_on_panel_leaves_no_trace() {
        let h = Harness::new().await;
        h.user(42).await;
        h.panel.set_down(true);

        let res = h.subscriptions.activate_trial(42).await;
        assert!(matches!(res, Err(WorkflowError::Panel(PanelError::Unreachable(_)))));

        let user = h.store.users.get(42).await.unwrap().unwrap();
        assert!(!user.trial_used);
        assert!(h.store.subscriptions.latest_for_user(42).await.unwrap().is_none());

        h.panel.set_down(false);
        h.subscriptions.activate_trial(42).await.unwrap();
    }

    #[tokio::test]
    async fn lapsed_row_is_replaced_not_extended() {
        let h = Harness::new().await;
        let now = utc_now();
        let lapsed = h.user_with_subscription(42, now - Duration::hours(2)).await;
        let user = h.store.users.get(42).await.unwrap().unwrap();
        let tariff = h.catalog.get("basic").unwrap();

        let plan = h.subscriptions.plan(&user, tariff, now).await.unwrap();
        assert_eq!(plan.kind, PlanKind::Create { replaces: Some(lapsed.id) });
        assert_eq!(plan.spec.expire_at, now + Duration::days(30));

        let access = h.subscriptions.provision(&plan).await.unwrap();
        let mut tx = h.store.begin().await.unwrap();
        let created = h.subscriptions.commit_plan(&mut tx, &plan, &access, now).await.unwrap();
        tx.commit().await.unwrap();

        let old = h.store.subscriptions.get(lapsed.id).await.unwrap().unwrap();
        assert_eq!(old.status, SubscriptionStatus::Expired);
        assert_eq!(created.status, SubscriptionStatus::Active);
        assert_eq!(created.started_at, now);
    }

    #[tokio::test]
    async fn banked_days_are_added_and_consumed() {
        let h = Harness::new().await;
        let now = utc_now();
        h.user(42).await;
        h.store.users.bank_bonus_days(h.store.pool(), 42, 7).await.unwrap();
        let user = h.store.users.get(42).await.unwrap().unwrap();
        let tariff = h.catalog.get("basic").unwrap();

        let plan = h.subscriptions.plan(&user, tariff, now).await.unwrap();
        assert_eq!(plan.spec.expire_at, now + Duration::days(37));

        let access = h.subscriptions.provision(&plan).await.unwrap();
        let mut tx = h.store.begin().await.unwrap();
        h.subscriptions.commit_plan(&mut tx, &plan, &access, now).await.unwrap();
        tx.commit().await.unwrap();

        let user = h.store.users.get(42).await.unwrap().unwrap();
        assert_eq!(user.bonus_days_banked, 0);
    }

    #[tokio::test]
    async fn restore_leaves_banned_accounts_alone() {
        let h = Harness::new().await;
        let sub = h.user_with_subscription(42, utc_now() + Duration::days(5)).await;
        h.store.users.set_banned(42, true).await.unwrap();

        assert!(!h.subscriptions.restore_account(42).await.unwrap());
        assert!(h.panel.calls().is_empty());

        h.store.users.set_banned(42, false).await.unwrap();
        assert!(h.subscriptions.restore_account(42).await.unwrap());
        assert_eq!(h.panel.ensure_calls()[0].expire_at, sub.expires_at);
    }

    #[tokio::test]
    async fn user_lock_serializes_writers() {
        let h = Harness::new().await;
        let guard = h.subscriptions.lock_user(42).await.unwrap();
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            h.subscriptions.lock_user(42),
        )
        .await;
        assert!(waiting.is_err());
        h.subscriptions.lock_user(43).await.unwrap();

        drop(guard);
        h.subscriptions.lock_user(42).await.unwrap();
    }

    #[test]
    fn quota_renewal_rules() {
        let now = utc_now();
        let mut sub = Subscription {
            id: 1,
            user_id: 1,
            tariff_id: "basic".into(),
            status: SubscriptionStatus::Active,
            is_trial: false,
            started_at: now,
            expires_at: now,
            traffic_limit_bytes: 10,
            traffic_used_bytes: 4,
            traffic_synced_at: None,
            panel_username: "u".into(),
            subscription_url: None,
            last_reminder_hours: None,
            created_at: now,
        };
        let limited = Tariff {
            id: "t".into(),
            name: "T".into(),
            price: 1,
            traffic_gb: 1,
            duration_days: 1,
            max_ips: 1,
            is_trial: false,
            location: None,
        };
        let unlimited = Tariff { traffic_gb: 0, ..limited.clone() };
        let gib = 1024 * 1024 * 1024;

        assert_eq!(renewed_quota(&sub, &limited), 10 + gib);
        assert_eq!(renewed_quota(&sub, &unlimited), 0);
        sub.traffic_limit_bytes = 0;
        assert_eq!(renewed_quota(&sub, &limited), gib + 4);
    }
}
