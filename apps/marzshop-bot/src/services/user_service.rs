use marzshop_db::models::{PaymentStatus, User};
use marzshop_db::{utc_now, Store};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{WorkflowError, WorkflowResult};
use crate::panel::{PanelApi, PanelStats};
use crate::services::notification_service::{escape_html, DeliveryReport, NotificationService, Outbound};
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;
use crate::texts;

const SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Clone)]
pub struct Registration {
    pub user: User,
    pub created: bool,
    /// Set when this registration created a referral.
    pub referrer_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub users: i64,
    pub banned: i64,
    pub active_subscriptions: i64,
    pub pending_payments: i64,
    pub panel: Option<PanelStats>,
}

/// `ref_<telegram id>` from a /start payload.
pub fn parse_referral_payload(payload: &str) -> Option<i64> {
    payload.trim().strip_prefix("ref_")?.parse().ok()
}

/// Panel usernames allow `[a-z0-9_]`, 3 to 32 characters.
fn panel_username_for(user_id: i64) -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .filter(|c| c.is_ascii_lowercase())
        .take(4)
        .map(char::from)
        .collect();
    format!("user_{}_{}", user_id.unsigned_abs(), suffix)
}

#[derive(Clone)]
pub struct UserService {
    store: Store,
    panel: Arc<dyn PanelApi>,
    subscriptions: SubscriptionService,
    referrals: ReferralService,
    notifier: NotificationService,
}

impl UserService {
    pub fn new(
        store: Store,
        panel: Arc<dyn PanelApi>,
        subscriptions: SubscriptionService,
        referrals: ReferralService,
        notifier: NotificationService,
    ) -> Self {
        Self {
            store,
            panel,
            subscriptions,
            referrals,
            notifier,
        }
    }

    /// First contact or /start. A referral payload only counts for new users.
    pub async fn register(
        &self,
        user_id: i64,
        username: Option<&str>,
        full_name: Option<&str>,
        start_payload: Option<&str>,
    ) -> WorkflowResult<Registration> {
        let referrer = start_payload
            .and_then(parse_referral_payload)
            .filter(|r| *r != user_id);
        let referrer = match referrer {
            Some(r) if self.store.users.get(r).await?.is_some() => Some(r),
            _ => None,
        };

        let (user, created) = self
            .store
            .users
            .register(
                user_id,
                username,
                full_name,
                &panel_username_for(user_id),
                referrer,
                utc_now(),
            )
            .await?;

        let mut referrer_id = None;
        if created {
            info!(user_id, "New user registered");
            if let Some(r) = referrer {
                if self.referrals.register_referral(user_id, r).await? {
                    referrer_id = Some(r);
                    self.notifier
                        .notify_user(r, texts::referral_registered(&user.display_name()))
                        .await;
                }
            }
        }

        Ok(Registration {
            user,
            created,
            referrer_id,
        })
    }

    pub async fn get(&self, user_id: i64) -> anyhow::Result<Option<User>> {
        self.store.users.get(user_id).await
    }

    pub async fn search_user(&self, query: &str) -> anyhow::Result<Vec<User>> {
        self.store.users.search(query, SEARCH_LIMIT).await
    }

    /// Bans the user and disables their panel account on a best-effort basis.
    pub async fn ban_user(&self, user_id: i64) -> WorkflowResult<User> {
        let _guard = self.subscriptions.lock_user(user_id).await?;
        if !self.store.users.set_banned(user_id, true).await? {
            return Err(WorkflowError::UnknownUser(user_id));
        }
        let user = self
            .store
            .users
            .get(user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(user_id))?;
        if let Err(e) = self.panel.disable_account(&user.panel_username).await {
            warn!(user_id, "Banned user but could not disable panel account: {}", e);
        }
        info!(user_id, "User banned");
        Ok(user)
    }

    /// Lifts the ban and re-enables a still-live subscription.
    pub async fn unban_user(&self, user_id: i64) -> WorkflowResult<User> {
        let _guard = self.subscriptions.lock_user(user_id).await?;
        if !self.store.users.set_banned(user_id, false).await? {
            return Err(WorkflowError::UnknownUser(user_id));
        }
        if let Err(e) = self.subscriptions.reapply_stored(user_id).await {
            warn!(user_id, "Unbanned user but could not restore panel account: {}", e);
        }
        info!(user_id, "User unbanned");
        self.store
            .users
            .get(user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(user_id))
    }

    /// Sends the admin's text verbatim; it is escaped, not parsed as HTML.
    pub async fn broadcast(&self, text: &str) -> anyhow::Result<DeliveryReport> {
        let recipients = self.store.users.list_unbanned_ids().await?;
        Ok(self
            .notifier
            .broadcast(&recipients, Outbound::text(escape_html(text)))
            .await)
    }

    pub async fn statistics(&self) -> anyhow::Result<Statistics> {
        let panel = match self.panel.system_stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Panel statistics unavailable: {}", e);
                None
            }
        };
        Ok(Statistics {
            users: self.store.users.count().await?,
            banned: self.store.users.count_banned().await?,
            active_subscriptions: self.store.subscriptions.count_live(utc_now()).await?,
            pending_payments: self
                .store
                .payments
                .count_with_status(PaymentStatus::Pending)
                .await?,
            panel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use chrono::Duration;

    #[test]
    fn referral_payload_parsing() {
        assert_eq!(parse_referral_payload("ref_123"), Some(123));
        assert_eq!(parse_referral_payload(" ref_9 "), Some(9));
        assert_eq!(parse_referral_payload("ref_"), None);
        assert_eq!(parse_referral_payload("promo_1"), None);
    }

    #[test]
    fn panel_usernames_are_valid() {
        let name = panel_username_for(1234567890);
        assert!(name.starts_with("user_1234567890_"));
        assert!(name.len() <= 32);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[tokio::test]
    async fn referral_only_counts_for_new_users() {
        let h = Harness::new().await;
        h.user(1).await;

        let reg = h.users.register(2, Some("bob"), None, Some("ref_1")).await.unwrap();
        assert!(reg.created);
        assert_eq!(reg.referrer_id, Some(1));
        assert_eq!(reg.user.referred_by, Some(1));
        assert_eq!(h.sink.messages_to(1).len(), 1);

        h.user(3).await;
        let again = h.users.register(2, Some("bob"), None, Some("ref_3")).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.referrer_id, None);
        let referral = h.store.referrals.get_by_referred(2).await.unwrap().unwrap();
        assert_eq!(referral.referrer_id, 1);
    }

    #[tokio::test]
    async fn unknown_or_self_referrer_is_dropped() {
        let h = Harness::new().await;
        let reg = h.users.register(5, None, None, Some("ref_5")).await.unwrap();
        assert_eq!(reg.referrer_id, None);
        let reg = h.users.register(6, None, None, Some("ref_404")).await.unwrap();
        assert_eq!(reg.user.referred_by, None);
    }

    #[tokio::test]
    async fn ban_disables_and_unban_restores() {
        let h = Harness::new().await;
        let sub = h.user_with_subscription(42, utc_now() + Duration::days(5)).await;

        let user = h.users.ban_user(42).await.unwrap();
        assert!(user.is_banned);
        assert_eq!(h.panel.disable_calls(), vec![sub.panel_username.clone()]);

        let user = h.users.unban_user(42).await.unwrap();
        assert!(!user.is_banned);
        let restored = h.panel.ensure_calls();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].expire_at, sub.expires_at);

        assert!(matches!(h.users.ban_user(999).await, Err(WorkflowError::UnknownUser(999))));
    }

    #[tokio::test]
    async fn broadcast_skips_banned_users() {
        let h = Harness::new().await;
        h.user(1).await;
        h.user(2).await;
        h.user(3).await;
        h.store.users.set_banned(2, true).await.unwrap();

        let report = h.users.broadcast("maintenance tonight").await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(h.sink.recipients(), vec![1, 3]);
    }

    #[tokio::test]
    async fn broadcast_text_is_not_parsed_as_markup() {
        let h = Harness::new().await;
        h.user(1).await;

        h.users.broadcast("Prices < 100 & <b>more</b>").await.unwrap();
        let sent = h.sink.messages_to(1)[0].render_text();
        assert_eq!(sent, "Prices &lt; 100 &amp; &lt;b&gt;more&lt;/b&gt;");
    }

    #[tokio::test]
    async fn statistics_survive_panel_outage() {
        let h = Harness::new().await;
        h.user(1).await;
        h.panel.set_down(true);

        let stats = h.users.statistics().await.unwrap();
        assert_eq!(stats.users, 1);
        assert!(stats.panel.is_none());
    }
}
