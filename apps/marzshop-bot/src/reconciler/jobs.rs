use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use marzshop_db::Store;
use std::sync::Arc;
use tracing::{info, warn};

use crate::panel::{PanelApi, PanelError};
use crate::services::notification_service::NotificationService;
use crate::services::subscription_service::SubscriptionService;
use crate::texts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Job {
    ExpirySweep,
    ExpiryReminders,
    TrafficSync,
    PaymentPurge,
}

impl Job {
    pub const ALL: [Job; 4] = [
        Job::ExpirySweep,
        Job::ExpiryReminders,
        Job::TrafficSync,
        Job::PaymentPurge,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::ExpirySweep => "expiry-sweep",
            Job::ExpiryReminders => "expiry-reminders",
            Job::TrafficSync => "traffic-sync",
            Job::PaymentPurge => "payment-purge",
        }
    }

    pub fn period(self) -> std::time::Duration {
        match self {
            Job::PaymentPurge => std::time::Duration::from_secs(24 * 3600),
            _ => std::time::Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobReport {
    pub processed: usize,
    pub failed: usize,
}

/// The smallest threshold already crossed with `left` remaining.
pub fn crossed_threshold(thresholds: &[i64], left: Duration) -> Option<i64> {
    thresholds
        .iter()
        .copied()
        .filter(|h| left <= Duration::hours(*h))
        .min()
}

/// Periodic, idempotent maintenance over the store and the panel.
pub struct Reconciler {
    store: Store,
    panel: Arc<dyn PanelApi>,
    subscriptions: SubscriptionService,
    notifier: NotificationService,
    reminder_hours: Vec<i64>,
    payment_retention: Duration,
}

impl Reconciler {
    pub fn new(
        store: Store,
        panel: Arc<dyn PanelApi>,
        subscriptions: SubscriptionService,
        notifier: NotificationService,
        reminder_hours: Vec<i64>,
        payment_retention: Duration,
    ) -> Self {
        Self {
            store,
            panel,
            subscriptions,
            notifier,
            reminder_hours,
            payment_retention,
        }
    }

    pub async fn run(&self, job: Job, now: DateTime<Utc>) -> Result<JobReport> {
        match job {
            Job::ExpirySweep => self.expiry_sweep(now).await,
            Job::ExpiryReminders => self.expiry_reminders(now).await,
            Job::TrafficSync => self.traffic_sync(now).await,
            Job::PaymentPurge => self.purge_payments(now).await,
        }
    }

    /// Disables panel accounts of subscriptions past their end and marks them
    /// expired. Rows whose panel call fails stay active for the next run.
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let due = self.store.subscriptions.list_due(now).await?;
        let mut report = JobReport::default();

        for sub in due {
            match self.panel.disable_account(&sub.panel_username).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(subscription_id = sub.id, "Could not disable expired account: {}", e);
                    report.failed += 1;
                    continue;
                }
            }

            if self.store.subscriptions.expire_if_due(sub.id, now).await? {
                report.processed += 1;
                info!(subscription_id = sub.id, user_id = sub.user_id, "Subscription expired");
                self.notifier
                    .notify_user(sub.user_id, texts::subscription_expired())
                    .await;
            } else {
                // Renewed between listing and disabling.
                warn!(subscription_id = sub.id, "Subscription changed during sweep, restoring access");
                if let Err(e) = self.subscriptions.restore_account(sub.user_id).await {
                    warn!(user_id = sub.user_id, "Restore after sweep race failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// One reminder per crossed threshold per term; the marker is written
    /// before sending, so a failed delivery is not retried.
    pub async fn expiry_reminders(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let mut report = JobReport::default();
        let Some(&horizon) = self.reminder_hours.iter().max() else {
            return Ok(report);
        };

        let expiring = self
            .store
            .subscriptions
            .list_expiring(now, now + Duration::hours(horizon))
            .await?;
        for sub in expiring {
            let Some(threshold) = crossed_threshold(&self.reminder_hours, sub.expires_at - now) else {
                continue;
            };
            if sub.last_reminder_hours.is_some_and(|last| last <= threshold) {
                continue;
            }
            if !self.store.subscriptions.record_reminder(sub.id, threshold).await? {
                continue;
            }
            if self
                .notifier
                .notify_user(sub.user_id, texts::expiry_reminder(&sub, now))
                .await
            {
                report.processed += 1;
            } else {
                report.failed += 1;
            }
        }
        Ok(report)
    }

    pub async fn traffic_sync(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let live = self.store.subscriptions.list_live(now).await?;
        let mut report = JobReport::default();

        for sub in live {
            match self.panel.fetch_usage(&sub.panel_username).await {
                Ok(used) => {
                    self.store
                        .subscriptions
                        .update_traffic(sub.id, used, now)
                        .await?;
                    report.processed += 1;
                }
                Err(PanelError::NotFound(_)) => {
                    warn!(subscription_id = sub.id, "Panel has no account for an active subscription");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(subscription_id = sub.id, "Traffic sync failed: {}", e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Drops decided payments and never-confirmed drafts older than the
    /// retention window. Pending payments are kept regardless of age.
    pub async fn purge_payments(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let cutoff = now - self.payment_retention;
        let decided = self.store.payments.purge_decided_before(cutoff).await?;
        let drafts = self.store.payments.purge_stale_requests(cutoff).await?;
        if decided + drafts > 0 {
            info!(decided, drafts, "Old payments purged");
        }
        Ok(JobReport {
            processed: (decided + drafts) as usize,
            failed: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, PanelCall};
    use marzshop_db::models::SubscriptionStatus;
    use marzshop_db::utc_now;

    fn reconciler(h: &Harness) -> Reconciler {
        Reconciler::new(
            h.store.clone(),
            h.panel.clone(),
            h.subscriptions.clone(),
            h.notifier.clone(),
            vec![72, 48, 24],
            Duration::days(30),
        )
    }

    #[test]
    fn thresholds_pick_the_tightest_crossed() {
        let t = [72, 48, 24];
        assert_eq!(crossed_threshold(&t, Duration::hours(80)), None);
        assert_eq!(crossed_threshold(&t, Duration::hours(60)), Some(72));
        assert_eq!(crossed_threshold(&t, Duration::hours(30)), Some(48));
        assert_eq!(crossed_threshold(&t, Duration::hours(2)), Some(24));
    }

    #[tokio::test]
    async fn sweep_twice_disables_once() {
        let h = Harness::new().await;
        let now = utc_now();
        let sub = h.user_with_subscription(42, now - Duration::minutes(5)).await;
        h.user_with_subscription(43, now + Duration::days(3)).await;
        let r = reconciler(&h);

        let first = r.expiry_sweep(now).await.unwrap();
        assert_eq!(first, JobReport { processed: 1, failed: 0 });
        let second = r.expiry_sweep(now).await.unwrap();
        assert_eq!(second, JobReport::default());

        assert_eq!(h.panel.disable_calls(), vec![sub.panel_username.clone()]);
        let stored = h.store.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Expired);
        assert_eq!(h.sink.messages_to(42).len(), 1);
    }

    #[tokio::test]
    async fn sweep_leaves_row_active_when_panel_fails() {
        let h = Harness::new().await;
        let now = utc_now();
        let sub = h.user_with_subscription(42, now - Duration::minutes(5)).await;
        h.panel.set_unreachable(&sub.panel_username);
        let r = reconciler(&h);

        let report = r.expiry_sweep(now).await.unwrap();
        assert_eq!(report.failed, 1);
        let stored = h.store.subscriptions.get(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);
        assert!(h.sink.messages_to(42).is_empty());
    }

    #[tokio::test]
    async fn reminders_are_sent_once_per_threshold() {
        let h = Harness::new().await;
        let now = utc_now();
        h.user_with_subscription(42, now + Duration::hours(60)).await;
        let r = reconciler(&h);

        assert_eq!(r.expiry_reminders(now).await.unwrap().processed, 1);
        assert_eq!(r.expiry_reminders(now).await.unwrap().processed, 0);
        assert_eq!(r.expiry_reminders(now + Duration::hours(1)).await.unwrap().processed, 0);

        // 47 hours left crosses 48h, 20 hours left crosses 24h.
        assert_eq!(r.expiry_reminders(now + Duration::hours(13)).await.unwrap().processed, 1);
        assert_eq!(r.expiry_reminders(now + Duration::hours(40)).await.unwrap().processed, 1);
        assert_eq!(r.expiry_reminders(now + Duration::hours(41)).await.unwrap().processed, 0);
        assert_eq!(h.sink.messages_to(42).len(), 3);
    }

    #[tokio::test]
    async fn traffic_sync_skips_unreachable_accounts() {
        let h = Harness::new().await;
        let now = utc_now();
        let a = h.user_with_subscription(1, now + Duration::days(5)).await;
        let b = h.user_with_subscription(2, now + Duration::days(5)).await;
        h.panel.set_unreachable(&a.panel_username);
        h.panel.set_usage(&b.panel_username, 4096);

        let report = reconciler(&h).traffic_sync(now).await.unwrap();
        assert_eq!(report, JobReport { processed: 1, failed: 1 });

        let a = h.store.subscriptions.get(a.id).await.unwrap().unwrap();
        let b = h.store.subscriptions.get(b.id).await.unwrap().unwrap();
        assert_eq!(a.traffic_used_bytes, 0);
        assert!(a.traffic_synced_at.is_none());
        assert_eq!(b.traffic_used_bytes, 4096);
        assert_eq!(b.traffic_synced_at, Some(now));
        assert!(h
            .panel
            .calls()
            .contains(&PanelCall::Usage(a.panel_username.clone())));
    }

    #[tokio::test]
    async fn purge_runs_through_job_dispatch() {
        let h = Harness::new().await;
        let report = reconciler(&h).run(Job::PaymentPurge, utc_now()).await.unwrap();
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn purge_drops_abandoned_drafts() {
        let h = Harness::new().await;
        h.user(42).await;
        let draft = h.payments.request(42, "basic").await.unwrap().payment;
        let waiting = h.payments.submit(42, "basic").await.unwrap();

        let later = utc_now() + Duration::days(400);
        let report = reconciler(&h).run(Job::PaymentPurge, later).await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(h.store.payments.get(draft.id).await.unwrap().is_none());
        assert!(h.store.payments.get(waiting).await.unwrap().is_some());
    }
}
