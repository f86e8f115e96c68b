use anyhow::Context;
use marzshop_db::models::{Payment, PaymentStatus, Subscription};
use marzshop_db::{utc_now, Store};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::catalog::{Tariff, TariffCatalog};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::panel::AccessDescriptor;
use crate::services::notification_service::NotificationService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;
use crate::texts;

/// Card transfer details shown to the buyer.
#[derive(Debug, Clone)]
pub struct PaymentDetails {
    pub card_number: String,
    pub card_holder: String,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub payment: Payment,
    pub tariff: Tariff,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Approved {
        payment: Payment,
        subscription: Subscription,
        access: AccessDescriptor,
    },
    Rejected {
        payment: Payment,
    },
}

/// Marks a payment as being decided in this process until dropped.
struct DecisionClaim {
    in_flight: Arc<Mutex<HashSet<i64>>>,
    payment_id: i64,
}

impl Drop for DecisionClaim {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.payment_id);
        }
    }
}

fn transfer_comment() -> String {
    format!("VPN{}", rand::rng().random_range(100_000..1_000_000))
}

#[derive(Clone)]
pub struct PaymentService {
    store: Store,
    catalog: Arc<TariffCatalog>,
    subscriptions: SubscriptionService,
    referrals: ReferralService,
    notifier: NotificationService,
    details: PaymentDetails,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl PaymentService {
    pub fn new(
        store: Store,
        catalog: Arc<TariffCatalog>,
        subscriptions: SubscriptionService,
        referrals: ReferralService,
        notifier: NotificationService,
        details: PaymentDetails,
    ) -> Self {
        Self {
            store,
            catalog,
            subscriptions,
            referrals,
            notifier,
            details,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn details(&self) -> &PaymentDetails {
        &self.details
    }

    /// Creates a `requested` payment for a purchasable tariff.
    pub async fn request(&self, user_id: i64, tariff_id: &str) -> WorkflowResult<PaymentRequest> {
        let user = self
            .store
            .users
            .get(user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(user_id))?;
        if user.is_banned {
            return Err(WorkflowError::UserBanned(user_id));
        }
        let tariff = self
            .catalog
            .get(tariff_id)
            .filter(|t| !t.is_trial)
            .cloned()
            .ok_or_else(|| WorkflowError::InvalidTariff(tariff_id.to_string()))?;

        let payment = self
            .store
            .payments
            .create(user_id, &tariff.id, tariff.price, &transfer_comment(), utc_now())
            .await?;
        info!(payment_id = payment.id, user_id, tariff = %tariff.id, "Payment requested");
        Ok(PaymentRequest { payment, tariff })
    }

    /// `requested -> pending`; admins get the payment with decision buttons.
    pub async fn confirm(&self, payment_id: i64, user_id: i64) -> WorkflowResult<Payment> {
        let payment = self
            .store
            .payments
            .get(payment_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("Payment #{}", payment_id)))?;

        match payment.status {
            PaymentStatus::Requested => {}
            PaymentStatus::Pending => return Err(WorkflowError::AlreadyConfirmed(payment_id)),
            PaymentStatus::Approved | PaymentStatus::Rejected => {
                return Err(WorkflowError::AlreadyDecided(payment_id))
            }
        }

        if !self
            .store
            .payments
            .confirm(payment_id, user_id, utc_now())
            .await?
        {
            return Err(WorkflowError::AlreadyConfirmed(payment_id));
        }
        let payment = self
            .store
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Payment #{}", payment_id)))?;

        let user = self
            .store
            .users
            .get(user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(user_id))?;
        let tariff_name = self
            .catalog
            .get(&payment.tariff_id)
            .map(|t| t.name.as_str())
            .unwrap_or(&payment.tariff_id);

        let report = self
            .notifier
            .notify_admins(texts::admin_new_payment(
                &payment,
                tariff_name,
                &user,
                &self.details.currency,
            ))
            .await;
        if report.sent == 0 {
            error!(payment_id, "No admin could be notified about a pending payment");
        }
        info!(payment_id, user_id, "Payment awaiting review");
        Ok(payment)
    }

    /// Drops a draft the user has not confirmed.
    pub async fn cancel(&self, payment_id: i64, user_id: i64) -> WorkflowResult<()> {
        if self.store.payments.cancel_request(payment_id, user_id).await? {
            Ok(())
        } else {
            Err(WorkflowError::NotFound(format!("Payment #{}", payment_id)))
        }
    }

    /// One-step request + confirm.
    pub async fn submit(&self, user_id: i64, tariff_id: &str) -> WorkflowResult<i64> {
        let request = self.request(user_id, tariff_id).await?;
        let payment = self.confirm(request.payment.id, user_id).await?;
        Ok(payment.id)
    }

    fn claim(&self, payment_id: i64) -> WorkflowResult<DecisionClaim> {
        let mut set = self
            .in_flight
            .lock()
            .map_err(|_| anyhow::anyhow!("payment decision registry is poisoned"))?;
        if !set.insert(payment_id) {
            return Err(WorkflowError::AlreadyDecided(payment_id));
        }
        Ok(DecisionClaim {
            in_flight: self.in_flight.clone(),
            payment_id,
        })
    }

    pub async fn decide(&self, payment_id: i64, admin_id: i64, approve: bool) -> WorkflowResult<Decision> {
        let _claim = self.claim(payment_id)?;

        let payment = self
            .store
            .payments
            .get(payment_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("Payment #{}", payment_id)))?;
        if payment.status != PaymentStatus::Pending {
            return Err(WorkflowError::AlreadyDecided(payment_id));
        }

        if approve {
            self.approve(payment, admin_id).await
        } else {
            self.reject(payment, admin_id).await
        }
    }

    /// A banned buyer is refused and the payment stays pending until the
    /// user is unbanned or the payment is rejected.
    async fn approve(&self, payment: Payment, admin_id: i64) -> WorkflowResult<Decision> {
        let tariff = self
            .catalog
            .get(&payment.tariff_id)
            .cloned()
            .ok_or_else(|| WorkflowError::InvalidTariff(payment.tariff_id.clone()))?;

        let guard = self.subscriptions.lock_user(payment.user_id).await?;
        let now = utc_now();
        let user = self
            .store
            .users
            .get(payment.user_id)
            .await?
            .ok_or(WorkflowError::UnknownUser(payment.user_id))?;
        if user.is_banned {
            warn!(payment_id = payment.id, user_id = user.id, "Refusing to approve a banned user's payment");
            return Err(WorkflowError::UserBanned(user.id));
        }

        let plan = self.subscriptions.plan(&user, &tariff, now).await?;
        let access = match self.subscriptions.provision(&plan).await {
            Ok(access) => access,
            Err(e) => {
                warn!(payment_id = payment.id, "Provisioning failed, payment stays pending: {}", e);
                return Err(e.into());
            }
        };

        let mut tx = self.store.begin().await?;
        if !self
            .store
            .payments
            .decide(&mut *tx, payment.id, PaymentStatus::Approved, admin_id, now)
            .await?
        {
            return Err(WorkflowError::AlreadyDecided(payment.id));
        }
        let subscription = self
            .subscriptions
            .commit_plan(&mut tx, &plan, &access, now)
            .await?;
        tx.commit().await.context("Failed to commit payment approval")?;
        drop(guard);

        info!(
            payment_id = payment.id,
            user_id = user.id,
            admin_id,
            expires_at = %subscription.expires_at,
            "Payment approved"
        );

        self.notifier
            .notify_user(
                user.id,
                texts::payment_approved(&tariff, &subscription, &access),
            )
            .await;

        if let Err(e) = self.referrals.maybe_grant(user.id).await {
            warn!(user_id = user.id, "Referral bonus failed: {}", e);
        }

        let payment = self
            .store
            .payments
            .get(payment.id)
            .await?
            .unwrap_or(payment);
        Ok(Decision::Approved {
            payment,
            subscription,
            access,
        })
    }

    async fn reject(&self, payment: Payment, admin_id: i64) -> WorkflowResult<Decision> {
        if !self
            .store
            .payments
            .decide(self.store.pool(), payment.id, PaymentStatus::Rejected, admin_id, utc_now())
            .await?
        {
            return Err(WorkflowError::AlreadyDecided(payment.id));
        }
        info!(payment_id = payment.id, admin_id, "Payment rejected");

        self.notifier
            .notify_user(payment.user_id, texts::payment_rejected(payment.id))
            .await;

        let payment = self
            .store
            .payments
            .get(payment.id)
            .await?
            .unwrap_or(payment);
        Ok(Decision::Rejected { payment })
    }

    pub async fn pending(&self, limit: i64) -> anyhow::Result<Vec<Payment>> {
        self.store.payments.list_pending(limit).await
    }

    pub async fn get(&self, payment_id: i64) -> anyhow::Result<Option<Payment>> {
        self.store.payments.get(payment_id).await
    }
}
