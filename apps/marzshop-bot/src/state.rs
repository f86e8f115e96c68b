use std::sync::Arc;

use crate::catalog::TariffCatalog;
use crate::services::notification_service::NotificationService;
use crate::services::payment_service::PaymentService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;
use crate::services::user_service::UserService;

/// Links shown under /help.
#[derive(Debug, Clone, Default)]
pub struct Contacts {
    pub support_url: Option<String>,
    pub channel: Option<String>,
    pub site: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<TariffCatalog>,
    pub users: UserService,
    pub subscriptions: SubscriptionService,
    pub payments: PaymentService,
    pub referrals: ReferralService,
    pub notifier: NotificationService,
    pub contacts: Contacts,
    /// Filled in once `get_me` succeeds.
    pub bot_username: Arc<std::sync::OnceLock<String>>,
}

impl AppState {
    pub fn currency(&self) -> &str {
        &self.payments.details().currency
    }

    pub fn referral_link(&self, user_id: i64) -> String {
        let bot = self.bot_username.get().map(String::as_str).unwrap_or("bot");
        format!("https://t.me/{}?start=ref_{}", bot, user_id)
    }
}
