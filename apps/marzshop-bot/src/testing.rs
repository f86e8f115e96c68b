//! In-process fakes for the chat sink and the VPN panel.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marzshop_db::Store;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::catalog::TariffCatalog;
use crate::panel::{AccessDescriptor, AccountSpec, PanelApi, PanelError, PanelStats};
use crate::services::notification_service::{MessageSink, NotificationService, Outbound};
use crate::services::payment_service::{PaymentDetails, PaymentService};
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;
use crate::services::user_service::UserService;

pub const CATALOG_JSON: &str = r#"{
    "tariffs": [
        {"id": "trial", "name": "Trial", "price": 0, "traffic_gb": 5, "duration_days": 3, "is_trial": true},
        {"id": "basic", "name": "Basic", "price": 100, "traffic_gb": 100, "duration_days": 30, "max_ips": 2},
        {"id": "unlim", "name": "Unlimited", "price": 300, "traffic_gb": 0, "duration_days": 30}
    ]
}"#;

pub const ADMIN: i64 = 1000;

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(i64, Outbound)>>,
    failing: HashSet<i64>,
}

impl RecordingSink {
    pub fn failing_for(chat_ids: &[i64]) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: chat_ids.iter().copied().collect(),
        }
    }

    pub fn messages(&self) -> Vec<(i64, Outbound)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn recipients(&self) -> Vec<i64> {
        self.messages().into_iter().map(|(id, _)| id).collect()
    }

    pub fn messages_to(&self, chat_id: i64) -> Vec<Outbound> {
        self.messages()
            .into_iter()
            .filter(|(id, _)| *id == chat_id)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, chat_id: i64, message: &Outbound) -> Result<()> {
        if self.failing.contains(&chat_id) {
            return Err(anyhow!("chat {} blocked the bot", chat_id));
        }
        self.sent.lock().unwrap().push((chat_id, message.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelCall {
    Ensure(AccountSpec),
    Disable(String),
    Usage(String),
}

/// Scripted panel. Accounts listed in `unreachable` fail with
/// `PanelError::Unreachable`; `down` makes every call fail that way.
#[derive(Default)]
pub struct FakePanel {
    calls: Mutex<Vec<PanelCall>>,
    unreachable: Mutex<HashSet<String>>,
    down: Mutex<bool>,
    usage: Mutex<HashMap<String, i64>>,
    gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl FakePanel {
    pub fn calls(&self) -> Vec<PanelCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ensure_calls(&self) -> Vec<AccountSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PanelCall::Ensure(spec) => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn disable_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PanelCall::Disable(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    /// Holds the next `ensure_account` until the returned sender fires.
    /// The receiver resolves once that call has arrived.
    pub fn pause_next_ensure(&self) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (reached_tx, reached_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some((reached_tx, resume_rx));
        (reached_rx, resume_tx)
    }

    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    pub fn set_unreachable(&self, username: &str) {
        self.unreachable.lock().unwrap().insert(username.to_string());
    }

    pub fn set_usage(&self, username: &str, bytes: i64) {
        self.usage.lock().unwrap().insert(username.to_string(), bytes);
    }

    fn fail_for(&self, username: &str) -> Option<PanelError> {
        let down = *self.down.lock().unwrap();
        if down || self.unreachable.lock().unwrap().contains(username) {
            Some(PanelError::Unreachable("connection refused".into()))
        } else {
            None
        }
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn ensure_account(&self, spec: &AccountSpec) -> Result<AccessDescriptor, PanelError> {
        let gate = self.gate.lock().unwrap().take();
        if let Some((reached, resume)) = gate {
            let _ = reached.send(());
            let _ = resume.await;
        }
        self.calls.lock().unwrap().push(PanelCall::Ensure(spec.clone()));
        if let Some(e) = self.fail_for(&spec.username) {
            return Err(e);
        }
        Ok(AccessDescriptor {
            username: spec.username.clone(),
            subscription_url: format!("https://panel.test/sub/{}", spec.username),
            links: vec![format!("vless://{}@panel.test:443", spec.username)],
        })
    }

    async fn disable_account(&self, username: &str) -> Result<(), PanelError> {
        self.calls.lock().unwrap().push(PanelCall::Disable(username.to_string()));
        match self.fail_for(username) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fetch_usage(&self, username: &str) -> Result<i64, PanelError> {
        self.calls.lock().unwrap().push(PanelCall::Usage(username.to_string()));
        if let Some(e) = self.fail_for(username) {
            return Err(e);
        }
        Ok(self.usage.lock().unwrap().get(username).copied().unwrap_or(0))
    }

    async fn system_stats(&self) -> Result<PanelStats, PanelError> {
        if *self.down.lock().unwrap() {
            return Err(PanelError::Unreachable("connection refused".into()));
        }
        Ok(PanelStats {
            version: Some("test".into()),
            total_users: 1,
            active_users: 1,
            incoming_bytes: 0,
            outgoing_bytes: 0,
        })
    }
}

/// Fully wired services over an in-memory store and fakes.
pub struct Harness {
    pub store: Store,
    pub catalog: Arc<TariffCatalog>,
    pub panel: Arc<FakePanel>,
    pub sink: Arc<RecordingSink>,
    pub notifier: NotificationService,
    pub subscriptions: SubscriptionService,
    pub referrals: ReferralService,
    pub payments: PaymentService,
    pub users: UserService,
}

pub const REF_BONUS_DAYS: i64 = 7;

impl Harness {
    pub async fn new() -> Self {
        Self::with_sink(RecordingSink::default()).await
    }

    pub async fn with_sink(sink: RecordingSink) -> Self {
        let store = Store::in_memory().await.unwrap();
        let catalog = Arc::new(TariffCatalog::from_json(CATALOG_JSON).unwrap());
        let panel = Arc::new(FakePanel::default());
        let sink = Arc::new(sink);
        let notifier = NotificationService::new(sink.clone(), vec![ADMIN])
            .with_pace(std::time::Duration::ZERO);

        let subscriptions =
            SubscriptionService::new(store.clone(), catalog.clone(), panel.clone());
        let referrals = ReferralService::new(
            store.clone(),
            subscriptions.clone(),
            notifier.clone(),
            REF_BONUS_DAYS,
        );
        let payments = PaymentService::new(
            store.clone(),
            catalog.clone(),
            subscriptions.clone(),
            referrals.clone(),
            notifier.clone(),
            PaymentDetails {
                card_number: "2200 0000 0000 0000".into(),
                card_holder: "IVAN I.".into(),
                currency: "₽".into(),
            },
        );
        let users = UserService::new(
            store.clone(),
            panel.clone(),
            subscriptions.clone(),
            referrals.clone(),
            notifier.clone(),
        );

        Self {
            store,
            catalog,
            panel,
            sink,
            notifier,
            subscriptions,
            referrals,
            payments,
            users,
        }
    }

    pub async fn user(&self, id: i64) -> marzshop_db::models::User {
        self.users
            .register(id, Some(&format!("user{}", id)), None, None)
            .await
            .unwrap()
            .user
    }

    pub async fn user_with_subscription(
        &self,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> marzshop_db::models::Subscription {
        let user = self.user(id).await;
        self.store
            .subscriptions
            .insert(
                self.store.pool(),
                &marzshop_db::models::NewSubscription {
                    user_id: id,
                    tariff_id: "basic".into(),
                    is_trial: false,
                    started_at: expires_at - chrono::Duration::days(30),
                    expires_at,
                    traffic_limit_bytes: 100 * 1024 * 1024 * 1024,
                    panel_username: user.panel_username,
                    subscription_url: None,
                },
                expires_at - chrono::Duration::days(30),
            )
            .await
            .unwrap()
    }
}
