//! Screens shared by reply-keyboard messages and inline buttons.

use marzshop_db::utc_now;
use teloxide::types::InlineKeyboardMarkup;

use crate::bot::keyboards;
use crate::errors::{WorkflowError, WorkflowResult};
use crate::services::notification_service::escape_html;
use crate::state::AppState;
use crate::texts;

const PAYMENTS_PAGE: i64 = 20;

pub struct Screen {
    pub text: String,
    pub keyboard: Option<InlineKeyboardMarkup>,
}

impl Screen {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: None,
        }
    }

    pub fn with_keyboard(mut self, kb: InlineKeyboardMarkup) -> Self {
        self.keyboard = Some(kb);
        self
    }
}

pub async fn my_vpn(state: &AppState, user_id: i64) -> WorkflowResult<Screen> {
    let now = utc_now();
    let (sub, tariff) = state.subscriptions.status(user_id).await?;
    match sub {
        Some(sub) if sub.is_live(now) => {
            let mut text = texts::status(Some(&sub), tariff.as_ref().map(|t| t.name.as_str()), now);
            if let Some(url) = &sub.subscription_url {
                text.push_str(&format!(
                    "\n\n🔗 Subscription link (import it into your VPN client):\n<code>{}</code>",
                    escape_html(url)
                ));
            }
            Ok(Screen::new(text).with_keyboard(keyboards::renew()))
        }
        _ => Ok(Screen::new(
            "🔑 You have no active VPN subscription.\n\nTry it for free or pick a tariff.",
        )
        .with_keyboard(keyboards::no_subscription())),
    }
}

pub async fn status(state: &AppState, user_id: i64) -> WorkflowResult<Screen> {
    let (sub, tariff) = state.subscriptions.status(user_id).await?;
    let text = texts::status(sub.as_ref(), tariff.as_ref().map(|t| t.name.as_str()), utc_now());
    let screen = Screen::new(text);
    Ok(match sub {
        Some(_) => screen.with_keyboard(keyboards::renew()),
        None => screen.with_keyboard(keyboards::no_subscription()),
    })
}

pub fn tariffs(state: &AppState) -> Screen {
    Screen::new(texts::tariff_list(&state.catalog, state.currency()))
        .with_keyboard(keyboards::tariffs(&state.catalog))
}

pub fn tariff(state: &AppState, tariff_id: &str) -> WorkflowResult<Screen> {
    let tariff = state
        .catalog
        .get(tariff_id)
        .filter(|t| !t.is_trial)
        .ok_or_else(|| WorkflowError::InvalidTariff(tariff_id.to_string()))?;
    Ok(Screen::new(texts::tariff_card(tariff, state.currency())).with_keyboard(keyboards::tariff(tariff)))
}

pub async fn payment_request(state: &AppState, user_id: i64, tariff_id: &str) -> WorkflowResult<Screen> {
    let request = state.payments.request(user_id, tariff_id).await?;
    let details = state.payments.details();
    Ok(Screen::new(texts::payment_instructions(
        &request.payment,
        &request.tariff,
        &details.card_number,
        &details.card_holder,
        &details.currency,
    ))
    .with_keyboard(keyboards::payment(request.payment.id)))
}

pub async fn referrals(state: &AppState, user_id: i64) -> WorkflowResult<Screen> {
    let (invited, earned) = state.referrals.stats(user_id).await?;
    Ok(Screen::new(texts::referral_info(
        &state.referral_link(user_id),
        invited,
        earned,
        state.referrals.bonus_days(),
    )))
}

pub async fn profile(state: &AppState, user_id: i64) -> WorkflowResult<Screen> {
    let user = state
        .users
        .get(user_id)
        .await?
        .ok_or(WorkflowError::UnknownUser(user_id))?;
    let (sub, _) = state.subscriptions.status(user_id).await?;
    let (invited, _) = state.referrals.stats(user_id).await?;
    Ok(Screen::new(texts::profile(&user, sub.as_ref(), invited, utc_now())))
}

pub fn help(state: &AppState) -> Screen {
    Screen::new(texts::help(
        state.contacts.support_url.as_deref(),
        state.contacts.channel.as_deref(),
        state.contacts.site.as_deref(),
    ))
}

pub fn admin_menu() -> Screen {
    Screen::new("🛠 <b>Admin panel</b>").with_keyboard(keyboards::admin_menu())
}

pub async fn statistics(state: &AppState) -> WorkflowResult<Screen> {
    let stats = state.users.statistics().await?;
    Ok(Screen::new(texts::statistics(&stats)).with_keyboard(keyboards::admin_back()))
}

pub async fn pending_payments(state: &AppState) -> WorkflowResult<Screen> {
    let pending = state.payments.pending(PAYMENTS_PAGE).await?;
    if pending.is_empty() {
        return Ok(Screen::new("✅ No payments are waiting for review.").with_keyboard(keyboards::admin_back()));
    }
    let mut text = String::from("💰 <b>Payments to review</b>\n");
    for p in &pending {
        text.push_str(&format!(
            "\n#{}: user <code>{}</code>, {} {} {}",
            p.id,
            p.user_id,
            escape_html(&p.tariff_id),
            p.amount,
            escape_html(state.currency())
        ));
    }
    let ids: Vec<i64> = pending.iter().map(|p| p.id).collect();
    Ok(Screen::new(text).with_keyboard(keyboards::admin_payments(&ids)))
}

pub async fn payment_card(state: &AppState, payment_id: i64) -> WorkflowResult<Screen> {
    let payment = state
        .payments
        .get(payment_id)
        .await?
        .ok_or_else(|| WorkflowError::NotFound(format!("Payment #{}", payment_id)))?;
    let user = state
        .users
        .get(payment.user_id)
        .await?
        .ok_or(WorkflowError::UnknownUser(payment.user_id))?;
    let tariff_name = state
        .catalog
        .get(&payment.tariff_id)
        .map(|t| t.name.clone())
        .unwrap_or_else(|| payment.tariff_id.clone());
    let screen = Screen::new(texts::admin_payment_card(&payment, &tariff_name, &user, state.currency()));
    Ok(if payment.status.is_decided() {
        screen.with_keyboard(keyboards::admin_back())
    } else {
        screen.with_keyboard(keyboards::admin_decision(payment.id))
    })
}

pub async fn user_card(state: &AppState, user_id: i64) -> WorkflowResult<Screen> {
    let user = state
        .users
        .get(user_id)
        .await?
        .ok_or(WorkflowError::UnknownUser(user_id))?;
    let (sub, _) = state.subscriptions.status(user_id).await?;
    Ok(Screen::new(texts::user_card(&user, sub.as_ref(), utc_now()))
        .with_keyboard(keyboards::admin_user(user.id, user.is_banned)))
}

pub async fn search_results(state: &AppState, query: &str) -> WorkflowResult<Screen> {
    let found = state.users.search_user(query).await?;
    match found.as_slice() {
        [] => Ok(Screen::new(format!("🔍 Nobody matches <code>{}</code>.", escape_html(query)))
            .with_keyboard(keyboards::admin_back())),
        [only] => user_card(state, only.id).await,
        many => {
            let entries: Vec<(i64, String)> = many.iter().map(|u| (u.id, u.display_name())).collect();
            Ok(Screen::new(format!("🔍 Found {} users:", many.len()))
                .with_keyboard(keyboards::admin_users(&entries)))
        }
    }
}
