use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, KeyboardButton, KeyboardMarkup};

use crate::catalog::{Tariff, TariffCatalog};
use crate::models::callback::{AdminCallback, Callback};

pub const BTN_MY_VPN: &str = "🔑 My VPN";
pub const BTN_TARIFFS: &str = "💰 Tariffs";
pub const BTN_STATUS: &str = "📊 Status";
pub const BTN_REFERRALS: &str = "🎁 Referrals";
pub const BTN_PROFILE: &str = "👤 Profile";
pub const BTN_HELP: &str = "❓ Help";

fn button(label: impl Into<String>, cb: Callback) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label.into(), cb.to_string())
}

fn admin(label: &str, cb: AdminCallback) -> InlineKeyboardButton {
    button(label, Callback::Admin(cb))
}

pub fn main_menu() -> KeyboardMarkup {
    KeyboardMarkup::new(vec![
        vec![KeyboardButton::new(BTN_MY_VPN), KeyboardButton::new(BTN_TARIFFS)],
        vec![KeyboardButton::new(BTN_STATUS), KeyboardButton::new(BTN_REFERRALS)],
        vec![KeyboardButton::new(BTN_PROFILE), KeyboardButton::new(BTN_HELP)],
    ])
    .resize_keyboard()
}

pub fn tariffs(catalog: &TariffCatalog) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = catalog
        .all()
        .iter()
        .map(|t| {
            let cb = if t.is_trial {
                Callback::Trial
            } else {
                Callback::Tariff(t.id.clone())
            };
            vec![button(format!("📦 {}", t.name), cb)]
        })
        .collect();
    rows.push(vec![button("⬅️ Back", Callback::MainMenu)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn tariff(t: &Tariff) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("💳 Buy", Callback::Pay(t.id.clone()))],
        vec![button("⬅️ Tariffs", Callback::Tariffs)],
    ])
}

pub fn payment(payment_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("✅ I have paid", Callback::ConfirmPayment(payment_id))],
        vec![button("❌ Cancel", Callback::CancelPayment(payment_id))],
    ])
}

pub fn no_subscription() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![button("🎁 Free trial", Callback::Trial)],
        vec![button("💰 Tariffs", Callback::Tariffs)],
    ])
}

pub fn renew() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("💰 Renew", Callback::Tariffs)]])
}

pub fn admin_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![admin("📈 Statistics", AdminCallback::Stats)],
        vec![admin("💰 Payments to review", AdminCallback::Payments)],
        vec![admin("🔍 Find user", AdminCallback::Search)],
        vec![admin("📢 Broadcast", AdminCallback::Broadcast)],
    ])
}

pub fn admin_back() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![admin("⬅️ Admin menu", AdminCallback::Menu)]])
}

pub fn admin_payments(ids: &[i64]) -> InlineKeyboardMarkup {
    let mut rows: Vec<Vec<InlineKeyboardButton>> = ids
        .iter()
        .map(|id| vec![admin(&format!("Payment #{}", id), AdminCallback::Payment(*id))])
        .collect();
    rows.push(vec![admin("⬅️ Admin menu", AdminCallback::Menu)]);
    InlineKeyboardMarkup::new(rows)
}

pub fn admin_decision(payment_id: i64) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![
        vec![
            admin("✅ Approve", AdminCallback::Approve(payment_id)),
            admin("❌ Reject", AdminCallback::Reject(payment_id)),
        ],
        vec![admin("⬅️ Payments", AdminCallback::Payments)],
    ])
}

pub fn admin_users(users: &[(i64, String)]) -> InlineKeyboardMarkup {
    let rows = users
        .iter()
        .map(|(id, name)| vec![admin(&format!("👤 {}", name), AdminCallback::User(*id))])
        .collect::<Vec<_>>();
    InlineKeyboardMarkup::new(rows)
}

pub fn admin_user(user_id: i64, is_banned: bool) -> InlineKeyboardMarkup {
    let toggle = if is_banned {
        admin("✅ Unban", AdminCallback::Unban(user_id))
    } else {
        admin("🚫 Ban", AdminCallback::Ban(user_id))
    };
    InlineKeyboardMarkup::new(vec![vec![toggle], vec![admin("⬅️ Admin menu", AdminCallback::Menu)]])
}
