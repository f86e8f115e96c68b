//! Chat copy. Everything here is Telegram HTML.

use chrono::{DateTime, Utc};
use marzshop_db::models::{Payment, Subscription, User};

use crate::catalog::{Tariff, TariffCatalog};
use crate::models::callback::{AdminCallback, Callback};
use crate::panel::AccessDescriptor;
use crate::services::notification_service::{escape_html, DeliveryReport, Outbound};
use crate::services::user_service::Statistics;
use crate::utils::{format_bytes_str, format_date, format_quota, format_remaining, usage_pct};

pub fn welcome(name: &str, is_new: bool) -> String {
    if is_new {
        format!(
            "👋 Hi, <b>{}</b>!\n\n\
             🔐 Fast and reliable VPN for all your devices.\n\
             ⚡ Instant activation after payment.\n\n\
             Press <b>🔑 My VPN</b> to get started.",
            escape_html(name)
        )
    } else {
        format!(
            "👋 Welcome back, <b>{}</b>!\n\nChoose an action from the menu.",
            escape_html(name)
        )
    }
}

pub fn help(support_url: Option<&str>, channel: Option<&str>, site: Option<&str>) -> String {
    let mut text = String::from(
        "❓ <b>Help</b>\n\n\
         1. Pick a tariff in <b>💰 Tariffs</b> and pay by card transfer.\n\
         2. Press <b>I have paid</b>; an admin checks the transfer.\n\
         3. Import the subscription link into your VPN client.\n",
    );
    if let Some(url) = support_url {
        text.push_str(&format!("\n💬 Support: {}", escape_html(url)));
    }
    if let Some(ch) = channel {
        text.push_str(&format!("\n📢 Channel: {}", escape_html(ch)));
    }
    if let Some(site) = site {
        text.push_str(&format!("\n🌐 Site: {}", escape_html(site)));
    }
    text
}

pub fn tariff_line(t: &Tariff, currency: &str) -> String {
    let price = if t.price == 0 {
        "free".to_string()
    } else {
        format!("{} {}", t.price, currency)
    };
    format!(
        "• <b>{}</b>: {}, {} days, {}",
        escape_html(&t.name),
        price,
        t.duration_days,
        format_quota(t.quota_bytes())
    )
}

pub fn tariff_list(catalog: &TariffCatalog, currency: &str) -> String {
    let mut text = String::from("💰 <b>Tariffs</b>\n\n");
    for t in catalog.all() {
        text.push_str(&tariff_line(t, currency));
        text.push('\n');
    }
    text.push_str("\nSelect a tariff below.");
    text
}

pub fn tariff_card(t: &Tariff, currency: &str) -> String {
    let mut text = format!(
        "📦 <b>{}</b>\n\n\
         💵 Price: {}\n\
         ⏳ Duration: {} days\n\
         📊 Traffic: {}\n\
         📱 Devices: {}",
        escape_html(&t.name),
        if t.price == 0 { "free".to_string() } else { format!("{} {}", t.price, currency) },
        t.duration_days,
        format_quota(t.quota_bytes()),
        t.max_ips
    );
    if let Some(loc) = &t.location {
        text.push_str(&format!("\n🌍 Location: {}", escape_html(loc)));
    }
    text
}

pub fn payment_instructions(
    payment: &Payment,
    tariff: &Tariff,
    card_number: &str,
    card_holder: &str,
    currency: &str,
) -> String {
    format!(
        "💳 <b>Payment #{}</b>\n\n\
         Tariff: <b>{}</b>\n\
         Amount: <b>{} {}</b>\n\n\
         Transfer the amount to the card:\n\
         <code>{}</code>\n\
         Holder: {}\n\n\
         ⚠️ Put this code into the transfer comment: <code>{}</code>\n\n\
         After the transfer press <b>✅ I have paid</b>.",
        payment.id,
        escape_html(&tariff.name),
        payment.amount,
        currency,
        escape_html(card_number),
        escape_html(card_holder),
        escape_html(&payment.comment)
    )
}

pub fn payment_submitted(payment_id: i64) -> String {
    format!(
        "⏳ Payment #{} was sent for review.\n\nYou will get a message as soon as an admin confirms it.",
        payment_id
    )
}

pub fn admin_new_payment(payment: &Payment, tariff_name: &str, user: &User, currency: &str) -> Outbound {
    Outbound::text(admin_payment_card(payment, tariff_name, user, currency))
        .with_button("✅ Approve", Callback::Admin(AdminCallback::Approve(payment.id)))
        .with_button("❌ Reject", Callback::Admin(AdminCallback::Reject(payment.id)))
}

pub fn admin_payment_card(payment: &Payment, tariff_name: &str, user: &User, currency: &str) -> String {
    format!(
        "💰 <b>Payment #{}</b> ({})\n\n\
         👤 User: {} (<code>{}</code>)\n\
         📦 Tariff: {}\n\
         💵 Amount: {} {}\n\
         💬 Comment: <code>{}</code>\n\
         🕒 Created: {}",
        payment.id,
        payment.status.as_str(),
        escape_html(&user.display_name()),
        user.id,
        escape_html(tariff_name),
        payment.amount,
        currency,
        escape_html(&payment.comment),
        format_date(payment.created_at)
    )
}

const MAX_DIRECT_LINKS: usize = 3;

/// Per-protocol configs for clients that cannot import a subscription URL.
fn direct_links(links: &[String]) -> String {
    if links.is_empty() {
        return String::new();
    }
    let mut text = String::from("\n\n🔌 Or add a config directly:");
    for link in links.iter().take(MAX_DIRECT_LINKS) {
        text.push_str(&format!("\n<code>{}</code>", escape_html(link)));
    }
    text
}

pub fn payment_approved(tariff: &Tariff, sub: &Subscription, access: &AccessDescriptor) -> Outbound {
    Outbound::text(format!(
        "✅ <b>Payment approved!</b>\n\n\
         📦 Tariff: {}\n\
         ⏳ Valid until: {}\n\
         📊 Traffic: {}{}\n\n\
         🔗 Your subscription link:",
        escape_html(&tariff.name),
        format_date(sub.expires_at),
        format_quota(sub.traffic_limit_bytes),
        direct_links(&access.links)
    ))
    .with_link(access.subscription_url.clone())
}

pub fn payment_rejected(payment_id: i64) -> Outbound {
    Outbound::text(format!(
        "❌ Payment #{} was rejected.\n\nIf you believe this is a mistake, contact support.",
        payment_id
    ))
}

pub fn trial_activated(sub: &Subscription, access: &AccessDescriptor) -> String {
    format!(
        "🎁 <b>Trial activated!</b>\n\n\
         ⏳ Valid until: {}\n\
         📊 Traffic: {}\n\n\
         🔗 Your subscription link:\n<code>{}</code>{}",
        format_date(sub.expires_at),
        format_quota(sub.traffic_limit_bytes),
        escape_html(&access.subscription_url),
        direct_links(&access.links)
    )
}

pub fn status(sub: Option<&Subscription>, tariff_name: Option<&str>, now: DateTime<Utc>) -> String {
    let Some(sub) = sub else {
        return "📊 <b>Status</b>\n\nYou have no subscription yet. Open <b>💰 Tariffs</b> to buy one.".into();
    };

    let mut text = String::from("📊 <b>Status</b>\n\n");
    if sub.is_live(now) {
        text.push_str(&format!(
            "✅ Active{}\n⏳ Until {} ({} left)\n",
            if sub.is_trial { " (trial)" } else { "" },
            format_date(sub.expires_at),
            format_remaining(sub.expires_at - now)
        ));
    } else {
        text.push_str(&format!("❌ Expired on {}\n", format_date(sub.expires_at)));
    }
    if let Some(name) = tariff_name {
        text.push_str(&format!("📦 Tariff: {}\n", escape_html(name)));
    }
    text.push_str(&format!(
        "📊 Traffic: {} / {}",
        format_bytes_str(sub.traffic_used_bytes.max(0) as u64),
        format_quota(sub.traffic_limit_bytes)
    ));
    if let Some(pct) = usage_pct(sub.traffic_used_bytes, sub.traffic_limit_bytes) {
        text.push_str(&format!(" ({:.0}%)", pct));
    }
    if let Some(synced) = sub.traffic_synced_at {
        text.push_str(&format!("\n🔄 Updated {}", format_date(synced)));
    }
    text
}

pub fn subscription_expired() -> Outbound {
    Outbound::text("⌛ Your VPN subscription has expired and access was disabled.\n\nRenew it to keep using the VPN.")
        .with_button("💰 Tariffs", Callback::Tariffs)
}

pub fn expiry_reminder(sub: &Subscription, now: DateTime<Utc>) -> Outbound {
    let mut text = format!(
        "⏰ Your VPN subscription expires in <b>{}</b> ({}).",
        format_remaining(sub.expires_at - now),
        format_date(sub.expires_at)
    );
    if let Some(left) = sub.remaining_bytes() {
        text.push_str(&format!("\n📊 Traffic left: {}", format_bytes_str(left as u64)));
    }
    text.push_str("\n\nRenew now to stay connected.");
    Outbound::text(text).with_button("💰 Renew", Callback::Tariffs)
}

pub fn referral_registered(name: &str) -> Outbound {
    Outbound::text(format!(
        "🎉 {} joined with your referral link!\nYou will get bonus days when they buy a subscription.",
        escape_html(name)
    ))
}

pub fn referral_extended(days: i64, until: DateTime<Utc>) -> Outbound {
    Outbound::text(format!(
        "🎁 Your friend bought a subscription! +{} days added, now valid until {}.",
        days,
        format_date(until)
    ))
}

pub fn referral_banked(days: i64) -> Outbound {
    Outbound::text(format!(
        "🎁 Your friend bought a subscription! +{} bonus days will be added to your next subscription.",
        days
    ))
}

pub fn referral_info(link: &str, invited: i64, earned_days: i64, bonus_days: i64) -> String {
    format!(
        "👥 <b>Referral program</b>\n\n\
         🎁 +{} days for every friend who buys a subscription.\n\n\
         Invited: {}\n\
         Bonus days earned: {}\n\n\
         Your link:\n<code>{}</code>",
        bonus_days,
        invited,
        earned_days,
        escape_html(link)
    )
}

pub fn profile(user: &User, sub: Option<&Subscription>, invited: i64, now: DateTime<Utc>) -> String {
    let mut text = format!(
        "👤 <b>Profile</b>\n\n\
         ID: <code>{}</code>\n\
         Name: {}\n\
         Member since: {}\n\
         Invited friends: {}",
        user.id,
        escape_html(&user.display_name()),
        format_date(user.created_at),
        invited
    );
    if user.bonus_days_banked > 0 {
        text.push_str(&format!("\nBanked bonus days: {}", user.bonus_days_banked));
    }
    match sub {
        Some(s) if s.is_live(now) => {
            text.push_str(&format!("\nSubscription: active until {}", format_date(s.expires_at)))
        }
        _ => text.push_str("\nSubscription: none"),
    }
    text
}

pub fn statistics(stats: &Statistics) -> String {
    let mut text = format!(
        "📈 <b>Statistics</b>\n\n\
         👥 Users: {}\n\
         🚫 Banned: {}\n\
         ✅ Active subscriptions: {}\n\
         ⏳ Payments awaiting review: {}",
        stats.users, stats.banned, stats.active_subscriptions, stats.pending_payments
    );
    match &stats.panel {
        Some(p) => text.push_str(&format!(
            "\n\n🖥 <b>Panel</b>{}\n\
             Accounts: {} (active {})\n\
             Traffic: ↓ {} / ↑ {}",
            p.version
                .as_deref()
                .map(|v| format!(" v{}", escape_html(v)))
                .unwrap_or_default(),
            p.total_users,
            p.active_users,
            format_bytes_str(p.incoming_bytes.max(0) as u64),
            format_bytes_str(p.outgoing_bytes.max(0) as u64)
        )),
        None => text.push_str("\n\n🖥 Panel: unavailable"),
    }
    text
}

pub fn user_card(user: &User, sub: Option<&Subscription>, now: DateTime<Utc>) -> String {
    let mut text = format!(
        "👤 <b>{}</b>\n\n\
         ID: <code>{}</code>\n\
         Panel account: <code>{}</code>\n\
         Registered: {}\n\
         Banned: {}\n\
         Trial used: {}",
        escape_html(&user.display_name()),
        user.id,
        escape_html(&user.panel_username),
        format_date(user.created_at),
        if user.is_banned { "yes" } else { "no" },
        if user.trial_used { "yes" } else { "no" }
    );
    if let Some(r) = user.referred_by {
        text.push_str(&format!("\nReferred by: <code>{}</code>", r));
    }
    text.push_str("\n\n");
    text.push_str(&status(sub, sub.map(|s| s.tariff_id.as_str()), now));
    text
}

pub fn broadcast_report(report: &DeliveryReport) -> String {
    format!(
        "📢 Broadcast finished.\n\n✅ Delivered: {}\n❌ Failed: {}",
        report.sent, report.failed
    )
}
