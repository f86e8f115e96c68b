use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, MessageId, ParseMode};
use tracing::{info, warn};

use crate::bot::handlers::command::{prompt, send_screen, BROADCAST_PROMPT, SEARCH_PROMPT};
use crate::bot::keyboards::{self, main_menu};
use crate::bot::views::{self, Screen};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::models::callback::{AdminCallback, Callback};
use crate::services::payment_service::Decision;
use crate::state::AppState;
use crate::texts;
use crate::utils::format_date;

/// What to do with the message the button belongs to.
enum Reaction {
    /// Replace the message in place.
    Show(Screen),
    /// Leave it and send a new one.
    Send(Screen),
    Prompt(&'static str),
    /// Popup on the button press only; the message stays as it is.
    Alert(String),
    MainMenu,
}

pub async fn callback_handler(bot: Bot, q: CallbackQuery, state: AppState) -> Result<(), teloxide::RequestError> {
    let user_id = q.from.id.0 as i64;
    let Some(data) = q.data.as_deref() else {
        bot.answer_callback_query(q.id.clone()).await?;
        return Ok(());
    };

    let callback: Callback = match data.parse() {
        Ok(cb) => cb,
        Err(e) => {
            warn!("{}", e);
            bot.answer_callback_query(q.id.clone())
                .text("This button is outdated.")
                .await?;
            return Ok(());
        }
    };
    info!(user_id, callback = %callback, "Callback received");

    let reaction = match guard(&state, user_id, &callback).await {
        Ok(()) => react(&state, user_id, callback).await,
        Err(e) => Err(e),
    };

    let (chat_id, message_id) = match &q.message {
        Some(m) => (m.chat().id, Some(m.id())),
        None => (ChatId(user_id), None),
    };

    match reaction {
        Ok(Reaction::Alert(text)) => {
            bot.answer_callback_query(q.id.clone())
                .text(text)
                .show_alert(true)
                .await?;
        }
        Ok(other) => {
            bot.answer_callback_query(q.id.clone()).await?;
            render(&bot, chat_id, message_id, &state, other).await?;
        }
        Err(e) => {
            warn!(user_id, "Callback failed: {}", e);
            bot.answer_callback_query(q.id.clone())
                .text(e.user_message())
                .show_alert(true)
                .await?;
        }
    }
    Ok(())
}

async fn guard(state: &AppState, user_id: i64, callback: &Callback) -> WorkflowResult<()> {
    let is_admin = state.notifier.is_admin(user_id);
    if let Callback::Admin(_) = callback {
        return if is_admin {
            Ok(())
        } else {
            Err(WorkflowError::NotFound("Action".into()))
        };
    }
    let user = state
        .users
        .get(user_id)
        .await?
        .ok_or(WorkflowError::UnknownUser(user_id))?;
    if user.is_banned && !is_admin {
        return Err(WorkflowError::UserBanned(user_id));
    }
    Ok(())
}

async fn react(state: &AppState, user_id: i64, callback: Callback) -> WorkflowResult<Reaction> {
    let reaction = match callback {
        Callback::MainMenu => Reaction::MainMenu,
        Callback::Tariffs => Reaction::Show(views::tariffs(state)),
        Callback::Tariff(id) => Reaction::Show(views::tariff(state, &id)?),
        Callback::Pay(id) => Reaction::Show(views::payment_request(state, user_id, &id).await?),
        Callback::Trial => {
            let activation = state.subscriptions.activate_trial(user_id).await?;
            Reaction::Show(Screen::new(texts::trial_activated(
                &activation.subscription,
                &activation.access,
            )))
        }
        Callback::ConfirmPayment(id) => {
            let payment = state.payments.confirm(id, user_id).await?;
            Reaction::Show(Screen::new(texts::payment_submitted(payment.id)))
        }
        Callback::CancelPayment(id) => {
            state.payments.cancel(id, user_id).await?;
            Reaction::Show(Screen::new(format!("Payment #{} was cancelled.", id)).with_keyboard(keyboards::renew()))
        }
        Callback::Link => Reaction::Send(views::my_vpn(state, user_id).await?),
        Callback::Status => Reaction::Send(views::status(state, user_id).await?),
        Callback::Referrals => Reaction::Send(views::referrals(state, user_id).await?),
        Callback::Profile => Reaction::Send(views::profile(state, user_id).await?),
        Callback::Help => Reaction::Send(views::help(state)),
        Callback::Admin(action) => react_admin(state, user_id, action).await?,
    };
    Ok(reaction)
}

async fn react_admin(state: &AppState, admin_id: i64, action: AdminCallback) -> WorkflowResult<Reaction> {
    let reaction = match action {
        AdminCallback::Menu => Reaction::Show(views::admin_menu()),
        AdminCallback::Stats => Reaction::Show(views::statistics(state).await?),
        AdminCallback::Payments => Reaction::Show(views::pending_payments(state).await?),
        AdminCallback::Payment(id) => Reaction::Show(views::payment_card(state, id).await?),
        AdminCallback::Approve(id) | AdminCallback::Reject(id) => {
            let approve = matches!(action, AdminCallback::Approve(_));
            let decision = match state.payments.decide(id, admin_id, approve).await {
                Ok(d) => d,
                Err(WorkflowError::UserBanned(user_id)) => {
                    return Ok(Reaction::Alert(format!(
                        "🚫 User {} is banned.\nPayment #{} stays pending: unban the user or reject it.",
                        user_id, id
                    )))
                }
                Err(e @ WorkflowError::Panel(_)) => {
                    return Ok(Reaction::Alert(format!(
                        "{}\nPayment #{} stays pending, press Approve again to retry.",
                        e.user_message(),
                        id
                    )))
                }
                Err(e) => return Err(e),
            };
            let mut screen = views::payment_card(state, id).await?;
            match decision {
                Decision::Approved { subscription, .. } => screen.text.push_str(&format!(
                    "\n\n✅ Approved by <code>{}</code>, access until {}",
                    admin_id,
                    format_date(subscription.expires_at)
                )),
                Decision::Rejected { .. } => {
                    screen.text.push_str(&format!("\n\n❌ Rejected by <code>{}</code>", admin_id))
                }
            }
            Reaction::Show(screen)
        }
        AdminCallback::Search => Reaction::Prompt(SEARCH_PROMPT),
        AdminCallback::User(id) => Reaction::Show(views::user_card(state, id).await?),
        AdminCallback::Ban(id) => {
            state.users.ban_user(id).await?;
            Reaction::Show(views::user_card(state, id).await?)
        }
        AdminCallback::Unban(id) => {
            state.users.unban_user(id).await?;
            Reaction::Show(views::user_card(state, id).await?)
        }
        AdminCallback::Broadcast => Reaction::Prompt(BROADCAST_PROMPT),
    };
    Ok(reaction)
}

async fn render(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    state: &AppState,
    reaction: Reaction,
) -> Result<(), teloxide::RequestError> {
    match reaction {
        Reaction::Show(screen) => match message_id {
            Some(id) => edit_or_send(bot, chat_id, id, screen).await,
            None => send_screen(bot, chat_id, screen).await,
        },
        Reaction::Send(screen) => send_screen(bot, chat_id, screen).await,
        Reaction::Prompt(text) => prompt(bot, chat_id, text).await,
        Reaction::MainMenu => {
            let name = state
                .users
                .get(chat_id.0)
                .await
                .ok()
                .flatten()
                .map(|u| u.display_name())
                .unwrap_or_default();
            bot.send_message(chat_id, texts::welcome(&name, false))
                .parse_mode(ParseMode::Html)
                .reply_markup(main_menu())
                .await?;
            Ok(())
        }
        Reaction::Alert(_) => Ok(()),
    }
}

async fn edit_or_send(
    bot: &Bot,
    chat_id: ChatId,
    message_id: MessageId,
    screen: Screen,
) -> Result<(), teloxide::RequestError> {
    let req = bot
        .edit_message_text(chat_id, message_id, screen.text.clone())
        .parse_mode(ParseMode::Html);
    let edited = match screen.keyboard.clone() {
        Some(kb) => req.reply_markup(kb).await,
        None => req.await,
    };
    if let Err(e) = edited {
        warn!("Edit failed, sending a new message: {}", e);
        send_screen(bot, chat_id, screen).await?;
    }
    Ok(())
}
