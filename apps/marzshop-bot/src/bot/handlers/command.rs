use teloxide::prelude::*;
use teloxide::types::{ForceReply, ParseMode};
use tracing::{error, info, warn};

use crate::bot::keyboards::{self, main_menu};
use crate::bot::views::{self, Screen};
use crate::errors::WorkflowResult;
use crate::state::AppState;
use crate::texts;

/// Prompts sent with `ForceReply`; the admin's reply is matched by prefix.
pub const SEARCH_PROMPT: &str = "🔍 Reply with a Telegram id, @username or name.";
pub const BROADCAST_PROMPT: &str = "📢 Reply with the text to send to every user.";

/// `/cmd@bot rest` -> (`/cmd`, `rest`). Menu button labels come back whole.
pub fn split_command(text: &str) -> (&str, &str) {
    let text = text.trim();
    if !text.starts_with('/') {
        return (text, "");
    }
    let (head, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let head = head.split_once('@').map(|(c, _)| c).unwrap_or(head);
    (head, rest.trim())
}

pub async fn send_screen(bot: &Bot, chat_id: ChatId, screen: Screen) -> Result<(), teloxide::RequestError> {
    let req = bot.send_message(chat_id, screen.text).parse_mode(ParseMode::Html);
    match screen.keyboard {
        Some(kb) => req.reply_markup(kb).await?,
        None => req.await?,
    };
    Ok(())
}

async fn reply(bot: &Bot, chat_id: ChatId, result: WorkflowResult<Screen>) -> Result<(), teloxide::RequestError> {
    match result {
        Ok(screen) => send_screen(bot, chat_id, screen).await,
        Err(e) => {
            warn!("Request failed for chat {}: {}", chat_id, e);
            bot.send_message(chat_id, e.user_message()).await?;
            Ok(())
        }
    }
}

pub async fn message_handler(bot: Bot, msg: Message, state: AppState) -> Result<(), teloxide::RequestError> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let user_id = from.id.0 as i64;
    let chat_id = msg.chat.id;
    let (command, arg) = split_command(text);

    let payload = (command == "/start" && !arg.is_empty()).then_some(arg);
    let full_name = from.full_name();
    let registration = match state
        .users
        .register(user_id, from.username.as_deref(), Some(full_name.as_str()), payload)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to register user {}: {}", user_id, e);
            bot.send_message(chat_id, e.user_message()).await?;
            return Ok(());
        }
    };

    let is_admin = state.notifier.is_admin(user_id);
    if registration.user.is_banned && !is_admin {
        bot.send_message(chat_id, "🚫 Your account has been banned.").await?;
        return Ok(());
    }

    if is_admin {
        if let Some(asked) = msg.reply_to_message().and_then(|m| m.text()) {
            if asked.starts_with(SEARCH_PROMPT) {
                return reply(&bot, chat_id, views::search_results(&state, text).await).await;
            }
            if asked.starts_with(BROADCAST_PROMPT) {
                return broadcast(&bot, chat_id, &state, text).await;
            }
        }
    }

    match command {
        "/start" => {
            let name = registration.user.display_name();
            bot.send_message(chat_id, texts::welcome(&name, registration.created))
                .parse_mode(ParseMode::Html)
                .reply_markup(main_menu())
                .await?;
        }
        keyboards::BTN_MY_VPN | "/vpn" => reply(&bot, chat_id, views::my_vpn(&state, user_id).await).await?,
        keyboards::BTN_TARIFFS | "/tariffs" => send_screen(&bot, chat_id, views::tariffs(&state)).await?,
        keyboards::BTN_STATUS | "/status" => reply(&bot, chat_id, views::status(&state, user_id).await).await?,
        keyboards::BTN_REFERRALS | "/referrals" => {
            reply(&bot, chat_id, views::referrals(&state, user_id).await).await?
        }
        keyboards::BTN_PROFILE | "/profile" => reply(&bot, chat_id, views::profile(&state, user_id).await).await?,
        keyboards::BTN_HELP | "/help" => send_screen(&bot, chat_id, views::help(&state)).await?,

        "/admin" if is_admin => send_screen(&bot, chat_id, views::admin_menu()).await?,
        "/payments" if is_admin => reply(&bot, chat_id, views::pending_payments(&state).await).await?,
        "/stats" if is_admin => reply(&bot, chat_id, views::statistics(&state).await).await?,
        "/find" if is_admin => {
            if arg.is_empty() {
                prompt(&bot, chat_id, SEARCH_PROMPT).await?;
            } else {
                reply(&bot, chat_id, views::search_results(&state, arg).await).await?;
            }
        }
        "/ban" | "/unban" if is_admin => {
            let Ok(target) = arg.parse::<i64>() else {
                bot.send_message(chat_id, format!("Usage: {} <telegram id>", command)).await?;
                return Ok(());
            };
            let result = if command == "/ban" {
                state.users.ban_user(target).await
            } else {
                state.users.unban_user(target).await
            };
            let result = match result {
                Ok(user) => views::user_card(&state, user.id).await,
                Err(e) => Err(e),
            };
            reply(&bot, chat_id, result).await?;
        }
        "/broadcast" if is_admin => {
            if arg.is_empty() {
                prompt(&bot, chat_id, BROADCAST_PROMPT).await?;
            } else {
                broadcast(&bot, chat_id, &state, arg).await?;
            }
        }

        _ => {
            bot.send_message(chat_id, "Choose an action from the menu below.")
                .reply_markup(main_menu())
                .await?;
        }
    }
    Ok(())
}

pub async fn prompt(bot: &Bot, chat_id: ChatId, text: &str) -> Result<(), teloxide::RequestError> {
    bot.send_message(chat_id, text)
        .reply_markup(ForceReply::new().selective())
        .await?;
    Ok(())
}

async fn broadcast(bot: &Bot, chat_id: ChatId, state: &AppState, text: &str) -> Result<(), teloxide::RequestError> {
    info!("Broadcast requested by chat {}", chat_id);
    bot.send_message(chat_id, "📢 Sending...").await?;
    match state.users.broadcast(text).await {
        Ok(report) => {
            bot.send_message(chat_id, texts::broadcast_report(&report)).await?;
        }
        Err(e) => {
            error!("Broadcast failed: {:#}", e);
            bot.send_message(chat_id, "❌ Broadcast failed, see logs.").await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_split_from_arguments() {
        assert_eq!(split_command("/start ref_42"), ("/start", "ref_42"));
        assert_eq!(split_command("/find@shop_bot  @alice "), ("/find", "@alice"));
        assert_eq!(split_command("/status"), ("/status", ""));
        assert_eq!(split_command(keyboards::BTN_MY_VPN), (keyboards::BTN_MY_VPN, ""));
    }
}
