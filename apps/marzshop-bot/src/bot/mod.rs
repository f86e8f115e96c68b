use teloxide::types::BotCommand;
use teloxide::{dptree, prelude::*, types::Update};
use tracing::{error, info, warn};

use crate::state::AppState;

pub mod handlers;
pub mod keyboards;
pub mod views;

fn commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("start", "Main menu"),
        BotCommand::new("status", "Subscription status"),
        BotCommand::new("help", "How it works"),
    ]
}

pub async fn run_bot(
    bot: Bot,
    mut shutdown_signal: tokio::sync::broadcast::Receiver<()>,
    state: AppState,
) -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|info| {
        error!("Bot panic: {:?}", info);
    }));

    let me = bot.get_me().await?;
    let username = me.user.username.clone().unwrap_or_else(|| "bot".into());
    info!("Bot connected as @{}", username);
    let _ = state.bot_username.set(username);

    if let Err(e) = bot.set_my_commands(commands()).await {
        warn!("Failed to register bot commands: {}", e);
    }

    let message_handler = Update::filter_message().endpoint(handlers::command::message_handler);
    let callback_handler =
        Update::filter_callback_query().endpoint(handlers::callback::callback_handler);

    let mut dispatcher = Dispatcher::builder(
        bot,
        dptree::entry()
            .branch(message_handler)
            .branch(callback_handler),
    )
    .dependencies(dptree::deps![state])
    .default_handler(|upd: std::sync::Arc<Update>| async move {
        tracing::debug!("Unhandled update: {:?}", upd.id);
    })
    .build();

    tokio::select! {
        _ = dispatcher.dispatch() => {
            info!("Bot dispatcher exited");
        }
        _ = shutdown_signal.recv() => {
            info!("Bot received shutdown signal, stopping...");
        }
    }
    Ok(())
}
