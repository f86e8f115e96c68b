mod bot;
mod catalog;
mod config;
mod errors;
mod models;
mod panel;
mod reconciler;
mod services;
mod state;
mod texts;
mod utils;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use marzshop_db::{init_db, Store};
use std::io;
use std::sync::Arc;
use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::catalog::TariffCatalog;
use crate::config::{Cli, Commands, Config};
use crate::panel::{MarzbanClient, PanelApi};
use crate::reconciler::{Reconciler, Scheduler};
use crate::services::notification_service::{NotificationService, TelegramSink};
use crate::services::payment_service::PaymentService;
use crate::services::referral_service::ReferralService;
use crate::services::subscription_service::SubscriptionService;
use crate::services::user_service::UserService;
use crate::state::{AppState, Contacts};

fn init_tracing(config: &Config) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log dir {}", config.log_dir.display()))?;
    let file_appender = tracing_appender::rolling::never(&config.log_dir, "bot.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marzshop_bot=info,marzshop_db=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Ok(guard)
}

/// Services wired over one store and one panel client.
struct App {
    state: AppState,
    reconciler: Arc<Reconciler>,
}

async fn build(config: &Config, bot: Bot) -> Result<App> {
    let pool = init_db(&config.database_url).await?;
    let store = Store::new(pool);

    let catalog = Arc::new(
        TariffCatalog::load(&config.tariffs_path)
            .with_context(|| format!("Failed to load tariffs from {}", config.tariffs_path.display()))?,
    );
    info!("Loaded {} tariffs", catalog.all().len());

    let panel: Arc<dyn PanelApi> = Arc::new(MarzbanClient::new(config.marzban())?);
    let notifier = NotificationService::new(Arc::new(TelegramSink::new(bot)), config.admin_user_ids.clone());

    let subscriptions = SubscriptionService::new(store.clone(), catalog.clone(), panel.clone());
    let referrals = ReferralService::new(
        store.clone(),
        subscriptions.clone(),
        notifier.clone(),
        config.ref_bonus_days,
    );
    let payments = PaymentService::new(
        store.clone(),
        catalog.clone(),
        subscriptions.clone(),
        referrals.clone(),
        notifier.clone(),
        config.payment_details(),
    );
    let users = UserService::new(
        store.clone(),
        panel.clone(),
        subscriptions.clone(),
        referrals.clone(),
        notifier.clone(),
    );
    let reconciler = Arc::new(Reconciler::new(
        store,
        panel,
        subscriptions.clone(),
        notifier.clone(),
        config.notify_before_expire_hours.clone(),
        config.payment_retention(),
    ));

    let state = AppState {
        catalog,
        users,
        subscriptions,
        payments,
        referrals,
        notifier,
        contacts: Contacts {
            support_url: config.support_url.clone(),
            channel: config.tg_channel.clone(),
            site: config.site_url.clone(),
        },
        bot_username: Arc::new(std::sync::OnceLock::new()),
    };
    Ok(App { state, reconciler })
}

async fn check_panel(config: &Config) -> Result<()> {
    let panel = MarzbanClient::new(config.marzban())?;
    let stats = panel.system_stats().await?;
    info!(
        version = stats.version.as_deref().unwrap_or("unknown"),
        total_users = stats.total_users,
        active_users = stats.active_users,
        "Panel is reachable"
    );
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let bot = Bot::new(config.bot_token.clone());
    let app = build(&config, bot.clone()).await?;

    match app.state.users.statistics().await {
        Ok(stats) if stats.panel.is_some() => info!("Panel login succeeded"),
        Ok(_) => warn!("Panel is not reachable yet; purchases will fail until it is"),
        Err(e) => warn!("Startup statistics failed: {:#}", e),
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(4);
    let jobs = Scheduler::new(app.reconciler.clone(), config.job_timeout()).spawn(&shutdown_tx);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            let _ = ctrl_c_tx.send(());
        }
    });

    let result = bot::run_bot(bot, shutdown_tx.subscribe(), app.state).await;
    let _ = shutdown_tx.send(());
    for job in jobs {
        if let Err(e) = job.await {
            error!("Background job task failed: {}", e);
        }
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(Commands::Serve);
    let config = cli.config.validate(&command)?;
    let _guard = init_tracing(&config)?;
    info!("marzshop-bot {} starting", env!("CARGO_PKG_VERSION"));

    match command {
        Commands::Serve => serve(config).await,
        Commands::RunJob { job } => {
            let bot = Bot::new(config.bot_token.clone());
            let app = build(&config, bot).await?;
            let report = reconciler::run_once(&app.reconciler, job, config.job_timeout())
                .await
                .with_context(|| format!("Job {} did not complete", job.name()))?;
            info!(
                job = job.name(),
                processed = report.processed,
                failed = report.failed,
                "Done"
            );
            Ok(())
        }
        Commands::CheckPanel => check_panel(&config).await,
    }
}
