use anyhow::{bail, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::panel::marzban::MarzbanSettings;
use crate::reconciler::Job;
use crate::services::payment_service::PaymentDetails;

const MAX_REF_BONUS_DAYS: i64 = 365;

#[derive(Parser, Debug)]
#[command(name = "marzshop-bot")]
#[command(about = "Telegram storefront for a Marzban VPN panel", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the bot and the background jobs (default)
    Serve,
    /// Run one background job once and exit
    RunJob {
        #[arg(value_enum)]
        job: Job,
    },
    /// Log in to the panel and print its statistics
    CheckPanel,
}

/// Everything is read from the environment (or a `.env` file); flags override.
#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true, default_value = "")]
    pub bot_token: String,

    #[arg(long, env = "ADMIN_USER_IDS", value_delimiter = ',')]
    pub admin_user_ids: Vec<i64>,

    #[arg(long, env = "MARZBAN_PANEL_URL")]
    pub marzban_panel_url: String,

    #[arg(long, env = "MARZBAN_USERNAME")]
    pub marzban_username: String,

    #[arg(long, env = "MARZBAN_PASSWORD", hide_env_values = true)]
    pub marzban_password: String,

    #[arg(long, env = "MARZBAN_SUBSCRIPTION_URL_PREFIX")]
    pub marzban_subscription_url_prefix: Option<String>,

    #[arg(long, env = "MARZBAN_PROXIES", value_delimiter = ',', default_value = "vless")]
    pub marzban_proxies: Vec<String>,

    #[arg(long, env = "VERIFY_SSL", action = ArgAction::Set, default_value_t = true)]
    pub verify_ssl: bool,

    #[arg(long, env = "PANEL_TIMEOUT_SECS", default_value_t = 15)]
    pub panel_timeout_secs: u64,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://data/users.db")]
    pub database_url: String,

    #[arg(long, env = "TARIFFS_PATH", default_value = "data/tarifs.json")]
    pub tariffs_path: PathBuf,

    #[arg(long, env = "PAYMENT_CARD_NUMBER", default_value = "")]
    pub payment_card_number: String,

    #[arg(long, env = "PAYMENT_CARD_HOLDER", default_value = "")]
    pub payment_card_holder: String,

    #[arg(long, env = "PAYMENT_CURRENCY", default_value = "₽")]
    pub payment_currency: String,

    #[arg(long, env = "REF_BONUS_DAYS", default_value_t = 7)]
    pub ref_bonus_days: i64,

    #[arg(long, env = "NOTIFY_BEFORE_EXPIRE_HOURS", value_delimiter = ',', default_value = "24,48,72")]
    pub notify_before_expire_hours: Vec<i64>,

    #[arg(long, env = "PAYMENT_RETENTION_DAYS", default_value_t = 30)]
    pub payment_retention_days: i64,

    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value_t = 300)]
    pub job_timeout_secs: u64,

    #[arg(long, env = "SUPPORT_URL")]
    pub support_url: Option<String>,

    #[arg(long, env = "TG_CHANNEL")]
    pub tg_channel: Option<String>,

    #[arg(long, env = "SITE_URL")]
    pub site_url: Option<String>,

    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,
}

impl Config {
    /// Checks values clap cannot and normalizes URLs. What is required
    /// depends on the command about to run.
    pub fn validate(mut self, command: &Commands) -> Result<Self> {
        if *command != Commands::CheckPanel && self.bot_token.trim().is_empty() {
            bail!("BOT_TOKEN is not set");
        }
        if *command == Commands::Serve {
            if self.admin_user_ids.is_empty() {
                bail!("ADMIN_USER_IDS must list at least one Telegram id");
            }
            if self.payment_card_number.trim().is_empty() {
                bail!("PAYMENT_CARD_NUMBER is not set");
            }
        }

        self.marzban_panel_url = normalize_url(&self.marzban_panel_url)?;
        self.marzban_subscription_url_prefix = match self.marzban_subscription_url_prefix.as_deref() {
            Some(p) if !p.trim().is_empty() => Some(normalize_url(p)?),
            _ => None,
        };

        self.marzban_proxies.retain(|p| !p.trim().is_empty());
        if self.marzban_proxies.is_empty() {
            bail!("MARZBAN_PROXIES must name at least one protocol");
        }
        if !(0..=MAX_REF_BONUS_DAYS).contains(&self.ref_bonus_days) {
            bail!("REF_BONUS_DAYS must be within 0..={}", MAX_REF_BONUS_DAYS);
        }
        if self.payment_retention_days <= 0 {
            bail!("PAYMENT_RETENTION_DAYS must be positive");
        }
        if self.notify_before_expire_hours.iter().any(|h| *h <= 0) {
            bail!("NOTIFY_BEFORE_EXPIRE_HOURS must hold positive hour counts");
        }
        self.notify_before_expire_hours.sort_unstable();
        self.notify_before_expire_hours.dedup();
        Ok(self)
    }

    pub fn marzban(&self) -> MarzbanSettings {
        MarzbanSettings {
            base_url: self.marzban_panel_url.clone(),
            username: self.marzban_username.clone(),
            password: self.marzban_password.clone(),
            subscription_prefix: self.marzban_subscription_url_prefix.clone(),
            proxies: self.marzban_proxies.clone(),
            verify_ssl: self.verify_ssl,
            timeout: Duration::from_secs(self.panel_timeout_secs),
        }
    }

    pub fn payment_details(&self) -> PaymentDetails {
        PaymentDetails {
            card_number: self.payment_card_number.clone(),
            card_holder: self.payment_card_holder.clone(),
            currency: self.payment_currency.clone(),
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn payment_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.payment_retention_days)
    }
}

fn normalize_url(raw: &str) -> Result<String> {
    let url = raw.trim().trim_end_matches('/');
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("`{}` is not an http(s) URL", raw);
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec![
            "marzshop-bot",
            "--bot-token",
            "123:abc",
            "--admin-user-ids",
            "1,2",
            "--marzban-panel-url",
            "https://panel.example.com/",
            "--marzban-username",
            "admin",
            "--marzban-password",
            "secret",
            "--payment-card-number",
            "2200 0000 0000 0000",
        ];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_and_normalization() {
        let cli = parse(&[]);
        assert_eq!(cli.command, None);
        let config = cli.config.validate(&Commands::Serve).unwrap();
        assert_eq!(config.admin_user_ids, vec![1, 2]);
        assert_eq!(config.marzban_panel_url, "https://panel.example.com");
        assert_eq!(config.notify_before_expire_hours, vec![24, 48, 72]);
        assert_eq!(config.marzban_proxies, vec!["vless"]);
        assert!(config.verify_ssl);
        assert_eq!(config.payment_currency, "₽");
        assert_eq!(config.marzban().timeout, Duration::from_secs(15));
    }

    #[test]
    fn run_job_subcommand() {
        let cli = parse(&["--verify-ssl", "false", "run-job", "traffic-sync"]);
        assert_eq!(cli.command, Some(Commands::RunJob { job: Job::TrafficSync }));
        assert!(!cli.config.verify_ssl);
    }

    #[test]
    fn rejects_bad_values() {
        let cli = parse(&["--notify-before-expire-hours", "24,0"]);
        assert!(cli.config.validate(&Commands::Serve).is_err());

        for bonus in ["--ref-bonus-days=-1", "--ref-bonus-days=100000"] {
            let cli = parse(&[bonus]);
            assert!(cli.config.validate(&Commands::Serve).is_err(), "bonus {}", bonus);
        }

        let mut cli = parse(&[]);
        cli.config.marzban_panel_url = "panel.example.com".into();
        assert!(cli.config.validate(&Commands::CheckPanel).is_err());

        let mut cli = parse(&[]);
        cli.config.admin_user_ids.clear();
        assert!(cli.config.clone().validate(&Commands::Serve).is_err());
        let job = Commands::RunJob { job: Job::ExpirySweep };
        assert!(cli.config.clone().validate(&job).is_ok());

        cli.config.bot_token.clear();
        assert!(cli.config.clone().validate(&job).is_err());
        assert!(cli.config.validate(&Commands::CheckPanel).is_ok());
    }
}
