use thiserror::Error;

use crate::panel::PanelError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown or unavailable tariff `{0}`")]
    InvalidTariff(String),
    #[error("user {0} is banned")]
    UserBanned(i64),
    #[error("user {0} is not registered")]
    UnknownUser(i64),
    #[error("{0} not found")]
    NotFound(String),
    #[error("payment {0} was already decided")]
    AlreadyDecided(i64),
    #[error("payment {0} was already confirmed")]
    AlreadyConfirmed(i64),
    #[error("trial was already used")]
    TrialAlreadyUsed,
    #[error("no trial tariff is configured")]
    TrialUnavailable,
    #[error("user already has an active subscription")]
    SubscriptionActive,
    #[error(transparent)]
    Panel(#[from] PanelError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Text safe to show in chat.
    pub fn user_message(&self) -> String {
        match self {
            WorkflowError::InvalidTariff(_) => "❌ This tariff is not available.".into(),
            WorkflowError::UserBanned(_) => "🚫 Your account has been banned.".into(),
            WorkflowError::UnknownUser(_) => "❌ Please press /start first.".into(),
            WorkflowError::NotFound(what) => format!("❌ {} not found.", what),
            WorkflowError::AlreadyDecided(id) => {
                format!("⚠️ Payment #{} has already been processed.", id)
            }
            WorkflowError::AlreadyConfirmed(id) => {
                format!("⚠️ Payment #{} is already waiting for review.", id)
            }
            WorkflowError::TrialAlreadyUsed => "❌ You have already used your trial.".into(),
            WorkflowError::TrialUnavailable => "❌ Trial is not available right now.".into(),
            WorkflowError::SubscriptionActive => {
                "❌ You already have an active subscription.".into()
            }
            WorkflowError::Panel(e) if e.is_transient() => {
                "⚠️ VPN server is temporarily unavailable. Please try again later.".into()
            }
            WorkflowError::Panel(_) => "❌ VPN server refused the request.".into(),
            WorkflowError::Store(_) => "❌ Internal error. Please try again later.".into(),
        }
    }
}

pub type WorkflowResult<T> = Result<T, WorkflowError>;
