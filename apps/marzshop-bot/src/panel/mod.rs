use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod marzban;

pub use marzban::MarzbanClient;

#[derive(Debug, Error)]
pub enum PanelError {
    /// Network failure, timeout, 5xx, or a token that keeps being refused.
    #[error("VPN panel is unreachable: {0}")]
    Unreachable(String),
    /// The panel understood the request and refused it.
    #[error("VPN panel rejected the request: {0}")]
    Rejected(String),
    #[error("account {0} does not exist on the VPN panel")]
    NotFound(String),
}

impl PanelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PanelError::Unreachable(_))
    }
}

/// Desired end state of a panel account. Values are absolute, so applying
/// the same spec twice leaves the account unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub username: String,
    /// 0 means unlimited.
    pub quota_bytes: i64,
    pub expire_at: DateTime<Utc>,
    pub device_limit: u32,
}

/// What the user needs to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDescriptor {
    pub username: String,
    pub subscription_url: String,
    pub links: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelStats {
    pub version: Option<String>,
    pub total_users: i64,
    pub active_users: i64,
    pub incoming_bytes: i64,
    pub outgoing_bytes: i64,
}

#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Create the account or update it in place, and leave it enabled.
    async fn ensure_account(&self, spec: &AccountSpec) -> Result<AccessDescriptor, PanelError>;

    /// Disable the account. An account the panel does not know is fine.
    async fn disable_account(&self, username: &str) -> Result<(), PanelError>;

    /// Bytes consumed so far.
    async fn fetch_usage(&self, username: &str) -> Result<i64, PanelError>;

    async fn system_stats(&self) -> Result<PanelStats, PanelError>;
}
