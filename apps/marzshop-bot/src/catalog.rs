use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const GIB: i64 = 1024 * 1024 * 1024;

/// Callback payloads carry the tariff id and Telegram caps them at 64 bytes.
const MAX_TARIFF_ID_LEN: usize = 32;

/// Keeps every computed end far inside chrono's range.
pub const MAX_DURATION_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tariff {
    pub id: String,
    pub name: String,
    /// Whole currency units.
    pub price: i64,
    /// 0 means unlimited.
    #[serde(default)]
    pub traffic_gb: i64,
    pub duration_days: i64,
    #[serde(default = "default_max_ips")]
    pub max_ips: u32,
    #[serde(default)]
    pub is_trial: bool,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_max_ips() -> u32 {
    1
}

impl Tariff {
    pub fn quota_bytes(&self) -> i64 {
        self.traffic_gb.saturating_mul(GIB)
    }

    pub fn duration(&self) -> Duration {
        Duration::days(self.duration_days)
    }

    pub fn is_unlimited(&self) -> bool {
        self.traffic_gb == 0
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    tariffs: Vec<Tariff>,
}

/// Read-only list of plans loaded once at startup.
#[derive(Debug, Clone)]
pub struct TariffCatalog {
    tariffs: Vec<Tariff>,
}

impl TariffCatalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read tariffs from {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid tariff file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw).context("Malformed tariff JSON")?;
        Self::new(file.tariffs)
    }

    pub fn new(tariffs: Vec<Tariff>) -> Result<Self> {
        if tariffs.is_empty() {
            bail!("Tariff list is empty");
        }

        let mut seen = HashSet::new();
        for t in &tariffs {
            if t.id.is_empty() || t.id.len() > MAX_TARIFF_ID_LEN {
                bail!("Tariff id {:?} must be 1..={} bytes", t.id, MAX_TARIFF_ID_LEN);
            }
            if t.id.contains(':') {
                bail!("Tariff id {:?} must not contain ':'", t.id);
            }
            if !seen.insert(t.id.as_str()) {
                bail!("Duplicate tariff id {:?}", t.id);
            }
            if !(1..=MAX_DURATION_DAYS).contains(&t.duration_days) {
                bail!("Tariff {:?} must last 1..={} days", t.id, MAX_DURATION_DAYS);
            }
            if t.price < 0 || t.traffic_gb < 0 {
                bail!("Tariff {:?} has a negative price or traffic quota", t.id);
            }
            if t.max_ips == 0 {
                bail!("Tariff {:?} must allow at least one device", t.id);
            }
        }
        if tariffs.iter().filter(|t| t.is_trial).count() > 1 {
            bail!("At most one trial tariff is allowed");
        }

        Ok(Self { tariffs })
    }

    pub fn get(&self, id: &str) -> Option<&Tariff> {
        self.tariffs.iter().find(|t| t.id == id)
    }

    pub fn trial(&self) -> Option<&Tariff> {
        self.tariffs.iter().find(|t| t.is_trial)
    }

    /// Tariffs offered for money, in file order.
    pub fn purchasable(&self) -> impl Iterator<Item = &Tariff> {
        self.tariffs.iter().filter(|t| !t.is_trial)
    }

    pub fn all(&self) -> &[Tariff] {
        &self.tariffs
    }
}
