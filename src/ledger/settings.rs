use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::plan::PlanTier;
use super::store::StoreError;

pub const DEFAULT_TOKENS_PER_CREDIT: u64 = 200;
pub const DEFAULT_TOKENS_FREE_PER_MONTH: u64 = 60_000;
pub const DEFAULT_TOKENS_PREMIUM_PER_MONTH: u64 = 1_000_000;

/// Tunable conversion and grant parameters.
///
/// Grants are only read when a period is created; changing them never
/// alters an allowance that already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreditSettings {
    pub tokens_per_credit: u64,
    pub tokens_free_per_month: u64,
    pub tokens_premium_per_month: u64,
}

impl Default for CreditSettings {
    fn default() -> Self {
        Self {
            tokens_per_credit: DEFAULT_TOKENS_PER_CREDIT,
            tokens_free_per_month: DEFAULT_TOKENS_FREE_PER_MONTH,
            tokens_premium_per_month: DEFAULT_TOKENS_PREMIUM_PER_MONTH,
        }
    }
}

impl CreditSettings {
    pub fn monthly_grant(&self, plan: PlanTier) -> u64 {
        match plan {
            PlanTier::Free => self.tokens_free_per_month,
            PlanTier::Premium => self.tokens_premium_per_month,
        }
    }

    pub fn get(&self, key: SettingKey) -> u64 {
        match key {
            SettingKey::TokensPerCredit => self.tokens_per_credit,
            SettingKey::TokensFreePerMonth => self.tokens_free_per_month,
            SettingKey::TokensPremiumPerMonth => self.tokens_premium_per_month,
        }
    }

    pub fn set(&mut self, key: SettingKey, value: u64) {
        match key {
            SettingKey::TokensPerCredit => self.tokens_per_credit = value,
            SettingKey::TokensFreePerMonth => self.tokens_free_per_month = value,
            SettingKey::TokensPremiumPerMonth => self.tokens_premium_per_month = value,
        }
    }

    /// Layers stored overrides on top of `defaults`. A zero conversion rate
    /// cannot divide anything, so it falls back to the default.
    pub fn with_overrides(
        defaults: CreditSettings,
        overrides: impl IntoIterator<Item = (SettingKey, u64)>,
    ) -> CreditSettings {
        let mut settings = defaults;
        for (key, value) in overrides {
            if key == SettingKey::TokensPerCredit && value == 0 {
                tracing::warn!(
                    default = defaults.tokens_per_credit,
                    "ignoring stored tokens_per_credit=0"
                );
                continue;
            }
            settings.set(key, value);
        }
        if settings.tokens_per_credit == 0 {
            settings.tokens_per_credit = DEFAULT_TOKENS_PER_CREDIT;
        }
        settings
    }

    pub fn tokens_to_credits(&self, tokens: u64) -> u64 {
        tokens / self.tokens_per_credit.max(1)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    TokensPerCredit,
    TokensFreePerMonth,
    TokensPremiumPerMonth,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::TokensPerCredit,
        SettingKey::TokensFreePerMonth,
        SettingKey::TokensPremiumPerMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::TokensPerCredit => "tokens_per_credit",
            SettingKey::TokensFreePerMonth => "tokens_free_per_month",
            SettingKey::TokensPremiumPerMonth => "tokens_premium_per_month",
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str() == raw.trim())
            .ok_or_else(|| format!("unknown setting: {raw}"))
    }
}

/// Source of the current credit settings. Implementations should return
/// reasonably fresh values; callers read once per operation and never cache.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn credit_settings(&self) -> Result<CreditSettings, StoreError>;

    async fn set_setting(&self, key: SettingKey, value: u64) -> Result<(), StoreError>;
}

/// Process-local settings, for tests and single-node embedders.
#[derive(Debug, Default)]
pub struct StaticSettings {
    settings: RwLock<CreditSettings>,
}

impl StaticSettings {
    pub fn new(settings: CreditSettings) -> Self {
        Self {
            settings: RwLock::new(CreditSettings::with_overrides(settings, [])),
        }
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn credit_settings(&self) -> Result<CreditSettings, StoreError> {
        Ok(*self.settings.read().await)
    }

    async fn set_setting(&self, key: SettingKey, value: u64) -> Result<(), StoreError> {
        if key == SettingKey::TokensPerCredit && value == 0 {
            return Err(StoreError::Rejected {
                message: "tokens_per_credit must be at least 1".to_string(),
            });
        }
        self.settings.write().await.set(key, value);
        Ok(())
    }
}
