use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::settings::CreditSettings;

pub const DEFAULT_MAX_CREATE_ATTEMPTS: u32 = 3;
pub const DEFAULT_LOW_BALANCE_WARN_PERCENT: u8 = 80;
pub const DEFAULT_INIT_CONCURRENCY: usize = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Values used for any setting the settings store leaves unset.
    pub defaults: CreditSettings,
    /// Actors permitted to overwrite allowances.
    pub admin_actors: Vec<String>,
    /// Bound on create/re-read rounds when first-use creation races.
    pub max_create_attempts: u32,
    pub low_balance_warn_percent: u8,
    pub init_concurrency: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            defaults: CreditSettings::default(),
            admin_actors: Vec::new(),
            max_create_attempts: DEFAULT_MAX_CREATE_ATTEMPTS,
            low_balance_warn_percent: DEFAULT_LOW_BALANCE_WARN_PERCENT,
            init_concurrency: DEFAULT_INIT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl LedgerConfig {
    /// Loads a `.json` file as JSON and anything else as TOML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json_str(&raw)?
        } else {
            Self::from_toml_str(&raw)?
        };
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validated()
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.defaults.tokens_per_credit == 0 {
            return Err(ConfigError::Invalid(
                "defaults.tokens_per_credit must be at least 1".to_string(),
            ));
        }
        if self.low_balance_warn_percent > 100 {
            return Err(ConfigError::Invalid(
                "low_balance_warn_percent must be between 0 and 100".to_string(),
            ));
        }
        self.max_create_attempts = self.max_create_attempts.max(1);
        self.init_concurrency = self.init_concurrency.max(1);
        self.admin_actors = self
            .admin_actors
            .into_iter()
            .map(|actor| actor.trim().to_string())
            .filter(|actor| !actor.is_empty())
            .collect();
        Ok(self)
    }

    pub fn is_admin(&self, actor: &str) -> bool {
        let actor = actor.trim();
        !actor.is_empty() && self.admin_actors.iter().any(|admin| admin == actor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_config_fills_defaults() {
        let config = LedgerConfig::from_toml_str(
            r#"
admin_actors = ["ops-team", "  "]

[defaults]
tokens_per_credit = 250
"#,
        )
        .expect("config");
        assert_eq!(config.defaults.tokens_per_credit, 250);
        assert_eq!(config.defaults.tokens_free_per_month, 60_000);
        assert_eq!(config.admin_actors, vec!["ops-team".to_string()]);
        assert_eq!(config.max_create_attempts, DEFAULT_MAX_CREATE_ATTEMPTS);
        assert!(config.is_admin("ops-team"));
        assert!(!config.is_admin("guild-mod"));
    }

    #[test]
    fn json_config_rejects_zero_conversion_rate() {
        let err = LedgerConfig::from_json_str(r#"{"defaults": {"tokens_per_credit": 0}}"#);
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_attempts_are_raised_to_one() {
        let config = LedgerConfig::from_json_str(r#"{"max_create_attempts": 0}"#).expect("config");
        assert_eq!(config.max_create_attempts, 1);
    }

    #[test]
    fn load_picks_format_from_extension() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, r#"{"low_balance_warn_percent": 90}"#).expect("write");
        let config = LedgerConfig::load(&path).expect("load");
        assert_eq!(config.low_balance_warn_percent, 90);
    }
}
