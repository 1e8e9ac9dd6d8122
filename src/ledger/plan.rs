use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::store::StoreError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Premium,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "free" => Some(PlanTier::Free),
            "premium" => Some(PlanTier::Premium),
            _ => None,
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read side of the subscription record owned by the billing integration.
#[async_trait]
pub trait PlanResolver: Send + Sync {
    /// Current tier for `account_id`, or `None` when the account is unknown.
    async fn plan_for(&self, account_id: &str) -> Result<Option<PlanTier>, StoreError>;

    /// Accounts eligible for batch allowance initialization.
    async fn active_accounts(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Clone, Copy, Debug)]
struct AccountEntry {
    plan: PlanTier,
    active: bool,
}

/// In-memory account registry.
#[derive(Debug, Default)]
pub struct StaticPlanResolver {
    accounts: RwLock<BTreeMap<String, AccountEntry>>,
}

impl StaticPlanResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account_id: impl Into<String>, plan: PlanTier) -> Self {
        self.accounts
            .get_mut()
            .insert(account_id.into(), AccountEntry { plan, active: true });
        self
    }

    pub async fn upsert(&self, account_id: impl Into<String>, plan: PlanTier, active: bool) {
        self.accounts
            .write()
            .await
            .insert(account_id.into(), AccountEntry { plan, active });
    }
}

#[async_trait]
impl PlanResolver for StaticPlanResolver {
    async fn plan_for(&self, account_id: &str) -> Result<Option<PlanTier>, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .get(account_id)
            .map(|entry| entry.plan))
    }

    async fn active_accounts(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .accounts
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(id, _)| id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_resolver_reports_plans_and_active_accounts() {
        let resolver = StaticPlanResolver::new()
            .with_account("guild-a", PlanTier::Free)
            .with_account("guild-b", PlanTier::Premium);
        resolver.upsert("guild-c", PlanTier::Free, false).await;

        assert_eq!(
            resolver.plan_for("guild-b").await.expect("plan"),
            Some(PlanTier::Premium)
        );
        assert_eq!(resolver.plan_for("missing").await.expect("plan"), None);
        assert_eq!(
            resolver.active_accounts().await.expect("active"),
            vec!["guild-a".to_string(), "guild-b".to_string()]
        );
    }

    #[test]
    fn plan_names_parse() {
        assert_eq!(PlanTier::parse("premium"), Some(PlanTier::Premium));
        assert_eq!(PlanTier::parse(" free "), Some(PlanTier::Free));
        assert_eq!(PlanTier::parse("enterprise"), None);
    }
}
