use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::LedgerContext;
use super::allowance::AllowanceManager;
use super::plan::PlanTier;
use super::settings::CreditSettings;
use super::store_types::{AllowancePeriodRecord, AllowanceSource};
use crate::error::Result;

/// Display view of the current allowance. Credits are derived from tokens on
/// every read and never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceSnapshot {
    pub account_id: String,
    pub period_id: i64,
    pub plan: PlanTier,
    pub source: AllowanceSource,
    #[serde(with = "time::serde::rfc3339")]
    pub period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: OffsetDateTime,
    pub tokens_granted: u64,
    pub tokens_used: u64,
    pub tokens_remaining: u64,
    pub tokens_per_credit: u64,
    pub credits_granted: u64,
    pub credits_used: u64,
    pub credits_remaining: u64,
    pub base_tokens: Option<u64>,
    pub rollover_tokens: Option<u64>,
    pub usage_percentage: u64,
    pub at_limit: bool,
}

impl AllowanceSnapshot {
    pub fn from_period(
        period: &AllowancePeriodRecord,
        plan: PlanTier,
        settings: &CreditSettings,
    ) -> Self {
        let tokens_remaining = period.tokens_remaining();
        let bounds = period.period();
        Self {
            account_id: period.account_id.clone(),
            period_id: period.id,
            plan,
            source: period.source,
            period_start: bounds.start,
            period_end: bounds.end,
            tokens_granted: period.tokens_granted,
            tokens_used: period.tokens_used,
            tokens_remaining,
            tokens_per_credit: settings.tokens_per_credit,
            credits_granted: settings.tokens_to_credits(period.tokens_granted),
            credits_used: settings.tokens_to_credits(period.tokens_used),
            credits_remaining: settings.tokens_to_credits(tokens_remaining),
            base_tokens: period.metadata.base_tokens,
            rollover_tokens: period.metadata.rollover_tokens,
            usage_percentage: usage_percentage(period.tokens_used, period.tokens_granted),
            at_limit: tokens_remaining == 0,
        }
    }
}

/// `round(100 * used / granted)`, half away from zero; 0 for an empty grant.
pub fn usage_percentage(used: u64, granted: u64) -> u64 {
    if granted == 0 {
        return 0;
    }
    let used = u128::from(used);
    let granted = u128::from(granted);
    let rounded = (200 * used + granted) / (2 * granted);
    u64::try_from(rounded).unwrap_or(u64::MAX)
}

#[derive(Clone)]
pub struct StatusReader {
    ctx: Arc<LedgerContext>,
    allowances: AllowanceManager,
}

impl StatusReader {
    pub(crate) fn new(ctx: Arc<LedgerContext>) -> Self {
        let allowances = AllowanceManager::new(ctx.clone());
        Self { ctx, allowances }
    }

    /// Current allowance for display. Creates the period on first read.
    #[tracing::instrument(level = "debug", skip_all, fields(account_id = %account_id))]
    pub async fn status(&self, account_id: &str) -> Result<AllowanceSnapshot> {
        let period = self.allowances.ensure_current_allowance(account_id).await?;
        self.snapshot(&period).await
    }

    async fn snapshot(&self, period: &AllowancePeriodRecord) -> Result<AllowanceSnapshot> {
        let plan = match period.metadata.plan {
            Some(plan) => plan,
            None => self.ctx.resolve_plan(&period.account_id).await?,
        };
        let settings = self.ctx.credit_settings().await?;
        Ok(AllowanceSnapshot::from_period(period, plan, &settings))
    }

    /// Returns the snapshot the first time the account crosses the
    /// low-balance threshold in the current period, and `None` on every later
    /// call until the next period. The flag is persisted with the period, so
    /// the warning fires once across restarts and instances.
    #[tracing::instrument(level = "debug", skip_all, fields(account_id = %account_id))]
    pub async fn take_low_balance_warning(
        &self,
        account_id: &str,
    ) -> Result<Option<AllowanceSnapshot>> {
        let period = self.allowances.ensure_current_allowance(account_id).await?;
        if period.low_balance_warned {
            return Ok(None);
        }
        let snapshot = self.snapshot(&period).await?;
        if !self.is_low(&snapshot) {
            return Ok(None);
        }
        if !self.ctx.store.mark_low_balance_warned(period.id).await? {
            return Ok(None);
        }
        tracing::info!(
            period_id = period.id,
            usage_percentage = snapshot.usage_percentage,
            at_limit = snapshot.at_limit,
            "low balance warning issued"
        );
        Ok(Some(snapshot))
    }

    fn is_low(&self, snapshot: &AllowanceSnapshot) -> bool {
        let threshold = u64::from(self.ctx.config.low_balance_warn_percent);
        snapshot.at_limit || (threshold > 0 && snapshot.usage_percentage >= threshold)
    }
}
