//! Usage ledger: charges token usage against the current allowance.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::LedgerContext;
use super::allowance::AllowanceManager;
use super::idempotency::{MAX_KEY_LEN, derive_key, unique_key};
use super::period::{from_millis, to_millis};
use super::settings::CreditSettings;
use super::store_types::{
    ADMIN_ADJUSTMENT_FEATURE, AllowancePeriodRecord, ChargeOutcome, NewUsageEvent,
    UsageEventMetadata, UsageEventRecord,
};
use crate::error::{InsufficientBalance, LedgerError, Result};

const MAX_FEATURE_LEN: usize = 64;
pub const DEFAULT_EVENT_LIMIT: usize = 50;
pub const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub account_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub feature: String,
    /// Retries carrying the same key are applied once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Upstream identifier of the unit of work. Used to derive a key when
    /// none is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl ChargeRequest {
    pub fn new(
        account_id: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        feature: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            prompt_tokens,
            completion_tokens,
            feature: feature.into(),
            ..Self::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    fn total_tokens(&self) -> Result<u64> {
        let total = self
            .prompt_tokens
            .checked_add(self.completion_tokens)
            .filter(|total| i64::try_from(*total).is_ok())
            .ok_or_else(|| LedgerError::invalid("token counts are too large"))?;
        Ok(total)
    }

    fn validate(&self) -> Result<u64> {
        super::validate_account_id(&self.account_id)?;
        let feature = self.feature.trim();
        if feature.is_empty() {
            return Err(LedgerError::invalid("feature must not be empty"));
        }
        if feature.len() > MAX_FEATURE_LEN {
            return Err(LedgerError::invalid(format!(
                "feature is longer than {MAX_FEATURE_LEN} bytes"
            )));
        }
        if feature == ADMIN_ADJUSTMENT_FEATURE {
            return Err(LedgerError::invalid(format!(
                "feature `{ADMIN_ADJUSTMENT_FEATURE}` is reserved"
            )));
        }
        if let Some(key) = self.idempotency_key.as_deref() {
            if key.trim().is_empty() {
                return Err(LedgerError::invalid("idempotency_key must not be empty"));
            }
            if key.len() > MAX_KEY_LEN {
                return Err(LedgerError::invalid(format!(
                    "idempotency_key is longer than {MAX_KEY_LEN} bytes"
                )));
            }
        }
        self.total_tokens()
    }

    /// Explicit key, else one derived from `source_ref`, else a fresh key
    /// that never deduplicates.
    fn resolve_key(&self) -> (String, bool) {
        if let Some(key) = self.idempotency_key.as_deref() {
            return (key.to_string(), true);
        }
        match self
            .source_ref
            .as_deref()
            .filter(|source| !source.trim().is_empty())
        {
            Some(source) => (
                derive_key(&self.account_id, self.feature.trim(), source),
                true,
            ),
            None => (unique_key("auto"), false),
        }
    }
}

/// Outcome of a successful charge. Replays of the same idempotency key
/// return an identical value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChargeResult {
    pub event_id: i64,
    pub account_id: String,
    pub idempotency_key: String,
    pub total_tokens: u64,
    pub credits_charged: f64,
    pub tokens_per_credit: u64,
    pub tokens_granted: u64,
    pub tokens_used: u64,
    pub tokens_remaining: u64,
    pub credits_remaining: u64,
}

impl ChargeResult {
    fn from_event(event: &UsageEventRecord) -> Self {
        let tokens_remaining = event
            .tokens_granted_after
            .saturating_sub(event.tokens_used_after);
        Self {
            event_id: event.id,
            account_id: event.account_id.clone(),
            idempotency_key: event.idempotency_key.clone(),
            total_tokens: u64::try_from(event.total_tokens).unwrap_or(0),
            credits_charged: event.credits_charged,
            tokens_per_credit: event.tokens_per_credit,
            tokens_granted: event.tokens_granted_after,
            tokens_used: event.tokens_used_after,
            tokens_remaining,
            credits_remaining: tokens_remaining / event.tokens_per_credit.max(1),
        }
    }
}

#[derive(Clone)]
pub struct UsageLedger {
    ctx: Arc<LedgerContext>,
    allowances: AllowanceManager,
}

impl UsageLedger {
    pub(crate) fn new(ctx: Arc<LedgerContext>) -> Self {
        let allowances = AllowanceManager::new(ctx.clone());
        Self { ctx, allowances }
    }

    /// Charges `prompt_tokens + completion_tokens` against the account's
    /// current allowance.
    ///
    /// A key that was already recorded returns the original result without
    /// charging again. A charge that would exceed the grant fails with
    /// [`LedgerError::InsufficientBalance`] and changes nothing.
    #[tracing::instrument(
        skip_all,
        fields(account_id = %request.account_id, feature = %request.feature)
    )]
    pub async fn charge(&self, request: ChargeRequest) -> Result<ChargeResult> {
        let total = request.validate()?;
        let (idempotency_key, deduplicated) = request.resolve_key();
        let account_id = request.account_id.as_str();
        let store = &self.ctx.store;

        if deduplicated {
            if let Some(existing) = store.find_event(account_id, &idempotency_key).await? {
                return Ok(self.replay(&existing, total));
            }
        } else {
            tracing::debug!("charge without idempotency key; retries will charge again");
        }

        let period = self.allowances.ensure_current_allowance(account_id).await?;
        let settings = self.ctx.credit_settings().await?;
        if period.tokens_used.saturating_add(total) > period.tokens_granted {
            return Err(self.insufficient(&period, total, &settings));
        }

        let event = NewUsageEvent {
            account_id: account_id.to_string(),
            idempotency_key,
            prompt_tokens: request.prompt_tokens,
            completion_tokens: request.completion_tokens,
            tokens_per_credit: settings.tokens_per_credit,
            feature: request.feature.trim().to_string(),
            metadata: UsageEventMetadata {
                actor_id: request.actor_id.clone(),
                channel_id: request.channel_id.clone(),
                source_ref: request.source_ref.clone(),
                adjustment: None,
            },
            created_at_ms: to_millis(self.ctx.now()),
        };

        match store.record_charge(period.id, event).await? {
            ChargeOutcome::Charged { event, period } => {
                self.ctx.metrics.record_charge();
                tracing::debug!(
                    event_id = event.id,
                    total_tokens = total,
                    tokens_used = period.tokens_used,
                    tokens_granted = period.tokens_granted,
                    "usage charged"
                );
                Ok(ChargeResult::from_event(&event))
            }
            ChargeOutcome::Duplicate(existing) => Ok(self.replay(&existing, total)),
            ChargeOutcome::Insufficient(current) => {
                Err(self.insufficient(&current, total, &settings))
            }
            ChargeOutcome::RecordedWithoutIncrement { event, reason } => {
                self.ctx.metrics.record_partial_commit();
                tracing::warn!(
                    event_id = event.id,
                    period_id = event.period_id,
                    total_tokens = total,
                    reason = %reason,
                    "usage event recorded but running total not updated; reconcile pending"
                );
                Ok(ChargeResult::from_event(&event))
            }
        }
    }

    fn replay(&self, existing: &UsageEventRecord, requested_total: u64) -> ChargeResult {
        self.ctx.metrics.record_charge_replay();
        let recorded_total = u64::try_from(existing.total_tokens).unwrap_or(0);
        if recorded_total != requested_total {
            tracing::warn!(
                event_id = existing.id,
                recorded_total,
                requested_total,
                "idempotency key reused with different token counts; returning original charge"
            );
        } else {
            tracing::debug!(event_id = existing.id, "duplicate charge replayed");
        }
        ChargeResult::from_event(existing)
    }

    fn insufficient(
        &self,
        period: &AllowancePeriodRecord,
        requested_tokens: u64,
        settings: &CreditSettings,
    ) -> LedgerError {
        self.ctx.metrics.record_insufficient_balance();
        let tokens_remaining = period.tokens_remaining();
        tracing::debug!(
            account_id = %period.account_id,
            requested_tokens,
            tokens_remaining,
            "charge rejected: insufficient balance"
        );
        LedgerError::InsufficientBalance(Box::new(InsufficientBalance {
            account_id: period.account_id.clone(),
            requested_tokens,
            tokens_remaining,
            credits_remaining: settings.tokens_to_credits(tokens_remaining),
            tokens_per_credit: settings.tokens_per_credit,
            plan: period.metadata.plan,
            period_end: from_millis(period.period_end_ms),
        }))
    }

    /// Newest first. `limit` is clamped to `1..=1000`.
    pub async fn list_events(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEventRecord>> {
        let account_id = super::validate_account_id(account_id)?;
        let limit = limit.clamp(1, MAX_EVENT_LIMIT);
        Ok(self.ctx.store.list_events(account_id, limit).await?)
    }

    /// Rebuilds the current period's `tokens_used` from its event log,
    /// repairing a running total that lags after a partial commit.
    #[tracing::instrument(skip_all, fields(account_id = %account_id))]
    pub async fn reconcile(&self, account_id: &str) -> Result<AllowancePeriodRecord> {
        let period = self.allowances.ensure_current_allowance(account_id).await?;
        let reconciled = self
            .ctx
            .store
            .reconcile_period(period.id, to_millis(self.ctx.now()))
            .await?;
        if reconciled.previous_used != reconciled.period.tokens_used {
            tracing::warn!(
                period_id = period.id,
                previous_used = reconciled.previous_used,
                tokens_used = reconciled.period.tokens_used,
                "running total corrected from event log"
            );
        }
        Ok(reconciled.period)
    }
}
