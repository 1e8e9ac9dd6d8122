use serde::{Deserialize, Serialize};

use super::period::{Period, from_millis};
use super::plan::PlanTier;

pub const ADMIN_ADJUSTMENT_FEATURE: &str = "admin_adjustment";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceSource {
    FreeTier,
    Subscription,
    AdminManual,
}

impl AllowanceSource {
    pub fn for_plan(plan: PlanTier) -> Self {
        match plan {
            PlanTier::Free => AllowanceSource::FreeTier,
            PlanTier::Premium => AllowanceSource::Subscription,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllowanceSource::FreeTier => "free_tier",
            AllowanceSource::Subscription => "subscription",
            AllowanceSource::AdminManual => "admin_manual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free_tier" => Some(AllowanceSource::FreeTier),
            "subscription" => Some(AllowanceSource::Subscription),
            "admin_manual" => Some(AllowanceSource::AdminManual),
            _ => None,
        }
    }
}

/// Grant provenance captured when the period is created.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollover_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowancePeriodRecord {
    pub id: i64,
    pub account_id: String,
    pub period_start_ms: i64,
    pub period_end_ms: i64,
    pub tokens_granted: u64,
    pub tokens_used: u64,
    pub source: AllowanceSource,
    pub metadata: AllowanceMetadata,
    #[serde(default)]
    pub low_balance_warned: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl AllowancePeriodRecord {
    pub fn period(&self) -> Period {
        Period {
            start: from_millis(self.period_start_ms),
            end: from_millis(self.period_end_ms),
        }
    }

    /// Never negative, even after an administrative override pushed usage
    /// above the grant.
    pub fn tokens_remaining(&self) -> u64 {
        self.tokens_granted.saturating_sub(self.tokens_used)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAllowancePeriod {
    pub account_id: String,
    pub period: Period,
    pub tokens_granted: u64,
    pub source: AllowanceSource,
    pub metadata: AllowanceMetadata,
    pub created_at_ms: i64,
}

/// Result of a period insert guarded by `(account_id, period_start)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeriodInsert {
    Created(AllowancePeriodRecord),
    /// Another caller created the period first.
    Conflict,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentDetail {
    pub previous_granted: u64,
    pub previous_used: u64,
    pub new_granted: u64,
    pub new_used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<AdjustmentDetail>,
}

/// One immutable row of the usage log.
///
/// `total_tokens` is signed: administrative adjustments log the change in
/// `tokens_used`, which can be negative. `tokens_used_after` and
/// `tokens_granted_after` capture the balance the charge produced so that an
/// idempotent replay returns the original answer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEventRecord {
    pub id: i64,
    pub account_id: String,
    pub period_id: i64,
    pub idempotency_key: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: i64,
    pub credits_charged: f64,
    pub tokens_per_credit: u64,
    pub feature: String,
    pub tokens_used_after: u64,
    pub tokens_granted_after: u64,
    pub metadata: UsageEventMetadata,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewUsageEvent {
    pub account_id: String,
    pub idempotency_key: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tokens_per_credit: u64,
    pub feature: String,
    pub metadata: UsageEventMetadata,
    pub created_at_ms: i64,
}

impl NewUsageEvent {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ChargeOutcome {
    /// Event inserted and `tokens_used` incremented in one step.
    Charged {
        event: UsageEventRecord,
        period: AllowancePeriodRecord,
    },
    /// The idempotency key was already recorded; nothing changed.
    Duplicate(UsageEventRecord),
    /// The charge would exceed the grant; nothing changed.
    Insufficient(AllowancePeriodRecord),
    /// The event is durable but the running total could not be updated.
    RecordedWithoutIncrement {
        event: UsageEventRecord,
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeriodAdjustment {
    pub period_id: i64,
    pub new_granted: u64,
    pub new_used: u64,
    pub actor: String,
    pub reason: Option<String>,
    pub idempotency_key: String,
    pub tokens_per_credit: u64,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub previous_used: u64,
    pub period: AllowancePeriodRecord,
}

/// Signed change in `tokens_used`, saturating at the `i64` bounds.
pub(crate) fn used_delta(previous_used: u64, new_used: u64) -> i64 {
    let previous = i128::from(previous_used);
    let new = i128::from(new_used);
    i64::try_from(new - previous).unwrap_or(if new > previous { i64::MAX } else { i64::MIN })
}

pub(crate) fn used_from_event_total(total: i64) -> u64 {
    u64::try_from(total).unwrap_or(0)
}

pub(crate) fn credits_for(total_tokens: i64, tokens_per_credit: u64) -> f64 {
    total_tokens as f64 / tokens_per_credit.max(1) as f64
}
