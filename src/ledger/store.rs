//! Storage contract for the allowance ledger.
//!
//! The ledger has no in-process serialization point: many callers may charge
//! the same account at once from different processes. Correctness therefore
//! rests on the guarantees listed on [`LedgerStore`], which every backend must
//! uphold with its own atomicity primitives (a transaction, a conditional
//! update, a server-side script).

use async_trait::async_trait;
use thiserror::Error;

use super::store_types::{
    AllowancePeriodRecord, ChargeOutcome, NewAllowancePeriod, NewUsageEvent, PeriodAdjustment,
    PeriodInsert, Reconciliation, UsageEventRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allowance period not found: {period_id}")]
    PeriodNotFound { period_id: i64 },
    #[error("corrupt record: {message}")]
    Corrupt { message: String },
    #[error("rejected by store: {message}")]
    Rejected { message: String },
    #[error("store unavailable: {message}")]
    Unavailable { message: String },
}

/// Durable state behind the ledger.
///
/// Required guarantees:
///
/// * at most one period per `(account_id, period_start_ms)`; a losing insert
///   reports [`PeriodInsert::Conflict`] instead of creating a second row;
/// * at most one event per `(account_id, idempotency_key)`;
/// * [`record_charge`](LedgerStore::record_charge) checks the key, checks
///   the balance and applies the increment as one atomic step, so two
///   concurrent charges can never both succeed past the grant;
/// * `tokens_used` only changes through `record_charge`,
///   [`adjust_period`](LedgerStore::adjust_period) and
///   [`reconcile_period`](LedgerStore::reconcile_period).
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Period with `period_start_ms <= at_ms < period_end_ms`.
    async fn period_at(
        &self,
        account_id: &str,
        at_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError>;

    async fn period_starting(
        &self,
        account_id: &str,
        start_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError>;

    /// Most recent period with `period_end_ms <= end_ms`.
    async fn latest_period_ending_by(
        &self,
        account_id: &str,
        end_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError>;

    async fn period_by_id(&self, period_id: i64)
    -> Result<Option<AllowancePeriodRecord>, StoreError>;

    async fn insert_period(&self, period: NewAllowancePeriod) -> Result<PeriodInsert, StoreError>;

    async fn find_event(
        &self,
        account_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError>;

    /// Charges `event` against `period_id`.
    ///
    /// Returns [`ChargeOutcome::Duplicate`] when the key is already recorded
    /// and [`ChargeOutcome::Insufficient`] when
    /// `tokens_used + total > tokens_granted`; neither mutates anything.
    async fn record_charge(
        &self,
        period_id: i64,
        event: NewUsageEvent,
    ) -> Result<ChargeOutcome, StoreError>;

    /// Overwrites grant and usage, appending an `admin_adjustment` event whose
    /// `total_tokens` is the signed change in `tokens_used`.
    async fn adjust_period(
        &self,
        adjustment: PeriodAdjustment,
    ) -> Result<(AllowancePeriodRecord, UsageEventRecord), StoreError>;

    /// Newest first.
    async fn list_events(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEventRecord>, StoreError>;

    /// Recomputes `tokens_used` as the sum of `total_tokens` over every event
    /// logged against `period_id` (floored at zero), in one atomic step.
    async fn reconcile_period(
        &self,
        period_id: i64,
        updated_at_ms: i64,
    ) -> Result<Reconciliation, StoreError>;

    /// Sets the low-balance flag. Returns `true` only for the caller that
    /// flipped it.
    async fn mark_low_balance_warned(&self, period_id: i64) -> Result<bool, StoreError>;
}
