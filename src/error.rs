use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::plan::PlanTier;
use crate::ledger::store::StoreError;

/// Data carried by a rejected charge, enough to render an upgrade or
/// wait-for-reset message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsufficientBalance {
    pub account_id: String,
    pub requested_tokens: u64,
    pub tokens_remaining: u64,
    pub credits_remaining: u64,
    pub tokens_per_credit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanTier>,
    #[serde(with = "time::serde::rfc3339")]
    pub period_end: time::OffsetDateTime,
}

impl std::fmt::Display for InsufficientBalance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requested={} remaining={} account={}",
            self.requested_tokens, self.tokens_remaining, self.account_id
        )
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    #[error("insufficient balance: {0}")]
    InsufficientBalance(Box<InsufficientBalance>),
    #[error("account not found: {account_id}")]
    AccountNotFound { account_id: String },
    #[error("actor is not allowed to adjust allowances: {actor}")]
    Unauthorized { actor: String },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl LedgerError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Storage failures may succeed when retried with the same idempotency
    /// key; every other variant rejects identically on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
