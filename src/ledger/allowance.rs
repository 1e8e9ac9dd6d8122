//! Per-account monthly allowances.
//!
//! [`AllowanceManager::ensure_current_allowance`] is the only place period
//! and rollover arithmetic happens. Charges, status reads, administrative
//! adjustments and batch initialization all go through it, so they cannot
//! disagree about what an account was granted.

use std::sync::Arc;

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::idempotency::unique_key;
use super::period::{current_period, to_millis};
use super::store::StoreError;
use super::store_types::{
    AllowanceMetadata, AllowancePeriodRecord, AllowanceSource, NewAllowancePeriod,
    PeriodAdjustment, PeriodInsert,
};
use super::{LedgerContext, validate_account_id};
use crate::error::{LedgerError, Result};

/// Unused allowance carried into the next period, capped at one base grant.
pub fn compute_rollover(previous: Option<&AllowancePeriodRecord>, base_tokens: u64) -> u64 {
    previous
        .map(|period| period.tokens_remaining().min(base_tokens))
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminAdjustment {
    pub account_id: String,
    pub tokens_granted: u64,
    pub tokens_used: u64,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInitFailure {
    pub account_id: String,
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInitReport {
    pub initialized_count: usize,
    /// Accounts whose current period was created by this run.
    pub initialized: Vec<String>,
    pub already_current: usize,
    pub failed: Vec<BatchInitFailure>,
}

#[derive(Clone)]
pub struct AllowanceManager {
    ctx: Arc<LedgerContext>,
}

impl AllowanceManager {
    pub(crate) fn new(ctx: Arc<LedgerContext>) -> Self {
        Self { ctx }
    }

    /// Returns the account's allowance for the current calendar month,
    /// creating it on first use.
    ///
    /// Concurrent first use is resolved by the store's uniqueness guarantee on
    /// `(account_id, period_start)`: exactly one caller creates the row and the
    /// others read it back.
    #[tracing::instrument(level = "debug", skip_all, fields(account_id = %account_id))]
    pub async fn ensure_current_allowance(
        &self,
        account_id: &str,
    ) -> Result<AllowancePeriodRecord> {
        let now = self.ctx.now();
        self.ensure_at(account_id, now)
            .await
            .map(|(period, _created)| period)
    }

    pub(crate) async fn ensure_at(
        &self,
        account_id: &str,
        now: OffsetDateTime,
    ) -> Result<(AllowancePeriodRecord, bool)> {
        let account_id = validate_account_id(account_id)?;
        let store = &self.ctx.store;
        if let Some(existing) = store.period_at(account_id, to_millis(now)).await? {
            return Ok((existing, false));
        }

        let period = current_period(now);
        let plan = self.ctx.resolve_plan(account_id).await?;
        let settings = self.ctx.credit_settings().await?;
        let base_tokens = settings.monthly_grant(plan);
        let previous = store
            .latest_period_ending_by(account_id, period.start_ms())
            .await?;
        let rollover_tokens = compute_rollover(previous.as_ref(), base_tokens);

        let new_period = NewAllowancePeriod {
            account_id: account_id.to_string(),
            period,
            tokens_granted: base_tokens.saturating_add(rollover_tokens),
            source: AllowanceSource::for_plan(plan),
            metadata: AllowanceMetadata {
                base_tokens: Some(base_tokens),
                rollover_tokens: Some(rollover_tokens),
                plan: Some(plan),
                created_by: None,
            },
            created_at_ms: to_millis(now),
        };

        let (record, created) = self.insert_or_read(new_period).await?;
        if created {
            tracing::debug!(
                account_id,
                plan = %plan,
                base_tokens,
                rollover_tokens,
                tokens_granted = record.tokens_granted,
                "allowance period created"
            );
        }
        Ok((record, created))
    }

    /// Inserts `new_period`; when another caller won the race, returns the
    /// winner's row instead.
    async fn insert_or_read(
        &self,
        new_period: NewAllowancePeriod,
    ) -> Result<(AllowancePeriodRecord, bool)> {
        let store = &self.ctx.store;
        let attempts = self.ctx.config.max_create_attempts.max(1);
        let account_id = new_period.account_id.clone();
        let start_ms = new_period.period.start_ms();

        for attempt in 1..=attempts {
            match store.insert_period(new_period.clone()).await? {
                PeriodInsert::Created(record) => {
                    self.ctx.metrics.record_period_created();
                    return Ok((record, true));
                }
                PeriodInsert::Conflict => {
                    self.ctx.metrics.record_creation_race_lost();
                    if let Some(winner) = store.period_starting(&account_id, start_ms).await? {
                        tracing::debug!(
                            account_id = %account_id,
                            period_id = winner.id,
                            "allowance creation race lost; using existing period"
                        );
                        return Ok((winner, false));
                    }
                    tracing::warn!(
                        account_id = %account_id,
                        attempt,
                        "allowance insert conflicted but the existing period was not readable"
                    );
                }
            }
        }

        Err(StoreError::Unavailable {
            message: format!(
                "allowance for {account_id} could not be created or read after {attempts} attempts"
            ),
        }
        .into())
    }

    /// Overwrites the current period's grant and usage, creating the period
    /// with these values when none exists yet. Logged as an
    /// `admin_adjustment` event carrying the actor and the signed change in
    /// `tokens_used`.
    #[tracing::instrument(
        skip_all,
        fields(account_id = %adjustment.account_id, actor = %adjustment.actor)
    )]
    pub async fn apply_admin_adjustment(
        &self,
        adjustment: AdminAdjustment,
    ) -> Result<AllowancePeriodRecord> {
        if !self.ctx.config.is_admin(&adjustment.actor) {
            return Err(LedgerError::Unauthorized {
                actor: adjustment.actor,
            });
        }
        let account_id = validate_account_id(&adjustment.account_id)?;
        let now = self.ctx.now();
        let store = &self.ctx.store;

        let current = match store.period_at(account_id, to_millis(now)).await? {
            Some(period) => period,
            None => {
                let plan = self.ctx.resolve_plan(account_id).await?;
                // Created empty; the adjustment below sets the explicit values
                // and logs them as a delta from zero.
                let new_period = NewAllowancePeriod {
                    account_id: account_id.to_string(),
                    period: current_period(now),
                    tokens_granted: 0,
                    source: AllowanceSource::AdminManual,
                    metadata: AllowanceMetadata {
                        plan: Some(plan),
                        created_by: Some(adjustment.actor.clone()),
                        ..AllowanceMetadata::default()
                    },
                    created_at_ms: to_millis(now),
                };
                self.insert_or_read(new_period).await?.0
            }
        };

        let settings = self.ctx.credit_settings().await?;
        let (updated, event) = store
            .adjust_period(PeriodAdjustment {
                period_id: current.id,
                new_granted: adjustment.tokens_granted,
                new_used: adjustment.tokens_used,
                actor: adjustment.actor.clone(),
                reason: adjustment.reason.clone(),
                idempotency_key: unique_key("admin"),
                tokens_per_credit: settings.tokens_per_credit,
                created_at_ms: to_millis(now),
            })
            .await?;
        self.ctx.metrics.record_admin_adjustment();

        tracing::info!(
            account_id,
            actor = %adjustment.actor,
            period_id = updated.id,
            event_id = event.id,
            previous_granted = current.tokens_granted,
            previous_used = current.tokens_used,
            tokens_granted = updated.tokens_granted,
            tokens_used = updated.tokens_used,
            "allowance adjusted"
        );
        Ok(updated)
    }

    /// Creates the current period for every active account that lacks one.
    /// A failure for one account is logged and reported without aborting the
    /// rest of the batch.
    #[tracing::instrument(skip_all)]
    pub async fn initialize_all_accounts(&self) -> Result<BatchInitReport> {
        let accounts = self.ctx.plans.active_accounts().await?;
        let now = self.ctx.now();
        let concurrency = self.ctx.config.init_concurrency.max(1);

        let this = self;
        let results: Vec<(String, Result<(AllowancePeriodRecord, bool)>)> =
            futures_util::stream::iter(accounts)
                .map(|account_id| async move {
                    let result = this.ensure_at(&account_id, now).await;
                    (account_id, result)
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut report = BatchInitReport::default();
        for (account_id, result) in results {
            match result {
                Ok((_, true)) => report.initialized.push(account_id),
                Ok((_, false)) => report.already_current += 1,
                Err(err) => {
                    tracing::warn!(
                        account_id = %account_id,
                        error = %err,
                        "allowance initialization failed"
                    );
                    report.failed.push(BatchInitFailure {
                        account_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        report.initialized.sort();
        report.failed.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        report.initialized_count = report.initialized.len();

        tracing::info!(
            initialized = report.initialized_count,
            already_current = report.already_current,
            failed = report.failed.len(),
            "allowance batch initialization finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Clock;
    use crate::ledger::PlanTier;
    use crate::ledger::settings::{SettingKey, SettingsProvider};
    use crate::ledger::store::LedgerStore;
    use crate::ledger::store_types::{ADMIN_ADJUSTMENT_FEATURE, PeriodInsert};
    use crate::ledger::testing::{Harness, harness};
    use crate::ledger::usage::ChargeRequest;
    use time::macros::datetime;

    async fn spend(h: &Harness, tokens: u64) {
        h.ledger
            .usage()
            .charge(ChargeRequest::new("guild-free", tokens, 0, "chat"))
            .await
            .expect("charge");
    }

    fn previous(granted: u64, used: u64) -> AllowancePeriodRecord {
        AllowancePeriodRecord {
            id: 1,
            account_id: "guild".to_string(),
            period_start_ms: 0,
            period_end_ms: 1,
            tokens_granted: granted,
            tokens_used: used,
            source: AllowanceSource::FreeTier,
            metadata: AllowanceMetadata::default(),
            low_balance_warned: false,
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn rollover_is_capped_at_one_base_grant() {
        assert_eq!(compute_rollover(Some(&previous(1000, 100)), 600), 600);
        assert_eq!(compute_rollover(Some(&previous(1000, 700)), 600), 300);
    }

    #[test]
    fn exhausted_or_missing_previous_period_rolls_nothing() {
        assert_eq!(compute_rollover(Some(&previous(1000, 1000)), 600), 0);
        assert_eq!(compute_rollover(Some(&previous(1000, 1500)), 600), 0);
        assert_eq!(compute_rollover(None, 600), 0);
    }

    #[tokio::test]
    async fn first_use_creates_period_with_base_grant() {
        let h = harness();
        let period = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("ensure");
        assert_eq!(period.tokens_granted, 60_000);
        assert_eq!(period.tokens_used, 0);
        assert_eq!(period.source, AllowanceSource::FreeTier);
        assert_eq!(period.metadata.base_tokens, Some(60_000));
        assert_eq!(period.metadata.rollover_tokens, Some(0));
        assert_eq!(period.metadata.plan, Some(PlanTier::Free));
        assert_eq!(period.period().start, datetime!(2026-10-01 00:00 UTC));

        let again = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("ensure again");
        assert_eq!(again, period);
        assert_eq!(h.ledger.metrics().periods_created, 1);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let h = harness();
        let err = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-missing")
            .await;
        assert!(matches!(err, Err(LedgerError::AccountNotFound { .. })));
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_exactly_one_period() {
        let h = harness();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let allowances = h.ledger.allowances();
            tasks.push(tokio::spawn(async move {
                allowances.ensure_current_allowance("guild-free").await
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.expect("join").expect("ensure").id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.store.period_count("guild-free").await, 1);
    }

    #[tokio::test]
    async fn rollover_uses_previous_remaining_capped_at_base() {
        let h = harness();
        h.settings
            .set_setting(SettingKey::TokensFreePerMonth, 1000)
            .await
            .expect("set");
        let first = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("ensure");
        spend(&h, 100).await;

        h.settings
            .set_setting(SettingKey::TokensFreePerMonth, 600)
            .await
            .expect("set");
        h.clock.set(datetime!(2026-11-02 09:00 UTC));
        let next = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("next month");
        assert_eq!(next.metadata.rollover_tokens, Some(600));
        assert_eq!(next.tokens_granted, 1200);

        // The October grant was not touched by the settings change.
        let october = h.store.period_by_id(first.id).await.expect("read");
        assert_eq!(october.map(|p| p.tokens_granted), Some(1000));
    }

    #[tokio::test]
    async fn exhausted_previous_period_rolls_over_nothing() {
        let h = harness();
        let first = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("ensure");
        spend(&h, first.tokens_granted).await;

        h.clock.set(datetime!(2026-11-01 00:00 UTC));
        let next = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("next month");
        assert_eq!(next.metadata.rollover_tokens, Some(0));
        assert_eq!(next.tokens_granted, 60_000);
    }

    #[tokio::test]
    async fn admin_created_period_feeds_next_rollover() {
        let h = harness();
        let adjusted = h
            .ledger
            .allowances()
            .apply_admin_adjustment(AdminAdjustment {
                account_id: "guild-free".to_string(),
                tokens_granted: 1000,
                tokens_used: 0,
                actor: "ops".to_string(),
                reason: Some("support credit".to_string()),
            })
            .await
            .expect("adjust");
        assert_eq!((adjusted.tokens_granted, adjusted.tokens_used), (1000, 0));
        assert_eq!(adjusted.source, AllowanceSource::AdminManual);

        h.clock.set(datetime!(2026-11-15 00:00 UTC));
        let next = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("next month");
        assert_eq!(next.metadata.rollover_tokens, Some(1000));
        assert_eq!(next.tokens_granted, 61_000);
    }

    #[tokio::test]
    async fn admin_adjustment_is_audited_with_signed_delta() {
        let h = harness();
        let period = h
            .ledger
            .allowances()
            .ensure_current_allowance("guild-free")
            .await
            .expect("ensure");
        spend(&h, 5000).await;

        let adjusted = h
            .ledger
            .allowances()
            .apply_admin_adjustment(AdminAdjustment {
                account_id: "guild-free".to_string(),
                tokens_granted: 70_000,
                tokens_used: 1000,
                actor: "ops".to_string(),
                reason: None,
            })
            .await
            .expect("adjust");
        assert_eq!(adjusted.id, period.id);
        assert_eq!(adjusted.tokens_granted, 70_000);

        let events = h.store.list_events("guild-free", 10).await.expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].feature, ADMIN_ADJUSTMENT_FEATURE);
        assert_eq!(events[0].total_tokens, -4000);
        assert_eq!(events[0].metadata.actor_id.as_deref(), Some("ops"));
        let detail = events[0].metadata.adjustment.clone().expect("detail");
        assert_eq!((detail.previous_granted, detail.previous_used), (60_000, 5000));
    }

    #[tokio::test]
    async fn admin_adjustment_requires_privileged_actor() {
        let h = harness();
        let err = h
            .ledger
            .allowances()
            .apply_admin_adjustment(AdminAdjustment {
                account_id: "guild-free".to_string(),
                tokens_granted: 1,
                tokens_used: 0,
                actor: "guild-moderator".to_string(),
                reason: None,
            })
            .await;
        assert!(matches!(err, Err(LedgerError::Unauthorized { .. })));
        assert_eq!(h.store.period_count("guild-free").await, 0);
    }

    #[tokio::test]
    async fn admin_adjustment_may_push_usage_past_grant() {
        let h = harness();
        let adjusted = h
            .ledger
            .allowances()
            .apply_admin_adjustment(AdminAdjustment {
                account_id: "guild-premium".to_string(),
                tokens_granted: 100,
                tokens_used: 250,
                actor: "ops".to_string(),
                reason: None,
            })
            .await
            .expect("adjust");
        assert_eq!(adjusted.tokens_used, 250);
        assert_eq!(adjusted.tokens_remaining(), 0);
    }

    #[tokio::test]
    async fn batch_initialization_creates_missing_periods_only() {
        let h = harness();
        h.plans.upsert("guild-idle", PlanTier::Free, false).await;
        h.ledger
            .allowances()
            .ensure_current_allowance("guild-premium")
            .await
            .expect("warm");

        let report = h
            .ledger
            .allowances()
            .initialize_all_accounts()
            .await
            .expect("init");
        assert_eq!(report.initialized, vec!["guild-free".to_string()]);
        assert_eq!(report.initialized_count, 1);
        assert_eq!(report.already_current, 1);
        assert!(report.failed.is_empty());
        assert_eq!(h.store.period_count("guild-idle").await, 0);

        let rerun = h
            .ledger
            .allowances()
            .initialize_all_accounts()
            .await
            .expect("rerun");
        assert_eq!(rerun.initialized_count, 0);
        assert_eq!(rerun.already_current, 2);
    }

    #[tokio::test]
    async fn conflicting_insert_returns_winner() {
        let h = harness();
        let period = current_period(h.clock.now());
        let winner = match h
            .store
            .insert_period(NewAllowancePeriod {
                account_id: "guild-free".to_string(),
                period,
                tokens_granted: 42,
                source: AllowanceSource::FreeTier,
                metadata: AllowanceMetadata::default(),
                created_at_ms: 0,
            })
            .await
            .expect("insert")
        {
            PeriodInsert::Created(record) => record,
            PeriodInsert::Conflict => panic!("unexpected conflict"),
        };

        let manager = h.ledger.allowances();
        let (record, created) = manager
            .insert_or_read(NewAllowancePeriod {
                account_id: "guild-free".to_string(),
                period,
                tokens_granted: 60_000,
                source: AllowanceSource::FreeTier,
                metadata: AllowanceMetadata::default(),
                created_at_ms: 0,
            })
            .await
            .expect("insert or read");
        assert!(!created);
        assert_eq!(record, winner);
        assert_eq!(h.ledger.metrics().creation_races_lost, 1);
    }
}
