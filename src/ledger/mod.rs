//! Allowance and usage ledger.

pub mod allowance;
pub mod config;
pub mod idempotency;
pub mod memory_store;
pub mod observability;
pub mod period;
pub mod plan;
pub mod settings;
pub mod status;
pub mod store;
pub mod store_types;
pub mod usage;

#[cfg(feature = "server")]
pub mod http;
#[cfg(feature = "store-sqlite")]
mod sqlite_store;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use time::OffsetDateTime;

use crate::error::{LedgerError, Result};

pub use allowance::{AdminAdjustment, AllowanceManager, BatchInitFailure, BatchInitReport};
pub use config::{ConfigError, LedgerConfig};
pub use memory_store::MemoryStore;
pub use observability::{LedgerMetrics, MetricsSnapshot};
pub use period::{Period, current_period};
pub use plan::{PlanResolver, PlanTier, StaticPlanResolver};
pub use settings::{CreditSettings, SettingKey, SettingsProvider, StaticSettings};
pub use status::{AllowanceSnapshot, StatusReader};
pub use store::{LedgerStore, StoreError};
pub use store_types::{
    AllowanceMetadata, AllowancePeriodRecord, AllowanceSource, UsageEventMetadata,
    UsageEventRecord,
};
pub use usage::{ChargeRequest, ChargeResult, UsageLedger};

#[cfg(feature = "store-sqlite")]
pub use sqlite_store::SqliteStore;

/// Source of "now" for period boundaries and record timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now_ms: AtomicI64::new(period::to_millis(now)),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        self.now_ms.store(period::to_millis(now), Ordering::SeqCst);
    }

    pub fn advance(&self, by: time::Duration) {
        let millis = by.whole_milliseconds();
        let delta = i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX });
        let _ = self
            .now_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(delta))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        period::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
}

pub(crate) struct LedgerContext {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) settings: Arc<dyn SettingsProvider>,
    pub(crate) plans: Arc<dyn PlanResolver>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: LedgerConfig,
    pub(crate) metrics: LedgerMetrics,
}

impl LedgerContext {
    pub(crate) fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub(crate) async fn resolve_plan(&self, account_id: &str) -> Result<PlanTier> {
        self.plans
            .plan_for(account_id)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound {
                account_id: account_id.to_string(),
            })
    }

    pub(crate) async fn credit_settings(&self) -> Result<CreditSettings> {
        let settings = self.settings.credit_settings().await?;
        Ok(CreditSettings::with_overrides(settings, []))
    }
}

pub(crate) fn validate_account_id(account_id: &str) -> Result<&str> {
    if account_id.trim().is_empty() {
        return Err(LedgerError::invalid("account_id must not be empty"));
    }
    if account_id.len() > 256 {
        return Err(LedgerError::invalid("account_id is longer than 256 bytes"));
    }
    Ok(account_id)
}

/// Entry point wiring the allowance manager, usage ledger and status reader
/// to one store, settings provider, plan resolver and clock.
#[derive(Clone)]
pub struct Ledger {
    ctx: Arc<LedgerContext>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsProvider>,
        plans: Arc<dyn PlanResolver>,
    ) -> Self {
        Self::with_parts(
            store,
            settings,
            plans,
            Arc::new(SystemClock),
            LedgerConfig::default(),
        )
    }

    pub fn with_parts(
        store: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsProvider>,
        plans: Arc<dyn PlanResolver>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(LedgerContext {
                store,
                settings,
                plans,
                clock,
                config,
                metrics: LedgerMetrics::default(),
            }),
        }
    }

    pub fn allowances(&self) -> AllowanceManager {
        AllowanceManager::new(self.ctx.clone())
    }

    pub fn usage(&self) -> UsageLedger {
        UsageLedger::new(self.ctx.clone())
    }

    pub fn status(&self) -> StatusReader {
        StatusReader::new(self.ctx.clone())
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub async fn credit_settings(&self) -> Result<CreditSettings> {
        self.ctx.credit_settings().await
    }

    /// Changes a setting for periods created from now on.
    pub async fn set_setting(&self, key: SettingKey, value: u64) -> Result<()> {
        match self.ctx.settings.set_setting(key, value).await {
            Ok(()) => {
                tracing::info!(setting = %key, value, "credit setting updated");
                Ok(())
            }
            Err(StoreError::Rejected { message }) => Err(LedgerError::invalid(message)),
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("config", &self.ctx.config)
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(datetime!(2026-10-31 23:59 UTC));
        assert_eq!(clock.now(), datetime!(2026-10-31 23:59 UTC));
        clock.advance(time::Duration::minutes(2));
        assert_eq!(clock.now(), datetime!(2026-11-01 00:01 UTC));
        clock.set(datetime!(2027-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2027-01-01 00:00 UTC));
    }

    #[test]
    fn manual_clock_advance_saturates() {
        let clock = ManualClock::new(datetime!(2026-10-19 12:00 UTC));
        clock.advance(time::Duration::MAX);
        assert_eq!(clock.now_ms.load(Ordering::SeqCst), i64::MAX);
        clock.advance(time::Duration::seconds(1));
        assert_eq!(clock.now_ms.load(Ordering::SeqCst), i64::MAX);
    }

    #[test]
    fn blank_account_ids_are_rejected() {
        assert!(validate_account_id("guild-1").is_ok());
        assert!(matches!(
            validate_account_id("  "),
            Err(LedgerError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn zero_conversion_rate_setting_is_invalid_input() {
        let h = testing::harness();
        let err = h.ledger.set_setting(SettingKey::TokensPerCredit, 0).await;
        assert!(matches!(err, Err(LedgerError::InvalidInput { .. })));
    }
}
