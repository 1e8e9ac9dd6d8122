use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store::{LedgerStore, StoreError};
use super::store_types::{
    ADMIN_ADJUSTMENT_FEATURE, AdjustmentDetail, AllowancePeriodRecord, ChargeOutcome,
    NewAllowancePeriod, NewUsageEvent, PeriodAdjustment, PeriodInsert, Reconciliation,
    UsageEventMetadata, UsageEventRecord, credits_for, used_delta, used_from_event_total,
};

/// Process-local [`LedgerStore`]. Every operation runs under one lock, which
/// gives the same atomicity the durable backends get from transactions.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_period_id: i64,
    next_event_id: i64,
    periods: BTreeMap<i64, AllowancePeriodRecord>,
    period_index: HashMap<(String, i64), i64>,
    events: Vec<UsageEventRecord>,
    event_index: HashMap<(String, String), usize>,
    #[cfg(test)]
    drop_next_increment: bool,
}

impl MemoryState {
    fn period_mut(&mut self, period_id: i64) -> Result<&mut AllowancePeriodRecord, StoreError> {
        self.periods
            .get_mut(&period_id)
            .ok_or(StoreError::PeriodNotFound { period_id })
    }

    fn event_for_key(&self, account_id: &str, key: &str) -> Option<&UsageEventRecord> {
        self.event_index
            .get(&(account_id.to_string(), key.to_string()))
            .and_then(|index| self.events.get(*index))
    }

    fn push_event(&mut self, mut event: UsageEventRecord) -> UsageEventRecord {
        self.next_event_id += 1;
        event.id = self.next_event_id;
        self.event_index.insert(
            (event.account_id.clone(), event.idempotency_key.clone()),
            self.events.len(),
        );
        self.events.push(event.clone());
        event
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn period_count(&self, account_id: &str) -> usize {
        self.state
            .lock()
            .await
            .periods
            .values()
            .filter(|period| period.account_id == account_id)
            .count()
    }

    /// Makes the next accepted charge record its event but skip the
    /// running-total increment, as a backend that lost the second write would.
    #[cfg(test)]
    pub(crate) async fn drop_next_increment(&self) {
        self.state.lock().await.drop_next_increment = true;
    }

    /// Logs `event` without touching the running total, reproducing a
    /// backend that lost the increment after the event write.
    #[cfg(test)]
    pub(crate) async fn append_event_only(
        &self,
        period_id: i64,
        event: NewUsageEvent,
    ) -> Result<UsageEventRecord, StoreError> {
        let mut state = self.state.lock().await;
        let period = state.period_mut(period_id)?.clone();
        let total = event.total_tokens();
        let record = event_record(
            period_id,
            &event,
            total as i64,
            period.tokens_used.saturating_add(total),
            period.tokens_granted,
        );
        Ok(state.push_event(record))
    }
}

fn event_record(
    period_id: i64,
    event: &NewUsageEvent,
    total_tokens: i64,
    tokens_used_after: u64,
    tokens_granted_after: u64,
) -> UsageEventRecord {
    UsageEventRecord {
        id: 0,
        account_id: event.account_id.clone(),
        period_id,
        idempotency_key: event.idempotency_key.clone(),
        prompt_tokens: event.prompt_tokens,
        completion_tokens: event.completion_tokens,
        total_tokens,
        credits_charged: credits_for(total_tokens, event.tokens_per_credit),
        tokens_per_credit: event.tokens_per_credit,
        feature: event.feature.clone(),
        tokens_used_after,
        tokens_granted_after,
        metadata: event.metadata.clone(),
        created_at_ms: event.created_at_ms,
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn period_at(
        &self,
        account_id: &str,
        at_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .periods
            .values()
            .find(|period| {
                period.account_id == account_id
                    && period.period_start_ms <= at_ms
                    && at_ms < period.period_end_ms
            })
            .cloned())
    }

    async fn period_starting(
        &self,
        account_id: &str,
        start_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .period_index
            .get(&(account_id.to_string(), start_ms))
            .and_then(|id| state.periods.get(id))
            .cloned())
    }

    async fn latest_period_ending_by(
        &self,
        account_id: &str,
        end_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .periods
            .values()
            .filter(|period| period.account_id == account_id && period.period_end_ms <= end_ms)
            .max_by_key(|period| period.period_end_ms)
            .cloned())
    }

    async fn period_by_id(
        &self,
        period_id: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        Ok(self.state.lock().await.periods.get(&period_id).cloned())
    }

    async fn insert_period(&self, period: NewAllowancePeriod) -> Result<PeriodInsert, StoreError> {
        let mut state = self.state.lock().await;
        let index_key = (period.account_id.clone(), period.period.start_ms());
        if state.period_index.contains_key(&index_key) {
            return Ok(PeriodInsert::Conflict);
        }

        state.next_period_id += 1;
        let record = AllowancePeriodRecord {
            id: state.next_period_id,
            account_id: period.account_id,
            period_start_ms: period.period.start_ms(),
            period_end_ms: period.period.end_ms(),
            tokens_granted: period.tokens_granted,
            tokens_used: 0,
            source: period.source,
            metadata: period.metadata,
            low_balance_warned: false,
            created_at_ms: period.created_at_ms,
            updated_at_ms: period.created_at_ms,
        };
        state.period_index.insert(index_key, record.id);
        state.periods.insert(record.id, record.clone());
        Ok(PeriodInsert::Created(record))
    }

    async fn find_event(
        &self,
        account_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.event_for_key(account_id, idempotency_key).cloned())
    }

    async fn record_charge(
        &self,
        period_id: i64,
        event: NewUsageEvent,
    ) -> Result<ChargeOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.event_for_key(&event.account_id, &event.idempotency_key) {
            return Ok(ChargeOutcome::Duplicate(existing.clone()));
        }

        let total = event.total_tokens();
        let period = state.period_mut(period_id)?;
        let projected = period.tokens_used.saturating_add(total);
        if projected > period.tokens_granted {
            return Ok(ChargeOutcome::Insufficient(period.clone()));
        }

        #[cfg(test)]
        if std::mem::take(&mut state.drop_next_increment) {
            let granted = state.period_mut(period_id)?.tokens_granted;
            let record = event_record(
                period_id,
                &event,
                i64::try_from(total).unwrap_or(i64::MAX),
                projected,
                granted,
            );
            let event = state.push_event(record);
            return Ok(ChargeOutcome::RecordedWithoutIncrement {
                event,
                reason: "running total update dropped".to_string(),
            });
        }

        let period = state.period_mut(period_id)?;
        period.tokens_used = projected;
        period.updated_at_ms = event.created_at_ms;
        let period = period.clone();

        let record = event_record(
            period_id,
            &event,
            i64::try_from(total).unwrap_or(i64::MAX),
            period.tokens_used,
            period.tokens_granted,
        );
        let event = state.push_event(record);
        Ok(ChargeOutcome::Charged { event, period })
    }

    async fn adjust_period(
        &self,
        adjustment: PeriodAdjustment,
    ) -> Result<(AllowancePeriodRecord, UsageEventRecord), StoreError> {
        let mut state = self.state.lock().await;
        let period = state.period_mut(adjustment.period_id)?;
        let detail = AdjustmentDetail {
            previous_granted: period.tokens_granted,
            previous_used: period.tokens_used,
            new_granted: adjustment.new_granted,
            new_used: adjustment.new_used,
            reason: adjustment.reason.clone(),
        };
        period.tokens_granted = adjustment.new_granted;
        period.tokens_used = adjustment.new_used;
        period.updated_at_ms = adjustment.created_at_ms;
        let period = period.clone();

        let delta = used_delta(detail.previous_used, detail.new_used);
        let event = NewUsageEvent {
            account_id: period.account_id.clone(),
            idempotency_key: adjustment.idempotency_key,
            prompt_tokens: 0,
            completion_tokens: 0,
            tokens_per_credit: adjustment.tokens_per_credit,
            feature: ADMIN_ADJUSTMENT_FEATURE.to_string(),
            metadata: UsageEventMetadata {
                actor_id: Some(adjustment.actor),
                adjustment: Some(detail),
                ..UsageEventMetadata::default()
            },
            created_at_ms: adjustment.created_at_ms,
        };
        let record = event_record(
            period.id,
            &event,
            delta,
            period.tokens_used,
            period.tokens_granted,
        );
        let event = state.push_event(record);
        Ok((period, event))
    }

    async fn list_events(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEventRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|event| event.account_id == account_id)
            .take(limit.max(1))
            .cloned()
            .collect())
    }

    async fn reconcile_period(
        &self,
        period_id: i64,
        updated_at_ms: i64,
    ) -> Result<Reconciliation, StoreError> {
        let mut state = self.state.lock().await;
        let total = state
            .events
            .iter()
            .filter(|event| event.period_id == period_id)
            .fold(0i64, |acc, event| acc.saturating_add(event.total_tokens));
        let period = state.period_mut(period_id)?;
        let previous_used = period.tokens_used;
        period.tokens_used = used_from_event_total(total);
        if period.tokens_used != previous_used {
            period.updated_at_ms = updated_at_ms;
        }
        Ok(Reconciliation {
            previous_used,
            period: period.clone(),
        })
    }

    async fn mark_low_balance_warned(&self, period_id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let period = state.period_mut(period_id)?;
        if period.low_balance_warned {
            return Ok(false);
        }
        period.low_balance_warned = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::period::current_period;
    use crate::ledger::store_types::{AllowanceMetadata, AllowanceSource};
    use time::macros::datetime;

    fn new_period(account_id: &str, granted: u64) -> NewAllowancePeriod {
        NewAllowancePeriod {
            account_id: account_id.to_string(),
            period: current_period(datetime!(2026-10-19 12:00 UTC)),
            tokens_granted: granted,
            source: AllowanceSource::FreeTier,
            metadata: AllowanceMetadata::default(),
            created_at_ms: 1,
        }
    }

    fn charge(account_id: &str, key: &str, tokens: u64) -> NewUsageEvent {
        NewUsageEvent {
            account_id: account_id.to_string(),
            idempotency_key: key.to_string(),
            prompt_tokens: tokens,
            completion_tokens: 0,
            tokens_per_credit: 10,
            feature: "chat".to_string(),
            metadata: UsageEventMetadata::default(),
            created_at_ms: 2,
        }
    }

    async fn created(store: &MemoryStore, period: NewAllowancePeriod) -> AllowancePeriodRecord {
        match store.insert_period(period).await.expect("insert") {
            PeriodInsert::Created(record) => record,
            PeriodInsert::Conflict => panic!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn second_insert_for_same_month_conflicts() {
        let store = MemoryStore::new();
        created(&store, new_period("guild", 100)).await;
        let second = store.insert_period(new_period("guild", 100)).await.expect("insert");
        assert_eq!(second, PeriodInsert::Conflict);
        assert_eq!(store.period_count("guild").await, 1);
    }

    #[tokio::test]
    async fn charges_enforce_grant_and_dedupe_keys() {
        let store = MemoryStore::new();
        let period = created(&store, new_period("guild", 100)).await;

        let outcome = store
            .record_charge(period.id, charge("guild", "k1", 60))
            .await
            .expect("charge");
        assert!(matches!(outcome, ChargeOutcome::Charged { ref period, .. } if period.tokens_used == 60));

        let outcome = store
            .record_charge(period.id, charge("guild", "k1", 60))
            .await
            .expect("replay");
        assert!(matches!(outcome, ChargeOutcome::Duplicate(ref event) if event.total_tokens == 60));

        let outcome = store
            .record_charge(period.id, charge("guild", "k2", 41))
            .await
            .expect("over");
        assert!(matches!(outcome, ChargeOutcome::Insufficient(ref period) if period.tokens_used == 60));

        assert_eq!(store.list_events("guild", 10).await.expect("events").len(), 1);
        let reconciled = store.reconcile_period(period.id, 3).await.expect("reconcile");
        assert_eq!(reconciled.previous_used, 60);
        assert_eq!(reconciled.period.tokens_used, 60);
    }

    #[tokio::test]
    async fn adjustment_logs_signed_delta() {
        let store = MemoryStore::new();
        let period = created(&store, new_period("guild", 100)).await;
        store
            .record_charge(period.id, charge("guild", "k1", 80))
            .await
            .expect("charge");

        let (updated, event) = store
            .adjust_period(PeriodAdjustment {
                period_id: period.id,
                new_granted: 500,
                new_used: 30,
                actor: "ops".to_string(),
                reason: None,
                idempotency_key: "admin-1".to_string(),
                tokens_per_credit: 10,
                created_at_ms: 3,
            })
            .await
            .expect("adjust");
        assert_eq!((updated.tokens_granted, updated.tokens_used), (500, 30));
        assert_eq!(event.total_tokens, -50);
        assert_eq!(event.feature, ADMIN_ADJUSTMENT_FEATURE);
        let reconciled = store.reconcile_period(period.id, 4).await.expect("reconcile");
        assert_eq!(reconciled.period.tokens_used, 30);
    }

    #[tokio::test]
    async fn low_balance_flag_flips_once() {
        let store = MemoryStore::new();
        let period = created(&store, new_period("guild", 100)).await;
        assert!(store.mark_low_balance_warned(period.id).await.expect("mark"));
        assert!(!store.mark_low_balance_warned(period.id).await.expect("mark again"));
    }

    #[test]
    fn used_delta_is_signed() {
        assert_eq!(used_delta(10, 4), -6);
        assert_eq!(used_delta(4, 10), 6);
        assert_eq!(used_delta(0, u64::MAX), i64::MAX);
    }
}
