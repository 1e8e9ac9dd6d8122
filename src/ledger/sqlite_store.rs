use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};

use super::plan::{PlanResolver, PlanTier};
use super::settings::{CreditSettings, SettingKey, SettingsProvider};
use super::store::{LedgerStore, StoreError};
use super::store_types::{
    ADMIN_ADJUSTMENT_FEATURE, AdjustmentDetail, AllowanceMetadata, AllowancePeriodRecord,
    AllowanceSource, ChargeOutcome, NewAllowancePeriod, NewUsageEvent, PeriodAdjustment,
    PeriodInsert, Reconciliation, UsageEventMetadata, UsageEventRecord, credits_for, used_delta,
    used_from_event_total,
};

const PERIOD_COLUMNS: &str = "id, account_id, period_start_ms, period_end_ms, tokens_granted, \
     tokens_used, source, metadata_json, low_balance_warned, created_at_ms, updated_at_ms";

const EVENT_COLUMNS: &str = "id, account_id, period_id, idempotency_key, prompt_tokens, \
     completion_tokens, total_tokens, credits_charged, tokens_per_credit, feature, \
     tokens_used_after, tokens_granted_after, metadata_json, created_at_ms";

/// Durable ledger backed by one SQLite file.
///
/// Uniqueness of periods and idempotency keys is enforced by table
/// constraints; every write runs in an `IMMEDIATE` transaction so the
/// balance check and the increment cannot interleave with another writer,
/// including writers in other processes sharing the file.
///
/// The same file also holds credit settings overrides and the account
/// registry, so one `SqliteStore` can serve as store, settings provider and
/// plan resolver.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
    defaults: CreditSettings,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            defaults: CreditSettings::default(),
        }
    }

    /// Values reported for settings that have no stored override.
    pub fn with_defaults(mut self, defaults: CreditSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.blocking(|_conn| Ok(())).await
    }

    /// Registers or updates an account and its plan. Inactive accounts keep
    /// resolving their plan but are skipped by batch initialization.
    pub async fn upsert_account(
        &self,
        account_id: &str,
        plan: PlanTier,
        active: bool,
    ) -> Result<(), StoreError> {
        let account_id = account_id.to_string();
        let ts_ms = now_millis();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO accounts (account_id, plan, active, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account_id) DO UPDATE SET
                     plan = excluded.plan,
                     active = excluded.active,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![account_id, plan.as_str(), active, ts_ms],
            )?;
            Ok(())
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn period_at(
        &self,
        account_id: &str,
        at_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {PERIOD_COLUMNS} FROM allowance_periods
                         WHERE account_id = ?1 AND period_start_ms <= ?2 AND ?2 < period_end_ms
                         ORDER BY period_start_ms DESC
                         LIMIT 1"
                    ),
                    rusqlite::params![account_id, at_ms],
                    PeriodRow::from_row,
                )
                .optional()?;
            row.map(PeriodRow::into_record).transpose()
        })
        .await
    }

    async fn period_starting(
        &self,
        account_id: &str,
        start_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {PERIOD_COLUMNS} FROM allowance_periods
                         WHERE account_id = ?1 AND period_start_ms = ?2"
                    ),
                    rusqlite::params![account_id, start_ms],
                    PeriodRow::from_row,
                )
                .optional()?;
            row.map(PeriodRow::into_record).transpose()
        })
        .await
    }

    async fn latest_period_ending_by(
        &self,
        account_id: &str,
        end_ms: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {PERIOD_COLUMNS} FROM allowance_periods
                         WHERE account_id = ?1 AND period_end_ms <= ?2
                         ORDER BY period_end_ms DESC
                         LIMIT 1"
                    ),
                    rusqlite::params![account_id, end_ms],
                    PeriodRow::from_row,
                )
                .optional()?;
            row.map(PeriodRow::into_record).transpose()
        })
        .await
    }

    async fn period_by_id(
        &self,
        period_id: i64,
    ) -> Result<Option<AllowancePeriodRecord>, StoreError> {
        self.blocking(move |conn| read_period(conn, period_id)).await
    }

    async fn insert_period(&self, period: NewAllowancePeriod) -> Result<PeriodInsert, StoreError> {
        let metadata_json = serde_json::to_string(&period.metadata)?;
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO allowance_periods (
                     account_id, period_start_ms, period_end_ms, tokens_granted, tokens_used,
                     source, metadata_json, low_balance_warned, created_at_ms, updated_at_ms
                 )
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, 0, ?7, ?7)
                 ON CONFLICT(account_id, period_start_ms) DO NOTHING",
                rusqlite::params![
                    period.account_id,
                    period.period.start_ms(),
                    period.period.end_ms(),
                    u64_to_i64(period.tokens_granted),
                    period.source.as_str(),
                    metadata_json,
                    period.created_at_ms,
                ],
            )?;
            if inserted == 0 {
                return Ok(PeriodInsert::Conflict);
            }
            let id = conn.last_insert_rowid();
            match read_period(conn, id)? {
                Some(record) => Ok(PeriodInsert::Created(record)),
                None => Err(StoreError::PeriodNotFound { period_id: id }),
            }
        })
        .await
    }

    async fn find_event(
        &self,
        account_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<UsageEventRecord>, StoreError> {
        let account_id = account_id.to_string();
        let idempotency_key = idempotency_key.to_string();
        self.blocking(move |conn| read_event_by_key(conn, &account_id, &idempotency_key))
            .await
    }

    async fn record_charge(
        &self,
        period_id: i64,
        event: NewUsageEvent,
    ) -> Result<ChargeOutcome, StoreError> {
        let metadata_json = serde_json::to_string(&event.metadata)?;
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(existing) =
                read_event_by_key(&tx, &event.account_id, &event.idempotency_key)?
            {
                return Ok(ChargeOutcome::Duplicate(existing));
            }

            let total = event.total_tokens();
            let total_i64 = u64_to_i64(total);
            let updated = tx.execute(
                "UPDATE allowance_periods
                 SET tokens_used = tokens_used + ?2,
                     updated_at_ms = ?3
                 WHERE id = ?1 AND tokens_used + ?2 <= tokens_granted",
                rusqlite::params![period_id, total_i64, event.created_at_ms],
            )?;
            let period = read_period(&tx, period_id)?
                .ok_or(StoreError::PeriodNotFound { period_id })?;
            if updated == 0 {
                return Ok(ChargeOutcome::Insufficient(period));
            }

            tx.execute(
                "INSERT INTO usage_events (
                     account_id, period_id, idempotency_key, prompt_tokens, completion_tokens,
                     total_tokens, credits_charged, tokens_per_credit, feature,
                     tokens_used_after, tokens_granted_after, metadata_json, created_at_ms
                 )
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                rusqlite::params![
                    event.account_id,
                    period_id,
                    event.idempotency_key,
                    u64_to_i64(event.prompt_tokens),
                    u64_to_i64(event.completion_tokens),
                    total_i64,
                    credits_for(total_i64, event.tokens_per_credit),
                    u64_to_i64(event.tokens_per_credit),
                    event.feature,
                    u64_to_i64(period.tokens_used),
                    u64_to_i64(period.tokens_granted),
                    metadata_json,
                    event.created_at_ms,
                ],
            )?;
            let event_id = tx.last_insert_rowid();
            let record = read_event(&tx, event_id)?.ok_or_else(|| StoreError::Corrupt {
                message: format!("usage event {event_id} vanished after insert"),
            })?;
            tx.commit()?;
            Ok(ChargeOutcome::Charged {
                event: record,
                period,
            })
        })
        .await
    }

    async fn adjust_period(
        &self,
        adjustment: PeriodAdjustment,
    ) -> Result<(AllowancePeriodRecord, UsageEventRecord), StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let period_id = adjustment.period_id;
            let current =
                read_period(&tx, period_id)?.ok_or(StoreError::PeriodNotFound { period_id })?;

            tx.execute(
                "UPDATE allowance_periods
                 SET tokens_granted = ?2, tokens_used = ?3, updated_at_ms = ?4
                 WHERE id = ?1",
                rusqlite::params![
                    period_id,
                    u64_to_i64(adjustment.new_granted),
                    u64_to_i64(adjustment.new_used),
                    adjustment.created_at_ms,
                ],
            )?;

            let delta = used_delta(current.tokens_used, adjustment.new_used);
            let metadata = UsageEventMetadata {
                actor_id: Some(adjustment.actor),
                adjustment: Some(AdjustmentDetail {
                    previous_granted: current.tokens_granted,
                    previous_used: current.tokens_used,
                    new_granted: adjustment.new_granted,
                    new_used: adjustment.new_used,
                    reason: adjustment.reason,
                }),
                ..UsageEventMetadata::default()
            };
            tx.execute(
                "INSERT INTO usage_events (
                     account_id, period_id, idempotency_key, prompt_tokens, completion_tokens,
                     total_tokens, credits_charged, tokens_per_credit, feature,
                     tokens_used_after, tokens_granted_after, metadata_json, created_at_ms
                 )
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    current.account_id,
                    period_id,
                    adjustment.idempotency_key,
                    delta,
                    credits_for(delta, adjustment.tokens_per_credit),
                    u64_to_i64(adjustment.tokens_per_credit),
                    ADMIN_ADJUSTMENT_FEATURE,
                    u64_to_i64(adjustment.new_used),
                    u64_to_i64(adjustment.new_granted),
                    serde_json::to_string(&metadata)?,
                    adjustment.created_at_ms,
                ],
            )?;
            let event_id = tx.last_insert_rowid();

            let period =
                read_period(&tx, period_id)?.ok_or(StoreError::PeriodNotFound { period_id })?;
            let event = read_event(&tx, event_id)?.ok_or_else(|| StoreError::Corrupt {
                message: format!("adjustment event {event_id} vanished after insert"),
            })?;
            tx.commit()?;
            Ok((period, event))
        })
        .await
    }

    async fn list_events(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<UsageEventRecord>, StoreError> {
        let account_id = account_id.to_string();
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM usage_events
                 WHERE account_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2"
            ))?;
            let rows = stmt.query_map(rusqlite::params![account_id, limit], EventRow::from_row)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?.into_record()?);
            }
            Ok(out)
        })
        .await
    }

    async fn reconcile_period(
        &self,
        period_id: i64,
        updated_at_ms: i64,
    ) -> Result<Reconciliation, StoreError> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current =
                read_period(&tx, period_id)?.ok_or(StoreError::PeriodNotFound { period_id })?;
            let total: i64 = tx.query_row(
                "SELECT COALESCE(SUM(total_tokens), 0) FROM usage_events WHERE period_id = ?1",
                rusqlite::params![period_id],
                |row| row.get(0),
            )?;
            let reconciled = used_from_event_total(total);
            if reconciled != current.tokens_used {
                tx.execute(
                    "UPDATE allowance_periods
                     SET tokens_used = ?2, updated_at_ms = ?3
                     WHERE id = ?1",
                    rusqlite::params![period_id, u64_to_i64(reconciled), updated_at_ms],
                )?;
            }
            let period =
                read_period(&tx, period_id)?.ok_or(StoreError::PeriodNotFound { period_id })?;
            tx.commit()?;
            Ok(Reconciliation {
                previous_used: current.tokens_used,
                period,
            })
        })
        .await
    }

    async fn mark_low_balance_warned(&self, period_id: i64) -> Result<bool, StoreError> {
        self.blocking(move |conn| {
            let updated = conn.execute(
                "UPDATE allowance_periods SET low_balance_warned = 1
                 WHERE id = ?1 AND low_balance_warned = 0",
                rusqlite::params![period_id],
            )?;
            if updated == 1 {
                return Ok(true);
            }
            match read_period(conn, period_id)? {
                Some(_) => Ok(false),
                None => Err(StoreError::PeriodNotFound { period_id }),
            }
        })
        .await
    }
}

#[async_trait]
impl SettingsProvider for SqliteStore {
    async fn credit_settings(&self) -> Result<CreditSettings, StoreError> {
        let defaults = self.defaults;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM credit_settings ORDER BY key")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut overrides = Vec::new();
            for row in rows {
                let (raw_key, value) = row?;
                match raw_key.parse::<SettingKey>() {
                    Ok(key) => overrides.push((key, i64_to_u64(value))),
                    Err(err) => tracing::warn!(error = %err, "ignoring stored credit setting"),
                }
            }
            Ok(CreditSettings::with_overrides(defaults, overrides))
        })
        .await
    }

    async fn set_setting(&self, key: SettingKey, value: u64) -> Result<(), StoreError> {
        if key == SettingKey::TokensPerCredit && value == 0 {
            return Err(StoreError::Rejected {
                message: "tokens_per_credit must be at least 1".to_string(),
            });
        }
        let ts_ms = now_millis();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO credit_settings (key, value, updated_at_ms)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at_ms = excluded.updated_at_ms",
                rusqlite::params![key.as_str(), u64_to_i64(value), ts_ms],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PlanResolver for SqliteStore {
    async fn plan_for(&self, account_id: &str) -> Result<Option<PlanTier>, StoreError> {
        let account_id = account_id.to_string();
        self.blocking(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT plan FROM accounts WHERE account_id = ?1",
                    rusqlite::params![account_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| {
                PlanTier::parse(&raw).ok_or_else(|| StoreError::Corrupt {
                    message: format!("unknown plan `{raw}` for account {account_id}"),
                })
            })
            .transpose()
        })
        .await
    }

    async fn active_accounts(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT account_id FROM accounts WHERE active = 1 ORDER BY account_id")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

struct PeriodRow {
    id: i64,
    account_id: String,
    period_start_ms: i64,
    period_end_ms: i64,
    tokens_granted: i64,
    tokens_used: i64,
    source: String,
    metadata_json: String,
    low_balance_warned: bool,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl PeriodRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            period_start_ms: row.get(2)?,
            period_end_ms: row.get(3)?,
            tokens_granted: row.get(4)?,
            tokens_used: row.get(5)?,
            source: row.get(6)?,
            metadata_json: row.get(7)?,
            low_balance_warned: row.get(8)?,
            created_at_ms: row.get(9)?,
            updated_at_ms: row.get(10)?,
        })
    }

    fn into_record(self) -> Result<AllowancePeriodRecord, StoreError> {
        let source = AllowanceSource::parse(&self.source).ok_or_else(|| StoreError::Corrupt {
            message: format!("unknown allowance source `{}`", self.source),
        })?;
        let metadata: AllowanceMetadata = serde_json::from_str(&self.metadata_json)?;
        Ok(AllowancePeriodRecord {
            id: self.id,
            account_id: self.account_id,
            period_start_ms: self.period_start_ms,
            period_end_ms: self.period_end_ms,
            tokens_granted: i64_to_u64(self.tokens_granted),
            tokens_used: i64_to_u64(self.tokens_used),
            source,
            metadata,
            low_balance_warned: self.low_balance_warned,
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

struct EventRow {
    id: i64,
    account_id: String,
    period_id: i64,
    idempotency_key: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    credits_charged: f64,
    tokens_per_credit: i64,
    feature: String,
    tokens_used_after: i64,
    tokens_granted_after: i64,
    metadata_json: String,
    created_at_ms: i64,
}

impl EventRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            period_id: row.get(2)?,
            idempotency_key: row.get(3)?,
            prompt_tokens: row.get(4)?,
            completion_tokens: row.get(5)?,
            total_tokens: row.get(6)?,
            credits_charged: row.get(7)?,
            tokens_per_credit: row.get(8)?,
            feature: row.get(9)?,
            tokens_used_after: row.get(10)?,
            tokens_granted_after: row.get(11)?,
            metadata_json: row.get(12)?,
            created_at_ms: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<UsageEventRecord, StoreError> {
        Ok(UsageEventRecord {
            id: self.id,
            account_id: self.account_id,
            period_id: self.period_id,
            idempotency_key: self.idempotency_key,
            prompt_tokens: i64_to_u64(self.prompt_tokens),
            completion_tokens: i64_to_u64(self.completion_tokens),
            total_tokens: self.total_tokens,
            credits_charged: self.credits_charged,
            tokens_per_credit: i64_to_u64(self.tokens_per_credit),
            feature: self.feature,
            tokens_used_after: i64_to_u64(self.tokens_used_after),
            tokens_granted_after: i64_to_u64(self.tokens_granted_after),
            metadata: serde_json::from_str(&self.metadata_json)?,
            created_at_ms: self.created_at_ms,
        })
    }
}

fn read_period(
    conn: &rusqlite::Connection,
    period_id: i64,
) -> Result<Option<AllowancePeriodRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {PERIOD_COLUMNS} FROM allowance_periods WHERE id = ?1"),
            rusqlite::params![period_id],
            PeriodRow::from_row,
        )
        .optional()?;
    row.map(PeriodRow::into_record).transpose()
}

fn read_event(
    conn: &rusqlite::Connection,
    event_id: i64,
) -> Result<Option<UsageEventRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM usage_events WHERE id = ?1"),
            rusqlite::params![event_id],
            EventRow::from_row,
        )
        .optional()?;
    row.map(EventRow::into_record).transpose()
}

fn read_event_by_key(
    conn: &rusqlite::Connection,
    account_id: &str,
    idempotency_key: &str,
) -> Result<Option<UsageEventRecord>, StoreError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM usage_events
                 WHERE account_id = ?1 AND idempotency_key = ?2"
            ),
            rusqlite::params![account_id, idempotency_key],
            EventRow::from_row,
        )
        .optional()?;
    row.map(EventRow::into_record).transpose()
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS allowance_periods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            period_start_ms INTEGER NOT NULL,
            period_end_ms INTEGER NOT NULL,
            tokens_granted INTEGER NOT NULL,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            source TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            low_balance_warned INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL,
            UNIQUE(account_id, period_start_ms)
        );
        CREATE INDEX IF NOT EXISTS idx_allowance_periods_account_end
            ON allowance_periods(account_id, period_end_ms);

        CREATE TABLE IF NOT EXISTS usage_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            period_id INTEGER NOT NULL REFERENCES allowance_periods(id),
            idempotency_key TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            credits_charged REAL NOT NULL,
            tokens_per_credit INTEGER NOT NULL,
            feature TEXT NOT NULL,
            tokens_used_after INTEGER NOT NULL,
            tokens_granted_after INTEGER NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(account_id, idempotency_key)
        );
        CREATE INDEX IF NOT EXISTS idx_usage_events_period_id
            ON usage_events(period_id);

        CREATE TABLE IF NOT EXISTS credit_settings (
            key TEXT PRIMARY KEY NOT NULL,
            value INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY NOT NULL,
            plan TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
