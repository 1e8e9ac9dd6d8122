#![cfg(feature = "store-sqlite")]

use std::sync::Arc;

use allowance_ledger::ledger::{
    AdminAdjustment, AllowanceSource, Ledger, LedgerConfig, LedgerStore, ManualClock, PlanTier,
    SettingKey, SqliteStore,
};
use allowance_ledger::{ChargeRequest, LedgerError};
use time::macros::datetime;

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<SqliteStore>,
    clock: Arc<ManualClock>,
    ledger: Ledger,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::new(dir.path().join("ledger.sqlite")));
    store.init().await.expect("init");
    store
        .upsert_account("guild-free", PlanTier::Free, true)
        .await
        .expect("account");
    store
        .upsert_account("guild-premium", PlanTier::Premium, true)
        .await
        .expect("account");
    let clock = Arc::new(ManualClock::new(datetime!(2026-10-19 12:00 UTC)));
    let ledger = ledger_over(&store, &clock);
    Fixture {
        _dir: dir,
        store,
        clock,
        ledger,
    }
}

fn ledger_over(store: &Arc<SqliteStore>, clock: &Arc<ManualClock>) -> Ledger {
    Ledger::with_parts(
        store.clone(),
        store.clone(),
        store.clone(),
        clock.clone(),
        LedgerConfig {
            admin_actors: vec!["ops".to_string()],
            ..LedgerConfig::default()
        },
    )
}

#[tokio::test]
async fn first_status_then_charge_matches_worked_example() {
    let f = fixture().await;
    let snapshot = f.ledger.status().status("guild-free").await.expect("status");
    assert_eq!(snapshot.tokens_granted, 60_000);
    assert_eq!(snapshot.tokens_used, 0);
    assert_eq!(snapshot.credits_granted, 300);
    assert_eq!(snapshot.usage_percentage, 0);

    let charged = f
        .ledger
        .usage()
        .charge(ChargeRequest::new("guild-free", 100, 50, "chat").with_idempotency_key("m-1"))
        .await
        .expect("charge");
    assert_eq!(charged.tokens_used, 150);
    assert_eq!(charged.tokens_remaining, 59_850);
    assert_eq!(charged.credits_remaining, 299);
}

#[tokio::test]
async fn premium_accounts_get_premium_grant() {
    let f = fixture().await;
    let snapshot = f
        .ledger
        .status()
        .status("guild-premium")
        .await
        .expect("status");
    assert_eq!(snapshot.plan, PlanTier::Premium);
    assert_eq!(snapshot.tokens_granted, 1_000_000);
    assert_eq!(snapshot.credits_granted, 5000);
}

#[tokio::test]
async fn concurrent_first_use_creates_one_period() {
    let f = fixture().await;
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let allowances = f.ledger.allowances();
        tasks.push(tokio::spawn(async move {
            allowances.ensure_current_allowance("guild-free").await
        }));
    }
    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.expect("join").expect("ensure").id);
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let created = f.ledger.metrics().periods_created;
    assert_eq!(created, 1);
}

#[tokio::test]
async fn retries_are_idempotent_across_restarts() {
    let f = fixture().await;
    let request = ChargeRequest::new("guild-free", 700, 300, "summary")
        .with_idempotency_key("job-2026-10-19");
    let first = f.ledger.usage().charge(request.clone()).await.expect("charge");

    // A fresh process over the same file replays rather than recharging.
    let restarted = ledger_over(&f.store, &f.clock);
    let replay = restarted.usage().charge(request).await.expect("replay");
    assert_eq!(replay, first);

    let snapshot = restarted.status().status("guild-free").await.expect("status");
    assert_eq!(snapshot.tokens_used, 1000);
    assert_eq!(f.store.list_events("guild-free", 10).await.expect("events").len(), 1);
}

#[tokio::test]
async fn concurrent_charges_stop_at_the_grant() {
    let f = fixture().await;
    f.ledger
        .set_setting(SettingKey::TokensFreePerMonth, 1000)
        .await
        .expect("setting");

    let mut tasks = Vec::new();
    for i in 0..8 {
        let usage = f.ledger.usage();
        tasks.push(tokio::spawn(async move {
            usage
                .charge(
                    ChargeRequest::new("guild-free", 250, 0, "chat")
                        .with_idempotency_key(format!("c-{i}")),
                )
                .await
        }));
    }
    let mut ok = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(result) => {
                ok += 1;
                assert!(result.tokens_used <= 1000);
            }
            Err(LedgerError::InsufficientBalance(_)) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(ok, 4);

    let snapshot = f.ledger.status().status("guild-free").await.expect("status");
    assert_eq!(snapshot.tokens_used, 1000);
    assert!(snapshot.at_limit);
}

#[tokio::test]
async fn exhausted_account_rejects_and_stays_exhausted() {
    let f = fixture().await;
    let usage = f.ledger.usage();
    usage
        .charge(ChargeRequest::new("guild-free", 60_000, 0, "chat").with_idempotency_key("fill"))
        .await
        .expect("fill");

    let err = usage
        .charge(ChargeRequest::new("guild-free", 1, 0, "chat").with_idempotency_key("extra"))
        .await;
    assert!(matches!(err, Err(LedgerError::InsufficientBalance(_))));

    let snapshot = f.ledger.status().status("guild-free").await.expect("status");
    assert_eq!(snapshot.tokens_used, 60_000);
    assert_eq!(f.store.list_events("guild-free", 10).await.expect("events").len(), 1);
}

#[tokio::test]
async fn rollover_carries_unused_allowance_capped_at_base() {
    let f = fixture().await;
    f.ledger
        .set_setting(SettingKey::TokensFreePerMonth, 1000)
        .await
        .expect("setting");
    f.ledger
        .usage()
        .charge(ChargeRequest::new("guild-free", 100, 0, "chat"))
        .await
        .expect("charge");

    f.ledger
        .set_setting(SettingKey::TokensFreePerMonth, 600)
        .await
        .expect("setting");
    f.clock.set(datetime!(2026-11-01 00:00 UTC));
    let november = f.ledger.status().status("guild-free").await.expect("status");
    assert_eq!(november.rollover_tokens, Some(600));
    assert_eq!(november.base_tokens, Some(600));
    assert_eq!(november.tokens_granted, 1200);
    assert_eq!(november.period_end, datetime!(2026-12-01 00:00 UTC));
}

#[tokio::test]
async fn admin_grant_for_new_account_rolls_into_next_month() {
    let f = fixture().await;
    let adjusted = f
        .ledger
        .allowances()
        .apply_admin_adjustment(AdminAdjustment {
            account_id: "guild-free".to_string(),
            tokens_granted: 1000,
            tokens_used: 0,
            actor: "ops".to_string(),
            reason: Some("trial".to_string()),
        })
        .await
        .expect("adjust");
    assert_eq!(adjusted.source, AllowanceSource::AdminManual);

    f.clock.set(datetime!(2026-11-10 08:00 UTC));
    let next = f
        .ledger
        .allowances()
        .ensure_current_allowance("guild-free")
        .await
        .expect("next");
    assert_eq!(next.metadata.rollover_tokens, Some(1000));
    assert_eq!(next.tokens_granted, 61_000);
}

#[tokio::test]
async fn batch_initialization_skips_inactive_and_reports_counts() {
    let f = fixture().await;
    f.store
        .upsert_account("guild-dormant", PlanTier::Free, false)
        .await
        .expect("account");

    let report = f
        .ledger
        .allowances()
        .initialize_all_accounts()
        .await
        .expect("init");
    assert_eq!(report.initialized_count, 2);
    assert_eq!(
        report.initialized,
        vec!["guild-free".to_string(), "guild-premium".to_string()]
    );
    assert!(report.failed.is_empty());
    assert!(
        f.store
            .period_at("guild-dormant", 0)
            .await
            .expect("lookup")
            .is_none()
    );

    let again = f
        .ledger
        .allowances()
        .initialize_all_accounts()
        .await
        .expect("init");
    assert_eq!(again.initialized_count, 0);
    assert_eq!(again.already_current, 2);
}

#[tokio::test]
async fn low_balance_warning_survives_restart() {
    let f = fixture().await;
    f.ledger
        .usage()
        .charge(ChargeRequest::new("guild-free", 55_000, 0, "chat"))
        .await
        .expect("charge");
    assert!(
        f.ledger
            .status()
            .take_low_balance_warning("guild-free")
            .await
            .expect("warn")
            .is_some()
    );

    let restarted = ledger_over(&f.store, &f.clock);
    assert!(
        restarted
            .status()
            .take_low_balance_warning("guild-free")
            .await
            .expect("warn")
            .is_none()
    );
}
