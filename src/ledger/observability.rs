use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub charges: u64,
    pub charge_replays: u64,
    pub insufficient_balance: u64,
    pub partial_commits: u64,
    pub periods_created: u64,
    pub creation_races_lost: u64,
    pub admin_adjustments: u64,
}

/// Process-local counters. Shared through the ledger context, so every
/// component and clone of a `Ledger` feeds the same snapshot.
#[derive(Debug, Default)]
pub struct LedgerMetrics {
    charges: AtomicU64,
    charge_replays: AtomicU64,
    insufficient_balance: AtomicU64,
    partial_commits: AtomicU64,
    periods_created: AtomicU64,
    creation_races_lost: AtomicU64,
    admin_adjustments: AtomicU64,
}

impl LedgerMetrics {
    pub fn record_charge(&self) {
        self.charges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_charge_replay(&self) {
        self.charge_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_commit(&self) {
        self.partial_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_period_created(&self) {
        self.periods_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_creation_race_lost(&self) {
        self.creation_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admin_adjustment(&self) {
        self.admin_adjustments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            charges: self.charges.load(Ordering::Relaxed),
            charge_replays: self.charge_replays.load(Ordering::Relaxed),
            insufficient_balance: self.insufficient_balance.load(Ordering::Relaxed),
            partial_commits: self.partial_commits.load(Ordering::Relaxed),
            periods_created: self.periods_created.load(Ordering::Relaxed),
            creation_races_lost: self.creation_races_lost.load(Ordering::Relaxed),
            admin_adjustments: self.admin_adjustments.load(Ordering::Relaxed),
        }
    }
}

/// Installs the global subscriber: `RUST_LOG`-style filtering (default
/// `info`) with plain or JSON formatted output.
#[cfg(feature = "server")]
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing_subscriber::Layer as _;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}
