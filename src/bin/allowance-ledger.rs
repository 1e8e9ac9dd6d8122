use std::sync::Arc;

use allowance_ledger::ledger::http::{LedgerHttpState, router};
use allowance_ledger::ledger::observability::init_tracing;
use allowance_ledger::ledger::{Ledger, LedgerConfig, SqliteStore, SystemClock};

#[path = "allowance_ledger/cli.rs"]
mod cli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = cli::parse_cli_args(std::env::args().skip(1))?;
    init_tracing(args.json_logs).map_err(|err| -> Box<dyn std::error::Error> { err })?;

    let config = match args.config_path.as_ref() {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let admin_token = args.resolve_admin_token()?;

    let store = Arc::new(SqliteStore::new(&args.sqlite_path).with_defaults(config.defaults));
    store.init().await?;
    for (account_id, plan) in &args.accounts {
        store.upsert_account(account_id, *plan, true).await?;
        tracing::info!(account_id = %account_id, plan = %plan, "account registered");
    }

    let ledger = Ledger::with_parts(
        store.clone(),
        store.clone(),
        store,
        Arc::new(SystemClock),
        config,
    );
    if args.init_accounts {
        ledger.allowances().initialize_all_accounts().await?;
    }

    let mut state = LedgerHttpState::new(ledger);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    } else {
        tracing::info!("admin routes disabled (no admin token configured)");
    }

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(
        listen = %args.listen,
        sqlite = %args.sqlite_path.display(),
        "allowance-ledger listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
