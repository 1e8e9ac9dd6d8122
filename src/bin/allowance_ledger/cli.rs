use std::path::PathBuf;

use allowance_ledger::ledger::PlanTier;

#[derive(Debug)]
pub(crate) struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub sqlite_path: PathBuf,
    pub listen: String,
    pub admin_token: Option<String>,
    pub admin_token_env: Option<String>,
    pub accounts: Vec<(String, PlanTier)>,
    pub init_accounts: bool,
    pub json_logs: bool,
}

const USAGE: &str = "usage: allowance-ledger --sqlite PATH [--config PATH] [--listen|--addr HOST:PORT] [--admin-token TOKEN] [--admin-token-env ENV] [--account ACCOUNT=free|premium] [--init-accounts] [--json-logs]";

pub(crate) fn parse_cli_args(
    mut args: impl Iterator<Item = String>,
) -> Result<CliArgs, Box<dyn std::error::Error>> {
    let mut config_path: Option<PathBuf> = None;
    let mut sqlite_path: Option<PathBuf> = None;
    let mut listen = "127.0.0.1:8080".to_string();
    let mut admin_token: Option<String> = None;
    let mut admin_token_env: Option<String> = None;
    let mut accounts: Vec<(String, PlanTier)> = Vec::new();
    let mut init_accounts = false;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(args.next().ok_or("missing value for --config")?.into());
            }
            "--sqlite" => {
                sqlite_path = Some(args.next().ok_or("missing value for --sqlite")?.into());
            }
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--admin-token" => {
                admin_token = Some(args.next().ok_or("missing value for --admin-token")?);
            }
            "--admin-token-env" => {
                admin_token_env = Some(args.next().ok_or("missing value for --admin-token-env")?);
            }
            "--account" => {
                let raw = args.next().ok_or("missing value for --account")?;
                accounts.push(parse_account_arg(&raw)?);
            }
            "--init-accounts" => {
                init_accounts = true;
            }
            "--json-logs" => {
                json_logs = true;
            }
            "-h" | "--help" => return Err(USAGE.into()),
            other => return Err(format!("unknown arg: {other}\n{USAGE}").into()),
        }
    }

    Ok(CliArgs {
        config_path,
        sqlite_path: sqlite_path.ok_or(USAGE)?,
        listen,
        admin_token,
        admin_token_env,
        accounts,
        init_accounts,
        json_logs,
    })
}

fn parse_account_arg(raw: &str) -> Result<(String, PlanTier), Box<dyn std::error::Error>> {
    let (account_id, plan) = raw
        .split_once('=')
        .ok_or_else(|| format!("invalid --account (expected ACCOUNT=PLAN): {raw}"))?;
    let account_id = account_id.trim();
    if account_id.is_empty() {
        return Err(format!("invalid --account (empty account id): {raw}").into());
    }
    let plan = PlanTier::parse(plan.trim())
        .ok_or_else(|| format!("invalid --account plan (expected free|premium): {raw}"))?;
    Ok((account_id.to_string(), plan))
}

impl CliArgs {
    /// `--admin-token` wins over `--admin-token-env`.
    pub(crate) fn resolve_admin_token(&self) -> Result<Option<String>, Box<dyn std::error::Error>> {
        if let Some(token) = self.admin_token.as_ref() {
            return Ok(Some(token.clone()));
        }
        let Some(env) = self.admin_token_env.as_deref() else {
            return Ok(None);
        };
        let token = std::env::var(env)
            .map_err(|_| format!("admin token env var is not set: {env}"))?;
        Ok(Some(token))
    }
}
