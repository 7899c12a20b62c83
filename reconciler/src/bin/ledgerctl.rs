//! Operator CLI for the deposit ledger
//!
//! Works directly on the ledger's data directory; stop the server first.

use anyhow::Context;
use clap::{Parser, Subcommand};
use deposit_ledger::{Ledger, OwnerKey};
use reconciler::{Config, Erc20BalanceOracle, ReconcileRequest, ReconciliationService};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "ledgerctl", version, about = "Inspect and reconcile deposit ledgers")]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "RECONCILER_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger data directory (overrides the configuration)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List an owner's deposits
    List {
        /// Owner address
        owner: String,
    },
    /// Active-deposit analysis
    Summary {
        /// Owner address
        owner: String,
    },
    /// Reconcile an owner's deposits
    Reconcile {
        /// Owner address
        owner: String,
        /// Target total; the on-chain balance is queried when omitted
        #[arg(long)]
        target: Option<Decimal>,
        /// Show the changes without writing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Applied reconciliations
    History {
        /// Owner address
        owner: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    if let Some(data_dir) = cli.data_dir {
        config.ledger.data_dir = data_dir;
    }

    reconciler::init_tracing(config.log_json);

    let ledger = Arc::new(Ledger::open(config.ledger.clone()).await?);
    let result = run(cli.command, &config, ledger.clone()).await;

    if let Ok(ledger) = Arc::try_unwrap(ledger) {
        ledger.shutdown().await?;
    }
    result
}

async fn run(command: Command, config: &Config, ledger: Arc<Ledger>) -> anyhow::Result<()> {
    match command {
        Command::List { owner } => {
            let rows = ledger.list_rows(&OwnerKey::new(&owner))?;
            println!("{} deposit(s) for {}", rows.len(), OwnerKey::new(&owner));
            for row in rows {
                println!(
                    "{}  principal={}  balance={}  yield={}  tx={}",
                    row.id, row.principal, row.current_balance, row.accumulated_yield, row.tx_hash
                );
            }
        }

        Command::Summary { owner } => {
            let summary = ledger.summary(&OwnerKey::new(&owner))?;
            println!("Total deposits:        {}", summary.total_deposits);
            println!("Active deposits:       {}", summary.active_deposits);
            println!("Total principal:       {}", summary.total_principal);
            println!("Total current balance: {}", summary.total_current_balance);
            println!("Total redeemed:        {}", summary.total_redeemed);
        }

        Command::Reconcile {
            owner,
            target,
            dry_run,
        } => {
            let request = reconcile_request(&owner, target, dry_run)?;
            let oracle = Arc::new(Erc20BalanceOracle::new(&config.oracle)?);
            let service = ReconciliationService::new(ledger, oracle, config.oracle.failure_policy)?;

            let outcome = service.reconcile(request).await?;

            println!("{}", outcome.message());
            println!("Target:    {}", outcome.target);
            println!("Old total: {}", outcome.old_total);
            println!("New total: {}", outcome.new_total);
            for change in &outcome.changes {
                println!(
                    "  {}  {} -> {}  tx={}",
                    change.deposit_id, change.old_balance, change.new_balance, change.tx_hash
                );
            }
        }

        Command::History { owner } => {
            let records = ledger.reconciliation_history(&OwnerKey::new(&owner))?;
            println!("{} reconciliation(s)", records.len());
            for record in records {
                println!(
                    "{}  target={}  {} -> {}  rows={}",
                    record.applied_at.to_rfc3339(),
                    record.target,
                    record.old_total,
                    record.new_total,
                    record.rows_updated
                );
            }
        }
    }

    Ok(())
}

/// Build the request for `reconcile`; `--target` bypasses the oracle
fn reconcile_request(owner: &str, target: Option<Decimal>, dry_run: bool) -> anyhow::Result<ReconcileRequest> {
    let owner = OwnerKey::new(owner);
    if owner.is_empty() {
        anyhow::bail!("owner must not be empty");
    }
    if let Some(target) = target {
        if target < Decimal::ZERO {
            anyhow::bail!("--target must be non-negative, got {}", target);
        }
    }

    Ok(ReconcileRequest {
        owner,
        target_override: target,
        dry_run,
    })
}
