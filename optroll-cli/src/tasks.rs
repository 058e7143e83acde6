//! Operator commands for seeding and inspecting watch tasks.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Args;
use rust_decimal::Decimal;

use optroll_config::AppConfig;
use optroll_core::{OptionSymbol, Side, Task, TaskState};
use optroll_store::{SqliteTaskStore, TaskStore};

#[derive(Args, Debug)]
pub struct TaskAddArgs {
    /// Owning user id
    #[arg(long)]
    pub owner: i64,
    /// Credential table entry to trade with
    #[arg(long)]
    pub credential: i64,
    /// Held option symbol, e.g. BTC-26DEC25-100000-C
    #[arg(long)]
    pub symbol: String,
    /// Underlying index to watch, e.g. BTCUSDT
    #[arg(long)]
    pub underlying: String,
    /// Side used when opening the new leg (buy|sell)
    #[arg(long, default_value = "sell")]
    pub side: String,
    /// Contract quantity
    #[arg(long)]
    pub qty: Decimal,
    /// Index price that triggers the roll
    #[arg(long)]
    pub trigger: Decimal,
    /// Hint for the distance to the next strike
    #[arg(long, default_value = "0")]
    pub step: Decimal,
}

fn open_store(config: &AppConfig) -> Result<SqliteTaskStore> {
    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {dir:?}"))?;
    }
    SqliteTaskStore::open(&config.store.path)
        .with_context(|| format!("failed to open task store at {:?}", config.store.path))
}

pub fn add_task(config: &AppConfig, args: TaskAddArgs) -> Result<()> {
    // Reject symbols the saga would be unable to roll.
    let parsed: OptionSymbol = args
        .symbol
        .parse()
        .with_context(|| format!("invalid option symbol '{}'", args.symbol))?;
    let side = match args.side.to_ascii_lowercase().as_str() {
        "buy" => Side::Buy,
        "sell" => Side::Sell,
        other => bail!("invalid side '{other}', expected buy or sell"),
    };
    if args.qty <= Decimal::ZERO {
        bail!("quantity must be positive");
    }

    let store = open_store(config)?;
    let mut task = Task {
        id: 0,
        owner_id: args.owner,
        credential_id: args.credential,
        current_option_symbol: parsed.to_string(),
        underlying_symbol: args.underlying,
        target_side: Some(side),
        current_qty: args.qty,
        trigger_price: args.trigger,
        next_strike_step: args.step,
        status: TaskState::Idle,
        version: 0,
        last_error: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.create(&mut task)?;
    println!(
        "created task {} watching {} against {} (trigger {})",
        task.id, task.current_option_symbol, task.underlying_symbol, task.trigger_price
    );
    Ok(())
}

pub fn list_tasks(config: &AppConfig) -> Result<()> {
    let store = open_store(config)?;
    let tasks = store.list_active()?;
    if tasks.is_empty() {
        println!("no active tasks");
        return Ok(());
    }
    for task in tasks {
        println!(
            "#{:<4} {:<10} {:<26} watch {:<10} trigger {:<12} qty {:<10} v{}{}",
            task.id,
            task.status.as_str(),
            task.current_option_symbol,
            task.underlying_symbol,
            task.trigger_price,
            task.current_qty,
            task.version,
            task.last_error
                .map(|err| format!("  last_error: {err}"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
