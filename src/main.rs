//! Ledger Service CLI
//!
//! Replays a CSV file of register, deposit and transfer commands against an
//! in-memory ledger and prints the resulting account balances, or the
//! transfer history of one user.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- commands.csv > accounts.csv
//! cargo run -- commands.csv --history alice@example.com > history.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `LEDGER_*`: see [`ledger_service::LedgerConfig`]

use ledger_service::{
    BatchRunner, ExchangeRateResolver, LedgerConfig, LedgerEngine, LedgerError, MemoryStore,
    Result, TtlRateCache,
};
use log::info;
use std::env;
use std::fs::File;
use std::io::{self, BufReader};
use std::process;

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Parsed command line: the input file and an optional history email.
struct Args {
    input_path: String,
    history: Option<String>,
}

fn parse_args() -> Result<Args> {
    let mut input_path = None;
    let mut history = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--history" {
            history = Some(args.next().ok_or(LedgerError::MissingArgument)?);
        } else if input_path.is_none() {
            input_path = Some(arg);
        }
    }

    Ok(Args {
        input_path: input_path.ok_or(LedgerError::MissingArgument)?,
        history,
    })
}

fn run() -> Result<()> {
    let args = parse_args()?;
    let config = LedgerConfig::from_env()?;
    info!(
        "Starting ledger with base currency {}, lock timeout {:?}",
        config.base_currency, config.lock_timeout
    );

    let rates = ExchangeRateResolver::new(
        config.rate_table()?,
        TtlRateCache::new(config.rate_cache_ttl),
    );
    let engine = LedgerEngine::new(MemoryStore::with_lock_timeout(config.lock_timeout), rates)
        .with_history_page_size(config.history_page_size);

    let file = File::open(&args.input_path)?;
    let runner = BatchRunner::new(&engine);
    let summary = runner.process_csv(BufReader::new(file))?;
    info!(
        "Processed {}: {} applied, {} rejected",
        args.input_path, summary.applied, summary.rejected
    );

    let stdout = io::stdout();
    let handle = stdout.lock();
    match args.history {
        Some(email) => runner.write_history(&email, handle)?,
        None => runner.write_accounts(&summary.registered, handle)?,
    }

    Ok(())
}
