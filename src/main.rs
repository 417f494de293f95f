//! basalt - operate on a Basalt data directory
//!
//! ```text
//! basalt [OPTIONS] <COMMAND>
//!
//!   recover       run crash recovery and print what it did
//!   checkpoint    recover, then take a checkpoint
//!   vacuum        recover, then remove dead versions
//!   inspect-log   print every record in the write-ahead log
//!   bench         run concurrent transfers and check the total balance
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use log::{info, warn};
use rand::Rng;

use basalt::txn::log::{read_log, LogBody};
use basalt::{BasaltError, Config, Engine, IsolationLevel, RowKey, VictimPolicy};

const ACCOUNTS_TABLE: &str = "accounts";
const INITIAL_BALANCE: i64 = 1000;

struct BenchOptions {
    threads: usize,
    txns_per_thread: usize,
    accounts: u64,
    isolation: IsolationLevel,
}

fn print_help() {
    println!("basalt - transactional storage core");
    println!();
    println!("Usage: basalt [OPTIONS] <recover|checkpoint|vacuum|inspect-log|bench>");
    println!();
    println!("Options:");
    println!("  -d, --data-dir DIR          Data directory (default: ./data)");
    println!("  -i, --isolation LEVEL       read-committed | repeatable-read | serializable");
    println!("      --victim-policy POLICY  oldest | youngest | fewest-locks | fewest-retries");
    println!("      --lock-timeout-ms MS    Fail lock waits after MS milliseconds");
    println!("      --sync                  Flush the log only on demand");
    println!("  -t, --threads N             Bench worker threads (default: 4)");
    println!("  -n, --txns N                Bench transactions per thread (default: 1000)");
    println!("  -a, --accounts N            Bench accounts (default: 16)");
    println!("  -h, --help                  Show this help");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let args: Vec<String> = std::env::args().collect();

    let mut config = Config::default();
    let mut bench = BenchOptions {
        threads: 4,
        txns_per_thread: 1000,
        accounts: 16,
        isolation: IsolationLevel::ReadCommitted,
    };
    let mut command = None;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--data-dir" | "-d", Some(v)) => {
                config.data_dir = PathBuf::from(v);
                i += 1;
            }
            ("--isolation" | "-i", Some(v)) => {
                bench.isolation = v.parse()?;
                i += 1;
            }
            ("--victim-policy", Some(v)) => {
                config.lock.victim_policy = v.parse::<VictimPolicy>()?;
                i += 1;
            }
            ("--lock-timeout-ms", Some(v)) => {
                config.lock.lock_timeout_ms = Some(v.parse()?);
                i += 1;
            }
            ("--threads" | "-t", Some(v)) => {
                bench.threads = v.parse()?;
                i += 1;
            }
            ("--txns" | "-n", Some(v)) => {
                bench.txns_per_thread = v.parse()?;
                i += 1;
            }
            ("--accounts" | "-a", Some(v)) => {
                bench.accounts = v.parse()?;
                i += 1;
            }
            ("--sync", _) => {
                config.wal = basalt::WalConfig::synchronous();
            }
            ("--help" | "-h", _) => {
                print_help();
                return Ok(());
            }
            (other, _) if !other.starts_with('-') => command = Some(other.to_string()),
            (other, _) => warn!("Ignoring unknown option {}", other),
        }
        i += 1;
    }

    match command.as_deref() {
        Some("inspect-log") => inspect_log(&config),
        Some("recover") => {
            let engine = Engine::open(config)?;
            let report = engine.recover()?;
            println!("{:#?}", report);
            engine.shutdown()?;
            Ok(())
        }
        Some("checkpoint") => {
            let engine = Engine::start(config)?;
            let lsn = engine.checkpoint()?;
            println!("Checkpoint at LSN {}", lsn);
            engine.shutdown()?;
            Ok(())
        }
        Some("vacuum") => {
            let engine = Engine::start(config)?;
            let stats = engine.vacuum()?;
            println!("{:#?}", stats);
            engine.shutdown()?;
            Ok(())
        }
        Some("bench") => run_bench(config, bench).await,
        _ => {
            print_help();
            Ok(())
        }
    }
}

fn inspect_log(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let scan = read_log(&config.data_dir.join("wal.log"))?;
    for record in &scan.records {
        let detail = match &record.body {
            LogBody::Update { page_id, slot, after, .. } => match after {
                Some(v) => format!("page {} slot {} {} xmin={} xmax={:?}", page_id, slot, v.key, v.xmin, v.xmax),
                None => format!("page {} slot {} (removed)", page_id, slot),
            },
            LogBody::Clr { page_id, slot, undo_next_lsn, .. } => {
                format!("page {} slot {} undo_next={:?}", page_id, slot, undo_next_lsn)
            }
            LogBody::CheckpointEnd { att, dpt, next_txn_id } => {
                format!("{} active, {} dirty pages, next txn {}", att.len(), dpt.len(), next_txn_id)
            }
            _ => String::new(),
        };
        println!(
            "{:>8} txn={:<6} prev={:<8} {:<10} {}",
            record.lsn,
            record.txn_id,
            record.prev_lsn.map(|l| l.to_string()).unwrap_or_else(|| "-".to_string()),
            record.kind(),
            detail
        );
    }
    println!(
        "{} records, {} bytes{}",
        scan.records.len(),
        scan.valid_len,
        if scan.torn_tail { ", torn tail" } else { "" }
    );
    Ok(())
}

fn parse_balance(bytes: &[u8]) -> i64 {
    std::str::from_utf8(bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0)
}

/// Move one unit between two random accounts, retrying on conflicts
fn transfer(engine: &Engine, isolation: IsolationLevel, accounts: u64, aborts: &AtomicU64) -> basalt::Result<()> {
    let mut rng = rand::thread_rng();
    let from = RowKey::new(ACCOUNTS_TABLE, rng.gen_range(0..accounts));
    let to = RowKey::new(ACCOUNTS_TABLE, rng.gen_range(0..accounts));
    if from == to {
        return Ok(());
    }

    let mut retries = 0;
    loop {
        let txn = engine.begin_retry(isolation, retries)?;
        let result = engine
            .update_with(&txn, &from, |b| Bytes::from((parse_balance(b) - 1).to_string()))
            .and_then(|_| engine.update_with(&txn, &to, |b| Bytes::from((parse_balance(b) + 1).to_string())))
            .and_then(|_| engine.commit(txn));
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() => {
                aborts.fetch_add(1, Ordering::Relaxed);
                retries += 1;
            }
            Err(e) => {
                engine.abort(txn)?;
                return Err(e);
            }
        }
    }
}

async fn run_bench(config: Config, options: BenchOptions) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Arc::new(Engine::start(config)?);

    let setup = engine.begin(IsolationLevel::ReadCommitted)?;
    for id in 0..options.accounts {
        let key = RowKey::new(ACCOUNTS_TABLE, id);
        match engine.insert(&setup, &key, Bytes::from(INITIAL_BALANCE.to_string())) {
            Ok(()) => {}
            // Left over from an earlier run
            Err(BasaltError::KeyConflict(_)) => {
                return Err("data directory already holds bench accounts; use a fresh --data-dir".into())
            }
            Err(e) => return Err(e.into()),
        }
    }
    engine.commit(setup)?;

    info!(
        "Running {} threads x {} transfers over {} accounts ({})",
        options.threads, options.txns_per_thread, options.accounts, options.isolation
    );
    let aborts = Arc::new(AtomicU64::new(0));
    let started = Instant::now();
    let mut workers = Vec::with_capacity(options.threads);
    for _ in 0..options.threads {
        let engine = Arc::clone(&engine);
        let aborts = Arc::clone(&aborts);
        let (txns, isolation, accounts) = (options.txns_per_thread, options.isolation, options.accounts);
        workers.push(tokio::task::spawn_blocking(move || -> basalt::Result<()> {
            for _ in 0..txns {
                transfer(&engine, isolation, accounts, &aborts)?;
            }
            Ok(())
        }));
    }
    for worker in workers {
        worker.await??;
    }
    let elapsed = started.elapsed();

    let check = engine.begin(IsolationLevel::RepeatableRead)?;
    let mut total = 0;
    for id in 0..options.accounts {
        total += parse_balance(&engine.read(&check, &RowKey::new(ACCOUNTS_TABLE, id))?);
    }
    engine.commit(check)?;

    let committed = options.threads * options.txns_per_thread;
    println!(
        "{} transfers in {:.2?} ({:.0} txn/s), {} conflict aborts, {} deadlocks",
        committed,
        elapsed,
        committed as f64 / elapsed.as_secs_f64(),
        aborts.load(Ordering::Relaxed),
        engine.locks().deadlocks_detected()
    );
    println!(
        "Total balance {} (expected {})",
        total,
        INITIAL_BALANCE * options.accounts as i64
    );
    engine.shutdown()?;
    Ok(())
}
