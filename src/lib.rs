//! Basalt - a transactional storage core
//!
//! Multi-version concurrency control with snapshot reads, strict two-phase
//! row locking with deadlock detection, a write-ahead log with group commit,
//! and ARIES-style crash recovery over a paged version store.
//!
//! ```no_run
//! use basalt::{Config, Engine, IsolationLevel, RowKey};
//!
//! let engine = Engine::start(Config::new("./data"))?;
//! let txn = engine.begin(IsolationLevel::RepeatableRead)?;
//! engine.insert(&txn, &RowKey::new("accounts", 1), "100".into())?;
//! engine.commit(txn)?;
//! # Ok::<(), basalt::BasaltError>(())
//! ```

use std::path::PathBuf;

pub mod error;
pub mod storage;
pub mod txn;
pub mod types;

pub use error::{BasaltError, ErrorClass, Result};
pub use txn::{
    EngineState, LockConfig, RecoveryReport, TransactionManager, TxnHandle, VacuumStats,
    VictimPolicy, WalConfig, WriteOp,
};
pub use types::{IsolationLevel, Lsn, RowKey, TxnId};

/// The engine handle
pub type Engine = TransactionManager;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for the log, the checkpoint marker and page files
    pub data_dir: PathBuf,
    /// Number of home pages keys are hashed over
    pub page_count: u32,
    /// Pages the buffer pool caches before evicting
    pub buffer_pool_pages: usize,
    /// Log bytes between automatic checkpoints (0 disables them)
    pub checkpoint_threshold_bytes: u64,
    pub wal: WalConfig,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            page_count: 64,
            buffer_pool_pages: 256,
            checkpoint_threshold_bytes: 16 * 1024 * 1024,
            wal: WalConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Every commit forces its own flush; no timer-driven batching
    pub fn synchronous(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal: WalConfig::synchronous(),
            ..Self::new(data_dir)
        }
    }

    /// Larger log batches and fewer checkpoints
    pub fn high_throughput(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            wal: WalConfig::high_throughput(),
            buffer_pool_pages: 1024,
            checkpoint_threshold_bytes: 64 * 1024 * 1024,
            ..Self::new(data_dir)
        }
    }
}
