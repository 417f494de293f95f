//! Transactional core: MVCC, row locks, write-ahead log and ARIES recovery

pub mod buffer;
pub mod checkpoint;
pub mod lock;
pub mod log;
pub mod manager;
pub mod recovery;
pub mod snapshot;
pub mod ssi;
pub mod transaction;
pub mod version;
pub mod wal;

// Public API
pub use checkpoint::CheckpointMarker;
pub use lock::{LockConfig, LockManager, LockMode, VictimPolicy};
pub use manager::{EngineState, TransactionManager, WriteOp};
pub use recovery::RecoveryReport;
pub use snapshot::Snapshot;
pub use transaction::TxnHandle;
pub use version::VacuumStats;
pub use wal::{WalConfig, WalManager};
