//! Write-Ahead Log manager: append buffer, flusher thread and commit latches
//!
//! ## Append path
//!
//! `append` assigns the LSN and encodes the frame under one mutex, so the
//! buffer always holds a contiguous, LSN-ordered run of frames. Nothing
//! touches the disk on the caller's thread.
//!
//! ## Flusher
//!
//! A dedicated thread drains the buffer to `wal.log` and fsyncs:
//! - every `flush_interval_ms` while records are pending,
//! - as soon as the buffer holds `max_buffer_bytes`,
//! - whenever a caller asks for `flush(lsn)`.
//!
//! Callers of `flush` block on a commit latch until the durable LSN passes
//! their target, so many commits share one fsync.
//!
//! ### Failure
//! A failed write or fsync is latched. Every later `append`/`flush` fails,
//! because the log-before-data rule can no longer be upheld.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{BasaltError, Result};
use crate::types::{Lsn, TxnId};
use super::log::{encode_frame, read_log, LogBody, LogRecord, LogScan};

/// How long a flush waits for the durable LSN before giving up
const DURABLE_WAIT: Duration = Duration::from_secs(30);

/// Configuration for the WAL flusher.
///
/// # Presets
///
/// - [`WalConfig::default()`] - group commit with a 5ms flush interval
/// - [`WalConfig::synchronous()`] - flush only on demand or when the buffer fills
/// - [`WalConfig::high_throughput()`] - larger batches, higher commit latency
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Flush pending records at least this often (milliseconds). 0 disables
    /// the timer; records are then flushed only on demand or buffer-full.
    pub flush_interval_ms: u64,
    /// Buffered bytes that force an immediate flush
    pub max_buffer_bytes: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5,
            max_buffer_bytes: 1 << 20, // 1 MB
        }
    }
}

impl WalConfig {
    pub fn synchronous() -> Self {
        Self {
            flush_interval_ms: 0,
            ..Default::default()
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            flush_interval_ms: 50,
            max_buffer_bytes: 4 << 20, // 4 MB
        }
    }
}

/// Shared state for commit latches - allows threads to wait for durability
pub struct FsyncState {
    /// The highest LSN that has been durably fsynced to disk
    durable_lsn: AtomicU64,
    condvar: Condvar,
    mutex: Mutex<()>,
    shutdown: AtomicBool,
    /// First write/fsync failure, latched forever
    failure: Mutex<Option<String>>,
}

impl FsyncState {
    fn new() -> Self {
        Self {
            durable_lsn: AtomicU64::new(0),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    /// The latched failure, if any
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    fn check_healthy(&self) -> Result<()> {
        if let Some(msg) = self.failure() {
            return Err(BasaltError::Halted(msg));
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Err(BasaltError::Halted("WAL flusher has shut down".to_string()));
        }
        Ok(())
    }

    /// Wait until `target_lsn` is durable
    pub fn wait_for_durable(&self, target_lsn: Lsn, timeout: Duration) -> Result<()> {
        if self.durable_lsn() >= target_lsn {
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.mutex.lock().map_err(|_| BasaltError::poisoned("fsync state"))?;

        loop {
            if self.durable_lsn() >= target_lsn {
                return Ok(());
            }
            self.check_healthy()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BasaltError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "Timeout waiting for LSN {} to become durable (current: {})",
                        target_lsn,
                        self.durable_lsn()
                    ),
                )));
            }

            guard = self
                .condvar
                .wait_timeout(guard, remaining)
                .map_err(|_| BasaltError::poisoned("fsync state"))?
                .0;
        }
    }

    /// Raise the durable LSN (never lowers it) and wake all waiters
    fn signal_durable(&self, lsn: Lsn) {
        self.durable_lsn.fetch_max(lsn, Ordering::AcqRel);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn fail(&self, msg: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(msg);
        }
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.mutex.lock();
        self.condvar.notify_all();
    }
}

/// Encoded records waiting for the flusher
struct LogBuffer {
    next_lsn: Lsn,
    frames: Vec<(Lsn, Vec<u8>)>,
    bytes: usize,
}

/// Control messages for the flusher thread
enum WalMessage {
    /// Write and fsync everything buffered
    Flush,
    /// Drop every record below `keep_from` from the log file
    Truncate {
        keep_from: Lsn,
        responder: mpsc::SyncSender<Result<usize>>,
    },
    /// Stop the flusher; `flush: false` simulates a crash
    Shutdown { flush: bool },
}

/// Current time in Unix epoch milliseconds
pub fn timestamp() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_millis() as u64,
        Err(_) => 0,
    }
}

/// The WAL manager. Owns the durable log.
pub struct WalManager {
    path: PathBuf,
    config: WalConfig,
    buffer: Arc<Mutex<LogBuffer>>,
    fsync_state: Arc<FsyncState>,
    sender: mpsc::SyncSender<WalMessage>,
    worker: Mutex<Option<JoinHandle<()>>>,
    bytes_since_checkpoint: AtomicU64,
}

impl WalManager {
    /// Open (or create) the log at `path` and start the flusher thread.
    /// LSNs start at 1 until recovery calls [`WalManager::reset`].
    pub fn open(path: PathBuf, config: WalConfig) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = mpsc::sync_channel::<WalMessage>(1024);
        let buffer = Arc::new(Mutex::new(LogBuffer { next_lsn: 1, frames: Vec::new(), bytes: 0 }));
        let fsync_state = Arc::new(FsyncState::new());

        let interval = match config.flush_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let worker = {
            let buffer = Arc::clone(&buffer);
            let fsync_state = Arc::clone(&fsync_state);
            let path = path.clone();
            std::thread::Builder::new()
                .name("basalt-wal".to_string())
                .spawn(move || wal_worker_thread(file, path, rx, buffer, fsync_state, interval))?
        };

        Ok(Self {
            path,
            config,
            buffer,
            fsync_state,
            sender: tx,
            worker: Mutex::new(Some(worker)),
            bytes_since_checkpoint: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer a new record and return it with its assigned LSN
    pub fn append(&self, txn_id: TxnId, prev_lsn: Option<Lsn>, body: LogBody) -> Result<LogRecord> {
        self.fsync_state.check_healthy()?;

        let (record, buffered) = {
            let mut buffer = self.buffer.lock().map_err(|_| BasaltError::poisoned("log buffer"))?;
            let record = LogRecord {
                lsn: buffer.next_lsn,
                txn_id,
                prev_lsn,
                timestamp: timestamp(),
                body,
            };
            let frame = encode_frame(&record)?;
            buffer.next_lsn += 1;
            buffer.bytes += frame.len();
            self.bytes_since_checkpoint.fetch_add(frame.len() as u64, Ordering::Relaxed);
            buffer.frames.push((record.lsn, frame));
            (record, buffer.bytes)
        };

        if buffered >= self.config.max_buffer_bytes {
            self.request_flush()?;
        }
        Ok(record)
    }

    fn request_flush(&self) -> Result<()> {
        match self.sender.try_send(WalMessage::Flush) {
            Ok(()) | Err(mpsc::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::TrySendError::Disconnected(_)) => {
                Err(BasaltError::Halted("WAL flusher channel closed".to_string()))
            }
        }
    }

    /// Block until every record up to and including `upto` is durable
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        let target = upto.min(self.last_lsn());
        if self.fsync_state.durable_lsn() >= target {
            return Ok(());
        }
        self.fsync_state.check_healthy()?;
        self.request_flush()?;
        self.fsync_state.wait_for_durable(target, DURABLE_WAIT)
    }

    /// Flush everything appended so far; returns the durable LSN
    pub fn flush_all(&self) -> Result<Lsn> {
        let last = self.last_lsn();
        self.flush(last)?;
        Ok(last)
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.fsync_state.durable_lsn()
    }

    /// Highest LSN handed out so far (0 if none)
    pub fn last_lsn(&self) -> Lsn {
        self.buffer.lock().map(|b| b.next_lsn - 1).unwrap_or(0)
    }

    /// Position the LSN counter after recovery read the existing log.
    /// Everything already in the file counts as durable.
    pub fn reset(&self, next_lsn: Lsn) -> Result<()> {
        let mut buffer = self.buffer.lock().map_err(|_| BasaltError::poisoned("log buffer"))?;
        if !buffer.frames.is_empty() {
            return Err(BasaltError::InvalidState(
                "cannot reposition the log with unflushed records".to_string(),
            ));
        }
        buffer.next_lsn = buffer.next_lsn.max(next_lsn);
        self.fsync_state.signal_durable(buffer.next_lsn - 1);
        Ok(())
    }

    /// Cut a torn tail off the log file
    pub fn discard_tail(&self, valid_len: u64) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        if file.metadata()?.len() > valid_len {
            log::warn!("Discarding torn WAL tail beyond byte {}", valid_len);
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Drop every record with LSN below `keep_from`. Returns how many were dropped.
    pub fn truncate_before(&self, keep_from: Lsn) -> Result<usize> {
        self.fsync_state.check_healthy()?;
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(WalMessage::Truncate { keep_from, responder: tx })
            .map_err(|_| BasaltError::Halted("WAL flusher channel closed".to_string()))?;
        rx.recv()
            .map_err(|_| BasaltError::Halted("WAL truncate response lost".to_string()))?
    }

    /// Flush, then read the whole log back
    pub fn read_all(&self) -> Result<LogScan> {
        self.flush_all()?;
        read_log(&self.path)
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.bytes_since_checkpoint.load(Ordering::Relaxed)
    }

    pub fn reset_checkpoint_counter(&self) {
        self.bytes_since_checkpoint.store(0, Ordering::Relaxed);
    }

    pub fn failure(&self) -> Option<String> {
        self.fsync_state.failure()
    }

    /// Flush what is buffered and stop the flusher
    pub fn shutdown(&self) {
        self.stop(true);
    }

    /// Stop the flusher and drop whatever is still buffered, as a crash would
    pub fn abandon(&self) {
        self.stop(false);
    }

    fn stop(&self, flush: bool) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = self.sender.send(WalMessage::Shutdown { flush });
            let _ = handle.join();
        }
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        self.stop(true);
    }
}

/// Flusher thread - drains the buffer on timer, demand, or buffer-full
fn wal_worker_thread(
    mut file: File,
    path: PathBuf,
    rx: mpsc::Receiver<WalMessage>,
    buffer: Arc<Mutex<LogBuffer>>,
    fsync_state: Arc<FsyncState>,
    interval: Option<Duration>,
) {
    loop {
        let message = match interval {
            Some(interval) => match rx.recv_timeout(interval) {
                Ok(msg) => Some(msg),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => Some(WalMessage::Shutdown { flush: true }),
            },
            None => match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => Some(WalMessage::Shutdown { flush: true }),
            },
        };

        match message {
            None | Some(WalMessage::Flush) => {
                let _ = flush_pending(&mut file, &buffer, &fsync_state, "flush");
            }
            Some(WalMessage::Truncate { keep_from, responder }) => {
                let result = flush_pending(&mut file, &buffer, &fsync_state, "truncate")
                    .and_then(|()| rewrite_from(&mut file, &path, keep_from));
                let _ = responder.send(result);
            }
            Some(WalMessage::Shutdown { flush }) => {
                if flush {
                    let _ = flush_pending(&mut file, &buffer, &fsync_state, "shutdown");
                }
                fsync_state.signal_shutdown();
                log::debug!("WAL flusher shutting down (flush: {})", flush);
                break;
            }
        }
    }
}

/// Write and fsync every buffered frame
fn flush_pending(
    file: &mut File,
    buffer: &Mutex<LogBuffer>,
    fsync_state: &FsyncState,
    trigger: &str,
) -> Result<()> {
    if fsync_state.failure().is_some() {
        return Err(BasaltError::Halted("WAL already failed".to_string()));
    }
    let (frames, bytes) = {
        let mut buffer = buffer.lock().map_err(|_| BasaltError::poisoned("log buffer"))?;
        let bytes = buffer.bytes;
        buffer.bytes = 0;
        (std::mem::take(&mut buffer.frames), bytes)
    };
    let Some(max_lsn) = frames.last().map(|(lsn, _)| *lsn) else {
        return Ok(());
    };

    let result = write_frames(file, &frames);
    match result {
        Ok(()) => {
            fsync_state.signal_durable(max_lsn);
            log::debug!(
                "WAL fsync complete: {} records through LSN {}, {} bytes (trigger: {})",
                frames.len(),
                max_lsn,
                bytes,
                trigger
            );
            Ok(())
        }
        Err(e) => {
            log::error!("WAL write failed, halting log: {}", e);
            fsync_state.fail(e.to_string());
            Err(e)
        }
    }
}

fn write_frames(file: &mut File, frames: &[(Lsn, Vec<u8>)]) -> Result<()> {
    for (_, frame) in frames {
        file.write_all(frame)?;
    }
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

/// Atomically replace the log with its suffix starting at `keep_from`
fn rewrite_from(file: &mut File, path: &Path, keep_from: Lsn) -> Result<usize> {
    let scan = read_log(path)?;
    let (dropped, kept): (Vec<_>, Vec<_>) =
        scan.records.into_iter().partition(|r| r.lsn < keep_from);
    if dropped.is_empty() {
        return Ok(0);
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    for record in &kept {
        tmp.write_all(&encode_frame(record)?)?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BasaltError::Io(e.error))?;

    *file = OpenOptions::new().create(true).append(true).open(path)?;
    log::info!("WAL truncated: dropped {} records below LSN {}", dropped.len(), keep_from);
    Ok(dropped.len())
}
