//! Per-listener transfer counters with daily JSON snapshots.
//!
//! Increments are lock-free atomics; the date lives behind a small mutex so
//! that a day rollover zeroes both counters together with the date change.
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Date format used in the snapshot file and its name
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Point-in-time copy of the counter, also the on-disk format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    #[serde(rename = "ServerBytes")]
    pub server_bytes: i64,
    #[serde(rename = "ClientBytes")]
    pub client_bytes: i64,
    #[serde(rename = "Date")]
    pub date: String,
}

impl CounterSnapshot {
    /// Human-readable rendering of both byte counts
    pub fn human_readable(&self) -> HumanCounter {
        HumanCounter {
            server: format_bytes(self.server_bytes),
            client: format_bytes(self.client_bytes),
            date: self.date.clone(),
        }
    }
}

impl fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Counter(ServerBytes={}, ClientBytes={}, Date={})",
            self.server_bytes, self.client_bytes, self.date
        )
    }
}

/// Scaled form of a [`CounterSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanCounter {
    pub server: String,
    pub client: String,
    pub date: String,
}

impl fmt::Display for HumanCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server: {}, Client: {} ({})",
            self.server, self.client, self.date
        )
    }
}

/// Shared transfer counter for one listener
#[derive(Debug)]
pub struct TransferCounter {
    port: u16,
    root_dir: PathBuf,
    server_bytes: AtomicI64,
    client_bytes: AtomicI64,
    modified: AtomicBool,
    date: Mutex<NaiveDate>,
}

impl TransferCounter {
    /// Create a counter for `port`, resuming today's snapshot file if present
    pub fn open(port: u16, root_dir: impl Into<PathBuf>) -> Self {
        Self::open_on(port, root_dir, today())
    }

    /// Same as [`TransferCounter::open`] with an explicit current date
    pub fn open_on(port: u16, root_dir: impl Into<PathBuf>, date: NaiveDate) -> Self {
        let counter = Self {
            port,
            root_dir: root_dir.into(),
            server_bytes: AtomicI64::new(0),
            client_bytes: AtomicI64::new(0),
            modified: AtomicBool::new(false),
            date: Mutex::new(date),
        };

        let path = counter.path_for(date);
        match load_snapshot(&path) {
            Ok(Some(snapshot)) if snapshot.date == date.format(DATE_FORMAT).to_string() => {
                info!("Loaded transfer counter from {:?}: {}", path, snapshot);
                counter
                    .server_bytes
                    .store(snapshot.server_bytes, Ordering::Relaxed);
                counter
                    .client_bytes
                    .store(snapshot.client_bytes, Ordering::Relaxed);
            }
            Ok(Some(snapshot)) => {
                warn!(
                    "Ignoring counter file {:?} with mismatched date {}",
                    path, snapshot.date
                );
            }
            Ok(None) => {
                debug!("No counter file at {:?}, starting from zero", path);
            }
            Err(e) => {
                warn!("Failed to read counter file {:?}: {}", path, e);
            }
        }

        counter
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bytes moved from the destination server to the client
    pub fn increment_server_bytes(&self, bytes: u64) {
        self.server_bytes
            .fetch_add(bytes as i64, Ordering::Relaxed);
        self.modified.store(true, Ordering::Release);
    }

    /// Bytes moved from the client to the destination server
    pub fn increment_client_bytes(&self, bytes: u64) {
        self.client_bytes
            .fetch_add(bytes as i64, Ordering::Relaxed);
        self.modified.store(true, Ordering::Release);
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let date = self.date.lock();
        CounterSnapshot {
            server_bytes: self.server_bytes.load(Ordering::Relaxed),
            client_bytes: self.client_bytes.load(Ordering::Relaxed),
            date: date.format(DATE_FORMAT).to_string(),
        }
    }

    /// Snapshot file path for a given day
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.root_dir.join(format!(
            "stats-{}-{}.json",
            self.port,
            date.format(DATE_FORMAT)
        ))
    }

    /// Flush against the current local date
    pub fn flush(&self) -> io::Result<bool> {
        self.flush_on(today())
    }

    /// Roll over to `today` if needed, then persist when modified.
    ///
    /// Returns whether a file was written.
    pub fn flush_on(&self, today: NaiveDate) -> io::Result<bool> {
        let snapshot = {
            let mut date = self.date.lock();
            if *date != today {
                info!(
                    "Transfer counter day rollover {} -> {}, resetting counters",
                    date.format(DATE_FORMAT),
                    today.format(DATE_FORMAT)
                );
                self.server_bytes.store(0, Ordering::Relaxed);
                self.client_bytes.store(0, Ordering::Relaxed);
                *date = today;
                self.modified.store(true, Ordering::Release);
            }

            if !self.modified.swap(false, Ordering::AcqRel) {
                return Ok(false);
            }

            CounterSnapshot {
                server_bytes: self.server_bytes.load(Ordering::Relaxed),
                client_bytes: self.client_bytes.load(Ordering::Relaxed),
                date: date.format(DATE_FORMAT).to_string(),
            }
        };

        let path = self.path_for(today);
        if let Err(e) = save_snapshot(&path, &snapshot) {
            // 写入失败时保留修改标记，下一轮重试
            self.modified.store(true, Ordering::Release);
            return Err(e);
        }

        debug!("Saved counter {} to {:?}", snapshot, path);
        Ok(true)
    }

    /// Spawn the periodic flush task; it flushes one last time on cancellation
    pub fn spawn_flusher(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.flush() {
                            warn!("Failed to flush transfer counter: {}", e);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        if let Err(e) = self.flush() {
                            warn!("Failed to flush transfer counter on shutdown: {}", e);
                        }
                        info!("Transfer counter flusher stopped: {}", self.snapshot());
                        break;
                    }
                }
            }
        })
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Read a snapshot file, `Ok(None)` when it does not exist
pub fn load_snapshot(path: &Path) -> io::Result<Option<CounterSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    let snapshot = serde_json::from_str(&data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(snapshot))
}

/// Write a snapshot atomically (temp file + rename)
pub fn save_snapshot(path: &Path, snapshot: &CounterSnapshot) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(tmp, path)
}

/// 格式化字节数为人类可读格式（1024 进制，保留一位小数，保留符号）
pub fn format_bytes(bytes: i64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB", "EB"];

    let sign = if bytes < 0 { "-" } else { "" };
    let mut size = bytes.unsigned_abs() as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{}{:.1} {}", sign, size, UNITS[unit_idx])
}
