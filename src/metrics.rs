// HOLDFAST METRICS STORE
// APPEND-ONLY 7-DAY SAMPLE STORE ON SQLITE. ONE PROCESS PER STORAGE
// DIRECTORY, ENFORCED BY AN ADVISORY LOCK. SINGLE CONNECTION BEHIND A
// MUTEX -- THE DATABASE HAS CORRUPTED UNDER CONCURRENT WRITERS BEFORE,
// SO WRITERS ARE SERIALIZED AND CROSS-PROCESS ACCESS IS REFUSED OUTRIGHT.
//
// FAILURE LADDER:
//   CORRUPT   -> BACK UP THE FILE, REINITIALIZE EMPTY, KEEP RUNNING
//   ENOSPC    -> STICKY DEGRADED MODE: DROP WRITES, SERVE CACHED P95
//   ANY OTHER -> RETRY ONCE, THEN REPORT ok=false AND LET CALLERS COAST

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::RETENTION_SEC;
use crate::log_warn;

pub const DB_FILE: &str = "metrics.db";
pub const LOCK_FILE: &str = "instance.lock";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Health {
    Available,
    Degraded,
    Unavailable,
}

impl Health {
    pub fn label(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Degraded => "DEGRADED",
            Self::Unavailable => "UNAVAILABLE",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SampleKind {
    Cpu,
    Mem,
    Net,
    Load,
}

impl SampleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Mem => "mem",
            Self::Net => "net",
            Self::Load => "load",
        }
    }

    fn cache_idx(self) -> usize {
        match self {
            Self::Cpu => 0,
            Self::Mem => 1,
            Self::Net => 2,
            Self::Load => 3,
        }
    }
}

#[derive(Clone, Copy)]
struct CachedP95 {
    value: f64,
    at: u64,
}

pub struct MetricsStore {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
    degraded: AtomicBool,
    unavailable: AtomicBool,
    cache: Mutex<[Option<CachedP95>; 4]>,
    last_probe_ts: AtomicU64,
    cache_ttl_sec: u64,
    probe_interval_sec: u64,
}

impl MetricsStore {
    pub fn open(dir: &Path, cache_ttl_sec: u64, probe_interval_sec: u64) -> Result<Self> {
        let db_path = dir.join(DB_FILE);
        let store = Self {
            db_path,
            conn: Mutex::new(None),
            degraded: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
            cache: Mutex::new([None; 4]),
            last_probe_ts: AtomicU64::new(0),
            cache_ttl_sec,
            probe_interval_sec,
        };
        let mut guard = store.lock_conn();
        match open_and_init(&store.db_path) {
            Ok(conn) => {
                if quick_check(&conn) {
                    *guard = Some(conn);
                } else {
                    drop(conn);
                    store.recover(&mut guard);
                }
            }
            Err(e) if is_corrupt_err(&e) => {
                store.recover(&mut guard);
            }
            Err(e) => {
                drop(guard);
                return Err(anyhow::Error::new(e)).context("open metrics store");
            }
        }
        drop(guard);
        if store.unavailable.load(Ordering::Relaxed) {
            bail!("metrics store unrecoverable at {}", store.db_path.display());
        }
        Ok(store)
    }

    fn lock_conn(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_cache(&self) -> MutexGuard<'_, [Option<CachedP95>; 4]> {
        match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // APPEND ONE SAMPLE. IN DEGRADED MODE WRITES ARE DROPPED SILENTLY --
    // THE FLAG IS STICKY AND ONLY A RESTART CLEARS IT.
    pub fn record(&self, kind: SampleKind, value: f64, ts: u64) {
        if self.degraded.load(Ordering::Relaxed) || self.unavailable.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.lock_conn();
        for attempt in 0..2 {
            let Some(conn) = guard.as_ref() else { return };
            match conn.execute(
                "INSERT INTO samples (ts, kind, value) VALUES (?1, ?2, ?3)",
                params![ts as i64, kind.as_str(), value],
            ) {
                Ok(_) => return,
                Err(e) if is_full_err(&e) => {
                    self.degraded.store(true, Ordering::Relaxed);
                    log_warn!(
                        "STORAGE FULL -- ENTERING DEGRADED MODE (WRITES DROPPED, CACHED P95 SERVED)"
                    );
                    return;
                }
                Err(e) if is_corrupt_err(&e) => {
                    self.recover(&mut guard);
                    return;
                }
                Err(e) if attempt == 0 => {
                    let _ = e; // RETRY ONCE
                }
                Err(e) => {
                    log_warn!("SAMPLE WRITE FAILED TWICE: {}", e);
                    return;
                }
            }
        }
    }

    // 95TH PERCENTILE OVER THE LAST 7 DAYS. TTL CACHE IN FRONT; A MISS IS
    // ONE ORDERED SCAN BOUNDED BY THE RETENTION WINDOW.
    pub fn p95(&self, kind: SampleKind, now: u64) -> (f64, bool) {
        let idx = kind.cache_idx();
        {
            let cache = self.lock_cache();
            if let Some(entry) = cache[idx] {
                if now.saturating_sub(entry.at) <= self.cache_ttl_sec {
                    return (entry.value, true);
                }
                // DEGRADED: STALE CACHE IS STILL THE BEST ANSWER WE HAVE
                if self.degraded.load(Ordering::Relaxed)
                    || self.unavailable.load(Ordering::Relaxed)
                {
                    return (entry.value, true);
                }
            } else if self.degraded.load(Ordering::Relaxed)
                || self.unavailable.load(Ordering::Relaxed)
            {
                return (0.0, false);
            }
        }

        let cutoff = now.saturating_sub(RETENTION_SEC);
        let mut guard = self.lock_conn();
        for attempt in 0..2 {
            let Some(conn) = guard.as_ref() else {
                return (0.0, false);
            };
            match query_p95(conn, kind, cutoff) {
                Ok(Some(value)) => {
                    self.lock_cache()[idx] = Some(CachedP95 { value, at: now });
                    return (value, true);
                }
                Ok(None) => return (0.0, false),
                Err(e) if is_corrupt_err(&e) => {
                    self.recover(&mut guard);
                    return self.stale_or_false(idx);
                }
                Err(e) if attempt == 0 => {
                    let _ = e;
                }
                Err(e) => {
                    log_warn!("P95 QUERY FAILED TWICE: {}", e);
                    return self.stale_or_false(idx);
                }
            }
        }
        (0.0, false)
    }

    fn stale_or_false(&self, idx: usize) -> (f64, bool) {
        match self.lock_cache()[idx] {
            Some(entry) => (entry.value, true),
            None => (0.0, false),
        }
    }

    pub fn count_7d(&self, now: u64) -> u64 {
        let cutoff = now.saturating_sub(RETENTION_SEC);
        let guard = self.lock_conn();
        let Some(conn) = guard.as_ref() else { return 0 };
        conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE ts >= ?1",
            params![cutoff as i64],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .unwrap_or(0)
    }

    // IDEMPOTENT TIME-BOUNDED DELETE
    pub fn purge_older_than(&self, cutoff: u64) {
        if self.degraded.load(Ordering::Relaxed) || self.unavailable.load(Ordering::Relaxed) {
            return;
        }
        let mut guard = self.lock_conn();
        let Some(conn) = guard.as_ref() else { return };
        match conn.execute("DELETE FROM samples WHERE ts < ?1", params![cutoff as i64]) {
            Ok(_) => {}
            Err(e) if is_full_err(&e) => {
                self.degraded.store(true, Ordering::Relaxed);
                log_warn!("STORAGE FULL DURING PURGE -- ENTERING DEGRADED MODE");
            }
            Err(e) if is_corrupt_err(&e) => self.recover(&mut guard),
            Err(e) => log_warn!("PURGE FAILED: {}", e),
        }
    }

    pub fn health(&self) -> Health {
        if self.unavailable.load(Ordering::Relaxed) {
            Health::Unavailable
        } else if self.degraded.load(Ordering::Relaxed) {
            Health::Degraded
        } else {
            Health::Available
        }
    }

    // PERIODIC PURGE + LIGHTWEIGHT CONSISTENCY PROBE
    pub fn maintenance_tick(&self, now: u64) {
        self.purge_older_than(now.saturating_sub(RETENTION_SEC));

        let last = self.last_probe_ts.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.probe_interval_sec {
            return;
        }
        self.last_probe_ts.store(now, Ordering::Relaxed);
        let mut guard = self.lock_conn();
        let Some(conn) = guard.as_ref() else { return };
        if !quick_check(conn) {
            self.recover(&mut guard);
        }
    }

    pub fn spawn_maintenance(
        store: Arc<Self>,
        shutdown: Arc<AtomicBool>,
        interval_sec: u64,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut elapsed = 0u64;
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(200));
                elapsed += 1;
                if elapsed >= interval_sec * 5 {
                    elapsed = 0;
                    store.maintenance_tick(crate::clock::now_ts());
                }
            }
        })
    }

    // BACK UP THE CORRUPT FILE, START EMPTY. CALLED WITH THE CONNECTION
    // SLOT HELD; THE OLD CONNECTION MUST ALREADY BE OUT OF THE SLOT OR IN
    // IT -- EITHER WAY IT IS DROPPED BEFORE THE RENAME.
    fn recover(&self, guard: &mut MutexGuard<'_, Option<Connection>>) {
        **guard = None;
        let ts = crate::clock::now_ts();
        let backup = PathBuf::from(format!("{}.corrupt.{}", self.db_path.display(), ts));
        if self.db_path.exists() {
            if let Err(e) = fs::rename(&self.db_path, &backup) {
                log_warn!("CORRUPT DB BACKUP FAILED: {}", e);
            }
        }
        for suffix in ["-wal", "-shm"] {
            let side = PathBuf::from(format!("{}{}", self.db_path.display(), suffix));
            let _ = fs::remove_file(side);
        }
        match open_and_init(&self.db_path) {
            Ok(conn) => {
                log_warn!(
                    "METRICS DB CORRUPT -- BACKED UP TO {} AND REINITIALIZED",
                    backup.display()
                );
                **guard = Some(conn);
            }
            Err(e) => {
                log_warn!("METRICS DB REINIT FAILED: {} -- STORE UNAVAILABLE", e);
                self.unavailable.store(true, Ordering::Relaxed);
            }
        }
        // THE 7-DAY HISTORY IS GONE; DROP THE TTL SO THE NEXT READ RESCANS,
        // BUT KEEP THE VALUES AS THE DEGRADED-PATH ANSWER.
        let mut cache = self.lock_cache();
        for entry in cache.iter_mut().flatten() {
            entry.at = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn force_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }
}

fn open_and_init(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\n\
         PRAGMA synchronous=NORMAL;\n\
         PRAGMA busy_timeout=2000;\n\
         CREATE TABLE IF NOT EXISTS samples (\n\
             ts    INTEGER NOT NULL,\n\
             kind  TEXT    NOT NULL,\n\
             value REAL    NOT NULL\n\
         );\n\
         CREATE INDEX IF NOT EXISTS idx_samples_kind_ts ON samples (kind, ts);",
    )?;
    Ok(conn)
}

// STRUCTURAL PROBE. "ok" OR BUST.
fn quick_check(conn: &Connection) -> bool {
    conn.query_row("PRAGMA quick_check(1)", [], |row| row.get::<_, String>(0))
        .map(|s| s == "ok")
        .unwrap_or(false)
}

fn query_p95(conn: &Connection, kind: SampleKind, cutoff: u64) -> rusqlite::Result<Option<f64>> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM samples WHERE kind = ?1 AND ts >= ?2",
        params![kind.as_str(), cutoff as i64],
        |row| row.get(0),
    )?;
    if n == 0 {
        return Ok(None);
    }
    let offset = ((n - 1) as f64 * 0.95).floor() as i64;
    conn.query_row(
        "SELECT value FROM samples WHERE kind = ?1 AND ts >= ?2 \
         ORDER BY value ASC LIMIT 1 OFFSET ?3",
        params![kind.as_str(), cutoff as i64, offset],
        |row| row.get(0),
    )
    .optional()
}

fn is_full_err(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, _) => {
            f.code == rusqlite::ErrorCode::DiskFull
        }
        _ => false,
    }
}

fn is_corrupt_err(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(f, _) => {
            f.code == rusqlite::ErrorCode::DatabaseCorrupt
                || f.code == rusqlite::ErrorCode::NotADatabase
        }
        _ => false,
    }
}

// --- STORAGE DIRECTORY GUARDS ---

// ADVISORY EXCLUSIVE LOCK, HELD FOR THE PROCESS LIFETIME. A SECOND
// INSTANCE ON THE SAME DIRECTORY MUST FAIL LOUDLY AT STARTUP.
pub struct StorageLock {
    _file: File,
    path: PathBuf,
}

impl StorageLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            bail!(
                "{} is already locked -- another holdfast owns this storage directory",
                path.display()
            );
        }
        Ok(Self { _file: file, path })
    }
}

impl Drop for StorageLock {
    fn drop(&mut self) {
        // CLOSING THE FD RELEASES THE LOCK; THE FILE STAYS AS A MARKER
        let _ = &self.path;
    }
}

// SAME-DEVICE CHECK AGAINST THE PARENT: A PERSISTENCE DIRECTORY THAT IS
// NOT A REAL MOUNT POINT MEANS THE VOLUME IS MISSING AND EVERYTHING WOULD
// LAND IN THE CONTAINER'S SCRATCH LAYER.
pub fn is_mount_point(dir: &Path) -> Result<bool> {
    let meta = fs::metadata(dir).with_context(|| format!("stat {}", dir.display()))?;
    let parent = match dir.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("/"),
        Some(p) => p,
        None => return Ok(true), // "/" IS A MOUNT POINT
    };
    let parent_meta = fs::metadata(parent).with_context(|| format!("stat {}", parent.display()))?;
    Ok(meta.dev() != parent_meta.dev())
}
