//! Event DB pool (component A, spec.md §4.A): open/close/cache per-event
//! SQLite handles with refcounting and idle eviction.
//!
//! `EventDbHandle` is an owning RAII handle whose `Drop` decrements the
//! pool's refcount — spec.md §9's design note calls for exactly this in
//! place of the source's manual `ensure_open`/`close` pairing.

use crate::error::{classify, TaskDbError, TaskDbResult};
use crate::schema::PER_EVENT_SCHEMA;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const IDLE_EVICTION: Duration = Duration::from_secs(60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

struct CacheEntry {
    conn: Arc<Mutex<Connection>>,
    refcount: usize,
    idle_since: Option<Instant>,
}

struct Inner {
    db_prefix: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

/// Shared, cloneable handle to the pool. Cheap to clone (an `Arc`
/// underneath); every component that needs a per-event DB holds one.
#[derive(Clone)]
pub struct EventDbPool {
    inner: Arc<Inner>,
}

/// An owning reference to an open per-event database. `Drop` decrements
/// the pool's refcount for this event uuid; it does not necessarily
/// close the underlying connection immediately (the 60s idle sweep does
/// that), which is what lets a `close` immediately followed by a fresh
/// `ensure_open` return the identical handle object (spec.md §8).
pub struct EventDbHandle {
    pool: EventDbPool,
    event_uuid: String,
    conn: Arc<Mutex<Connection>>,
}

impl EventDbHandle {
    pub fn event_uuid(&self) -> &str {
        &self.event_uuid
    }

    pub fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("event db mutex poisoned")
    }
}

impl Drop for EventDbHandle {
    fn drop(&mut self) {
        self.pool.release(&self.event_uuid);
    }
}

fn sanitize_uuid(event_uuid: &str) -> TaskDbResult<()> {
    // Filenames are derived from the uuid after stripping path separators
    // (spec.md §4.A "security"); reject anything that isn't plain hex
    // rather than trying to strip it, since a task uuid is always
    // generated internally and should never contain one.
    if event_uuid.is_empty() || !event_uuid.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(TaskDbError::Domain(format!(
            "refusing unsafe event uuid {event_uuid:?}"
        )));
    }
    Ok(())
}

impl EventDbPool {
    pub fn new(db_prefix: impl Into<PathBuf>) -> EventDbPool {
        EventDbPool {
            inner: Arc::new(Inner {
                db_prefix: db_prefix.into(),
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn db_path(&self, event_uuid: &str) -> PathBuf {
        let mut p = self.inner.db_prefix.clone();
        let mut name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(&format!("-event-{event_uuid}.sqlite3"));
        p.pop();
        p.push(name);
        p
    }

    /// Open (creating if requested and absent) the per-event database,
    /// incrementing its refcount. Returns a distinct error for a failed
    /// open vs. a busy database (spec.md §4.A).
    pub fn ensure_open(&self, event_uuid: &str, create_if_missing: bool) -> TaskDbResult<EventDbHandle> {
        sanitize_uuid(event_uuid)?;
        let mut entries = self.inner.entries.lock().expect("pool mutex poisoned");

        if let Some(entry) = entries.get_mut(event_uuid) {
            entry.refcount += 1;
            entry.idle_since = None;
            debug!(event_uuid, refcount = entry.refcount, "event db cache hit");
            return Ok(EventDbHandle {
                pool: self.clone(),
                event_uuid: event_uuid.to_string(),
                conn: entry.conn.clone(),
            });
        }

        let path = self.db_path(event_uuid);
        if !path.exists() && !create_if_missing {
            return Err(TaskDbError::NoSuchEvent(event_uuid.to_string()));
        }

        let conn = open_and_prepare(&path).map_err(TaskDbError::OpenFailed)?;
        let conn = Arc::new(Mutex::new(conn));
        entries.insert(
            event_uuid.to_string(),
            CacheEntry {
                conn: conn.clone(),
                refcount: 1,
                idle_since: None,
            },
        );
        info!(event_uuid, ?path, "opened event db");

        Ok(EventDbHandle {
            pool: self.clone(),
            event_uuid: event_uuid.to_string(),
            conn,
        })
    }

    fn release(&self, event_uuid: &str) {
        let mut entries = self.inner.entries.lock().expect("pool mutex poisoned");
        if let Some(entry) = entries.get_mut(event_uuid) {
            entry.refcount = entry.refcount.saturating_sub(1);
            if entry.refcount == 0 {
                entry.idle_since = Some(Instant::now());
            }
        }
    }

    /// Closes and drops cache entries idle for at least 60s. Intended to
    /// be called once a second from a `tokio::time::interval` task.
    pub fn sweep_idle(&self) {
        let mut entries = self.inner.entries.lock().expect("pool mutex poisoned");
        entries.retain(|event_uuid, entry| {
            let expired = entry
                .idle_since
                .map(|since| since.elapsed() >= IDLE_EVICTION)
                .unwrap_or(false);
            if expired {
                debug!(event_uuid, "evicting idle event db from cache");
            }
            !expired
        });
    }

    pub fn sweep_interval() -> Duration {
        SWEEP_INTERVAL
    }

    /// Deletes the three files backing an event's database (spec.md
    /// §4.A): `<prefix>-event-<uuid>.sqlite3` and its `-wal`/`-shm`
    /// siblings. The cache entry, if any, is dropped first.
    pub fn delete_database(&self, event_uuid: &str) -> TaskDbResult<()> {
        sanitize_uuid(event_uuid)?;
        {
            let mut entries = self.inner.entries.lock().expect("pool mutex poisoned");
            entries.remove(event_uuid);
        }
        let base = self.db_path(event_uuid);
        for suffix in ["", "-wal", "-shm"] {
            let mut p = base.clone().into_os_string();
            p.push(suffix);
            let p = PathBuf::from(p);
            if p.exists() {
                if let Err(e) = std::fs::remove_file(&p) {
                    warn!(?p, error = %e, "failed to remove event db file");
                }
            }
        }
        Ok(())
    }
}

fn open_and_prepare(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.execute_batch(PER_EVENT_SCHEMA)?;
    Ok(conn)
}

pub(crate) fn busy_or(err: rusqlite::Error) -> TaskDbError {
    classify(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(dir: &tempfile::TempDir) -> EventDbPool {
        EventDbPool::new(dir.path().join("sai"))
    }

    #[test]
    fn ensure_open_creates_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let uuid = "a".repeat(32);
        let h1 = pool.ensure_open(&uuid, true).unwrap();
        assert!(pool.db_path(&uuid).exists());
        drop(h1);
        // refcount is 0 but within the idle window, so the cache entry
        // is the same handle on the next open (spec.md §8 Cache law).
        let h2 = pool.ensure_open(&uuid, false).unwrap();
        assert_eq!(h2.event_uuid(), uuid);
    }

    #[test]
    fn missing_db_without_create_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let uuid = "b".repeat(32);
        assert!(matches!(
            pool.ensure_open(&uuid, false),
            Err(TaskDbError::NoSuchEvent(_))
        ));
    }

    #[test]
    fn delete_database_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let uuid = "c".repeat(32);
        let h = pool.ensure_open(&uuid, true).unwrap();
        drop(h);
        pool.delete_database(&uuid).unwrap();
        assert!(!pool.db_path(&uuid).exists());
    }

    #[test]
    fn rejects_unsafe_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        assert!(pool.ensure_open("../../etc/passwd", true).is_err());
    }
}
