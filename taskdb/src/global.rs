//! The global `<db_prefix>-events.sqlite3` database: event rows and the
//! persisted builder-registration rows (spec.md §6 filesystem layout).

use crate::error::{classify, TaskDbResult};
use crate::schema::GLOBAL_SCHEMA;
use rusqlite::{params, Connection};
use sai_lib::model::{BuildMetricRow, EventRow, EventState};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct GlobalDb {
    conn: Mutex<Connection>,
}

impl GlobalDb {
    pub fn open(path: impl AsRef<Path>) -> TaskDbResult<GlobalDb> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(GLOBAL_SCHEMA)?;
        Ok(GlobalDb {
            conn: Mutex::new(conn),
        })
    }

    pub fn path_for(db_prefix: &Path) -> PathBuf {
        let mut name = db_prefix
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str("-events.sqlite3");
        let mut p = db_prefix.to_path_buf();
        p.pop();
        p.push(name);
        p
    }

    pub fn insert_event(&self, event: &EventRow) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        conn.execute(
            "INSERT INTO events (uuid, repo_name, git_ref, hash, source_ip, created, last_updated, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.uuid,
                event.repo_name,
                event.git_ref,
                event.hash,
                event.source_ip,
                event.created,
                event.last_updated,
                state_str(event.state),
            ],
        )
        .map_err(classify)?;
        Ok(())
    }

    pub fn get_event(&self, uuid: &str) -> TaskDbResult<Option<EventRow>> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT uuid, repo_name, git_ref, hash, source_ip, created, last_updated, state
             FROM events WHERE uuid = ?1",
        )?;
        let mut rows = stmt.query(params![uuid])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_event(row)?))
        } else {
            Ok(None)
        }
    }

    /// Sets `state` and bumps `last_updated` (spec.md §4.B event-state
    /// rollup).
    pub fn set_event_state(&self, uuid: &str, state: EventState, now: i64) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        conn.execute(
            "UPDATE events SET state = ?1, last_updated = ?2 WHERE uuid = ?3",
            params![state_str(state), now, uuid],
        )
        .map_err(classify)?;
        Ok(())
    }

    /// Hard-deletes the event row. Callers are responsible for also
    /// deleting the per-event DB files via `EventDbPool::delete_database`
    /// (spec.md §8 scenario 5).
    pub fn delete_event(&self, uuid: &str) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        conn.execute("DELETE FROM events WHERE uuid = ?1", params![uuid])
            .map_err(classify)?;
        Ok(())
    }

    /// Incomplete events for `repo_name`/`git_ref`, newest first — the
    /// scan order the scheduler uses (spec.md §4.D).
    pub fn incomplete_events_newest_first(&self) -> TaskDbResult<Vec<EventRow>> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT uuid, repo_name, git_ref, hash, source_ip, created, last_updated, state
             FROM events
             WHERE state NOT IN ('SUCCESS', 'FAIL', 'CANCELLED', 'DELETED')
             ORDER BY created DESC",
        )?;
        let rows = stmt.query_map([], row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(classify)
    }

    /// The most recent fully-ran (terminal-state) previous event for the
    /// same `(repo_name, git_ref)`, used by the scheduler's
    /// previous-failure priority rule (spec.md §4.D).
    pub fn most_recent_terminal_event(
        &self,
        repo_name: &str,
        git_ref: &str,
        before_created: i64,
    ) -> TaskDbResult<Option<EventRow>> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT uuid, repo_name, git_ref, hash, source_ip, created, last_updated, state
             FROM events
             WHERE repo_name = ?1 AND git_ref = ?2 AND created < ?3
               AND state IN ('SUCCESS', 'FAIL')
             ORDER BY created DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![repo_name, git_ref, before_created])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row_to_event(row)?))
        } else {
            Ok(None)
        }
    }

    pub fn upsert_builder_row(
        &self,
        name: &str,
        platforms_csv: &str,
        ongoing: u32,
        instances: u32,
        peer_ip: &str,
        online: bool,
    ) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        conn.execute(
            "INSERT INTO builders (name, platforms, ongoing, instances, peer_ip, online)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                platforms = excluded.platforms,
                ongoing = excluded.ongoing,
                instances = excluded.instances,
                peer_ip = excluded.peer_ip,
                online = excluded.online",
            params![name, platforms_csv, ongoing, instances, peer_ip, online as i64],
        )
        .map_err(classify)?;
        Ok(())
    }

    pub fn set_builder_online(&self, name: &str, online: bool) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        conn.execute(
            "UPDATE builders SET online = ?1 WHERE name = ?2",
            params![online as i64, name],
        )
        .map_err(classify)?;
        Ok(())
    }

    /// Records one completed step's resource usage (spec.md §3
    /// `build_metrics`).
    pub fn record_metric(&self, row: &BuildMetricRow) -> TaskDbResult<()> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        crate::metrics::insert_metric(&conn, row)
    }

    /// Averaged peak-mem/disk estimate for a metrics key, if any history
    /// exists yet (feeds `est_peak_mem_kib`/`est_disk_kib`, spec.md §3).
    pub fn estimate_for(&self, key: &str) -> TaskDbResult<Option<(i64, i64)>> {
        let conn = self.conn.lock().expect("global db mutex poisoned");
        crate::metrics::estimate(&conn, key)
    }
}

fn state_str(s: EventState) -> &'static str {
    match s {
        EventState::Waiting => "WAITING",
        EventState::PassedToBuilder => "PASSED_TO_BUILDER",
        EventState::BeingBuilt => "BEING_BUILT",
        EventState::Success => "SUCCESS",
        EventState::Fail => "FAIL",
        EventState::Cancelled => "CANCELLED",
        EventState::BeingBuiltHasFailures => "BEING_BUILT_HAS_FAILURES",
        EventState::Deleted => "DELETED",
    }
}

pub(crate) fn parse_state(s: &str) -> rusqlite::Result<EventState> {
    Ok(match s {
        "WAITING" => EventState::Waiting,
        "PASSED_TO_BUILDER" => EventState::PassedToBuilder,
        "BEING_BUILT" => EventState::BeingBuilt,
        "SUCCESS" => EventState::Success,
        "FAIL" => EventState::Fail,
        "CANCELLED" => EventState::Cancelled,
        "BEING_BUILT_HAS_FAILURES" => EventState::BeingBuiltHasFailures,
        "DELETED" => EventState::Deleted,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                other.to_string(),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<EventRow> {
    Ok(EventRow {
        uuid: row.get(0)?,
        repo_name: row.get(1)?,
        git_ref: row.get(2)?,
        hash: row.get(3)?,
        source_ip: row.get(4)?,
        created: row.get(5)?,
        last_updated: row.get(6)?,
        state: parse_state(&row.get::<_, String>(7)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(uuid: &str) -> EventRow {
        EventRow {
            uuid: uuid.to_string(),
            repo_name: "acme/widget".to_string(),
            git_ref: "refs/heads/main".to_string(),
            hash: "deadbeef".to_string(),
            source_ip: "127.0.0.1".to_string(),
            created: 1000,
            last_updated: 1000,
            state: EventState::Waiting,
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db = GlobalDb::open(dir.path().join("events.sqlite3")).unwrap();
        let e = sample_event(&"a".repeat(32));
        db.insert_event(&e).unwrap();
        let got = db.get_event(&e.uuid).unwrap().unwrap();
        assert_eq!(got.repo_name, e.repo_name);
        assert_eq!(got.state, EventState::Waiting);
    }

    #[test]
    fn state_transitions_and_newest_first_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = GlobalDb::open(dir.path().join("events.sqlite3")).unwrap();
        let mut e1 = sample_event(&"a".repeat(32));
        e1.created = 100;
        let mut e2 = sample_event(&"b".repeat(32));
        e2.created = 200;
        db.insert_event(&e1).unwrap();
        db.insert_event(&e2).unwrap();

        let incomplete = db.incomplete_events_newest_first().unwrap();
        assert_eq!(incomplete[0].uuid, e2.uuid);
        assert_eq!(incomplete[1].uuid, e1.uuid);

        db.set_event_state(&e2.uuid, EventState::Success, 250).unwrap();
        let incomplete = db.incomplete_events_newest_first().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].uuid, e1.uuid);
    }

    #[test]
    fn most_recent_terminal_event_for_repo_ref() {
        let dir = tempfile::tempdir().unwrap();
        let db = GlobalDb::open(dir.path().join("events.sqlite3")).unwrap();
        let mut old = sample_event(&"a".repeat(32));
        old.created = 100;
        old.state = EventState::Fail;
        db.insert_event(&old).unwrap();

        let found = db
            .most_recent_terminal_event(&old.repo_name, &old.git_ref, 200)
            .unwrap()
            .unwrap();
        assert_eq!(found.uuid, old.uuid);
    }
}
