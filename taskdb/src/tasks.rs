//! Task CRUD against a single per-event database connection (spec.md
//! §4.B). Cross-event concerns (event-state rollup, the scheduler's
//! multi-event scan) live in [`crate::store`].

use crate::error::{classify, TaskDbError, TaskDbResult};
use rusqlite::{params, Connection};
use sai_lib::model::{SaiState, TaskRow};

/// Freshly-parsed task, not yet a row: everything the ingest path knows
/// before assigning nonces (spec.md §4.B "serialize a freshly-parsed
/// task set into a new event DB").
#[derive(Debug, Clone)]
pub struct NewTask {
    pub taskname: String,
    pub platform: String,
    pub build: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub state: Option<SaiState>,
    pub started: Option<i64>,
    pub duration: Option<i64>,
    pub build_step: Option<i64>,
    pub builder: Option<String>,
    pub est_peak_mem_kib: Option<i64>,
    pub est_disk_kib: Option<i64>,
}

pub fn insert_tasks(
    conn: &Connection,
    event_uuid: &str,
    tasks: &[NewTask],
) -> TaskDbResult<Vec<TaskRow>> {
    let mut out = Vec::with_capacity(tasks.len());
    for t in tasks {
        let uuid = sai_lib::ids::gen_task_uuid(event_uuid);
        let row = TaskRow {
            uuid: uuid.clone(),
            event_uuid: event_uuid.to_string(),
            taskname: t.taskname.clone(),
            platform: t.platform.clone(),
            state: SaiState::Waiting,
            build: t.build.clone(),
            build_step: 0,
            build_step_count: 2 + t.build.lines().count() as i64,
            builder: String::new(),
            started: 0,
            duration: 0,
            est_peak_mem_kib: 0,
            est_disk_kib: 0,
            art_up_nonce: sai_lib::ids::gen_nonce(),
            art_down_nonce: sai_lib::ids::gen_nonce(),
        };
        conn.execute(
            "INSERT INTO tasks (uuid, event_uuid, taskname, platform, state, build, build_step,
                build_step_count, builder, started, duration, est_peak_mem_kib, est_disk_kib,
                art_up_nonce, art_down_nonce)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                row.uuid,
                row.event_uuid,
                t.taskname,
                row.platform,
                state_str(row.state),
                row.build,
                row.build_step,
                row.build_step_count,
                row.builder,
                row.started,
                row.duration,
                row.est_peak_mem_kib,
                row.est_disk_kib,
                row.art_up_nonce,
                row.art_down_nonce,
            ],
        )
        .map_err(classify)?;
        out.push(row);
    }
    Ok(out)
}

pub fn get_task(conn: &Connection, uuid: &str) -> TaskDbResult<Option<TaskRow>> {
    let mut stmt = conn.prepare(
        "SELECT uuid, event_uuid, taskname, platform, state, build, build_step, build_step_count,
                builder, started, duration, est_peak_mem_kib, est_disk_kib, art_up_nonce, art_down_nonce
         FROM tasks WHERE uuid = ?1",
    )?;
    let mut rows = stmt.query(params![uuid])?;
    if let Some(row) = rows.next()? {
        Ok(Some(row_to_task(row)?))
    } else {
        Ok(None)
    }
}

pub fn tasks_for_event(conn: &Connection, event_uuid: &str) -> TaskDbResult<Vec<TaskRow>> {
    let mut stmt = conn.prepare(
        "SELECT uuid, event_uuid, taskname, platform, state, build, build_step, build_step_count,
                builder, started, duration, est_peak_mem_kib, est_disk_kib, art_up_nonce, art_down_nonce
         FROM tasks WHERE event_uuid = ?1",
    )?;
    let rows = stmt.query_map(params![event_uuid], row_to_task)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(classify)
}

/// Applies a partial update atomically (spec.md §4.B: "update a task's
/// (state, started, duration, build_step, builder) atomically").
pub fn update_task(conn: &Connection, uuid: &str, update: &TaskUpdate) -> TaskDbResult<()> {
    let existing = get_task(conn, uuid)?.ok_or_else(|| TaskDbError::NoSuchTask(uuid.to_string()))?;
    let state = update.state.unwrap_or(existing.state);
    let started = update.started.unwrap_or(existing.started);
    let duration = update.duration.unwrap_or(existing.duration);
    let build_step = update.build_step.unwrap_or(existing.build_step);
    let builder = update.builder.clone().unwrap_or(existing.builder);
    let est_peak_mem_kib = update.est_peak_mem_kib.unwrap_or(existing.est_peak_mem_kib);
    let est_disk_kib = update.est_disk_kib.unwrap_or(existing.est_disk_kib);

    conn.execute(
        "UPDATE tasks SET state = ?1, started = ?2, duration = ?3, build_step = ?4, builder = ?5,
                est_peak_mem_kib = ?6, est_disk_kib = ?7
         WHERE uuid = ?8",
        params![
            state_str(state),
            started,
            duration,
            build_step,
            builder,
            est_peak_mem_kib,
            est_disk_kib,
            uuid
        ],
    )
    .map_err(classify)?;
    Ok(())
}

/// Cancellation semantics (spec.md §4.B): mark CANCELLED, unbind the
/// builder. Callers are responsible for signalling the bound builder to
/// terminate its subprocess.
pub fn cancel_task(conn: &Connection, uuid: &str) -> TaskDbResult<()> {
    conn.execute(
        "UPDATE tasks SET state = ?1, builder = '' WHERE uuid = ?2",
        params![state_str(SaiState::Cancelled), uuid],
    )
    .map_err(classify)?;
    Ok(())
}

/// Reset-task (spec.md §4.B): returns the task to WAITING. Log/artifact
/// wiping is the caller's job (it spans the `logs`/`artifacts` tables,
/// see [`crate::logs`] and [`crate::artifacts`]) so this only touches the
/// `tasks` row.
pub fn reset_task_row(conn: &Connection, uuid: &str) -> TaskDbResult<()> {
    conn.execute(
        "UPDATE tasks SET state = ?1, started = 0, duration = 0, build_step = 0, builder = ''
         WHERE uuid = ?2",
        params![state_str(SaiState::Waiting), uuid],
    )
    .map_err(classify)?;
    Ok(())
}

/// Oldest-uuid fallback scan for a platform within one event, skipping
/// `exclude`, used by the scheduler after the cross-event priority
/// lookup in [`crate::store`] comes up empty (spec.md §4.D).
pub fn oldest_waiting_for_platform(
    conn: &Connection,
    platform_prefix_like: &str,
    exclude: Option<&str>,
    limit: u32,
) -> TaskDbResult<Vec<TaskRow>> {
    let mut stmt = conn.prepare(
        "SELECT uuid, event_uuid, taskname, platform, state, build, build_step, build_step_count,
                builder, started, duration, est_peak_mem_kib, est_disk_kib, art_up_nonce, art_down_nonce
         FROM tasks
         WHERE state = ?1 AND platform LIKE ?2 AND uuid != ?3
         ORDER BY uuid ASC LIMIT ?4",
    )?;
    let rows = stmt.query_map(
        params![
            state_str(SaiState::Waiting),
            platform_prefix_like,
            exclude.unwrap_or(""),
            limit
        ],
        row_to_task,
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(classify)
}

pub fn state_str(s: SaiState) -> &'static str {
    match s {
        SaiState::Waiting => "WAITING",
        SaiState::PassedToBuilder => "PASSED_TO_BUILDER",
        SaiState::BeingBuilt => "BEING_BUILT",
        SaiState::Success => "SUCCESS",
        SaiState::Fail => "FAIL",
        SaiState::Cancelled => "CANCELLED",
        SaiState::BeingBuiltHasFailures => "BEING_BUILT_HAS_FAILURES",
        SaiState::Deleted => "DELETED",
    }
}

fn parse_state(s: &str) -> rusqlite::Result<SaiState> {
    Ok(match s {
        "WAITING" => SaiState::Waiting,
        "PASSED_TO_BUILDER" => SaiState::PassedToBuilder,
        "BEING_BUILT" => SaiState::BeingBuilt,
        "SUCCESS" => SaiState::Success,
        "FAIL" => SaiState::Fail,
        "CANCELLED" => SaiState::Cancelled,
        "BEING_BUILT_HAS_FAILURES" => SaiState::BeingBuiltHasFailures,
        other => {
            return Err(rusqlite::Error::InvalidColumnType(
                0,
                other.to_string(),
                rusqlite::types::Type::Text,
            ))
        }
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        uuid: row.get(0)?,
        event_uuid: row.get(1)?,
        taskname: row.get(2)?,
        platform: row.get(3)?,
        state: parse_state(&row.get::<_, String>(4)?)?,
        build: row.get(5)?,
        build_step: row.get(6)?,
        build_step_count: row.get(7)?,
        builder: row.get(8)?,
        started: row.get(9)?,
        duration: row.get(10)?,
        est_peak_mem_kib: row.get(11)?,
        est_disk_kib: row.get(12)?,
        art_up_nonce: row.get(13)?,
        art_down_nonce: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn fresh_conn(event_uuid: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::schema::PER_EVENT_SCHEMA).unwrap();
        let _ = event_uuid;
        conn
    }

    #[test]
    fn insert_and_fetch() {
        let event_uuid = "a".repeat(32);
        let conn = fresh_conn(&event_uuid);
        let rows = insert_tasks(
            &conn,
            &event_uuid,
            &[NewTask {
                taskname: "build".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "echo one\necho two".into(),
            }],
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0].uuid[0..32], event_uuid.as_str());
        assert_eq!(rows[0].build_step_count, 4);

        let fetched = get_task(&conn, &rows[0].uuid).unwrap().unwrap();
        assert_eq!(fetched.state, SaiState::Waiting);
    }

    #[test]
    fn update_then_reset() {
        let event_uuid = "b".repeat(32);
        let conn = fresh_conn(&event_uuid);
        let rows = insert_tasks(
            &conn,
            &event_uuid,
            &[NewTask {
                taskname: "build".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "echo hi".into(),
            }],
        )
        .unwrap();
        let uuid = &rows[0].uuid;

        update_task(
            &conn,
            uuid,
            &TaskUpdate {
                state: Some(SaiState::PassedToBuilder),
                started: Some(1000),
                builder: Some("builder1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let t = get_task(&conn, uuid).unwrap().unwrap();
        assert_eq!(t.state, SaiState::PassedToBuilder);
        assert_eq!(t.builder, "builder1");

        reset_task_row(&conn, uuid).unwrap();
        let t = get_task(&conn, uuid).unwrap().unwrap();
        assert_eq!(t.state, SaiState::Waiting);
        assert_eq!(t.builder, "");
        assert_eq!(t.started, 0);
    }

    #[test]
    fn oldest_waiting_excludes_rejected_uuid() {
        let event_uuid = "c".repeat(32);
        let conn = fresh_conn(&event_uuid);
        let rows = insert_tasks(
            &conn,
            &event_uuid,
            &[
                NewTask {
                    taskname: "a".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "true".into(),
                },
                NewTask {
                    taskname: "b".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "true".into(),
                },
            ],
        )
        .unwrap();
        let first = oldest_waiting_for_platform(&conn, "linux/x86_64/gcc", None, 5).unwrap();
        assert_eq!(first.len(), 2);

        let excluded = oldest_waiting_for_platform(
            &conn,
            "linux/x86_64/gcc",
            Some(&rows[0].uuid),
            5,
        )
        .unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].uuid, rows[1].uuid);
    }
}
