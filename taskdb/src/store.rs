//! The task store (component B, spec.md §4.B): operations that span the
//! global events database and the per-event task/log/artifact tables,
//! including the event-state rollup invariant.

use crate::error::{TaskDbError, TaskDbResult};
use crate::global::GlobalDb;
use crate::pool::EventDbPool;
use crate::tasks::{self, NewTask, TaskUpdate};
use crate::{artifacts, logs};
use sai_lib::model::{ArtifactRow, BuildMetricRow, EventRow, EventState, SaiState, TaskRow};
use sai_lib::platform::Platform;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct TaskStore {
    pub pool: EventDbPool,
    pub global: Arc<GlobalDb>,
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl TaskStore {
    pub fn open(db_prefix: impl AsRef<Path>) -> TaskDbResult<TaskStore> {
        let db_prefix = db_prefix.as_ref();
        let global = GlobalDb::open(GlobalDb::path_for(db_prefix))?;
        Ok(TaskStore {
            pool: EventDbPool::new(db_prefix),
            global: Arc::new(global),
        })
    }

    /// Serializes a freshly-parsed task set into a new event DB (spec.md
    /// §4.B), after writing the owning event row into the global DB.
    pub fn ingest_event(
        &self,
        uuid: &str,
        repo_name: &str,
        git_ref: &str,
        hash: &str,
        source_ip: &str,
        new_tasks: &[NewTask],
    ) -> TaskDbResult<(EventRow, Vec<TaskRow>)> {
        let t = now();
        let event = EventRow {
            uuid: uuid.to_string(),
            repo_name: repo_name.to_string(),
            git_ref: git_ref.to_string(),
            hash: hash.to_string(),
            source_ip: source_ip.to_string(),
            created: t,
            last_updated: t,
            state: EventState::Waiting,
        };
        self.global.insert_event(&event)?;

        let handle = self.pool.ensure_open(uuid, true)?;
        let rows = tasks::insert_tasks(&handle.conn(), uuid, new_tasks)?;
        info!(event_uuid = uuid, tasks = rows.len(), "ingested event");
        Ok((event, rows))
    }

    pub fn get_task(&self, task_uuid: &str) -> TaskDbResult<TaskRow> {
        let event_uuid = sai_lib::ids::task_uuid_to_event_uuid(task_uuid)
            .ok_or_else(|| TaskDbError::Domain(format!("malformed task uuid {task_uuid:?}")))?;
        let handle = self.pool.ensure_open(event_uuid, false)?;
        tasks::get_task(&handle.conn(), task_uuid)?
            .ok_or_else(|| TaskDbError::NoSuchTask(task_uuid.to_string()))
    }

    /// Applies `update` then re-derives and writes the owning event's
    /// state per the rollup rule in spec.md §4.B. This is the single
    /// place the invariant in spec.md §8 ("event.state = f(multiset of
    /// task states)") is maintained.
    pub fn update_task(&self, task_uuid: &str, update: &TaskUpdate) -> TaskDbResult<EventState> {
        let event_uuid = sai_lib::ids::task_uuid_to_event_uuid(task_uuid)
            .ok_or_else(|| TaskDbError::Domain(format!("malformed task uuid {task_uuid:?}")))?
            .to_string();
        let handle = self.pool.ensure_open(&event_uuid, false)?;
        {
            let conn = handle.conn();
            tasks::update_task(&conn, task_uuid, update)?;
        }
        self.rollup_event(&event_uuid)
    }

    fn rollup_event(&self, event_uuid: &str) -> TaskDbResult<EventState> {
        let handle = self.pool.ensure_open(event_uuid, false)?;
        let rows = tasks::tasks_for_event(&handle.conn(), event_uuid)?;
        let new_state = derive_event_state(&rows);
        self.global.set_event_state(event_uuid, new_state, now())?;
        Ok(new_state)
    }

    /// Cancel (spec.md §4.B): marks CANCELLED and unbinds the builder,
    /// returning the builder name the caller must signal (empty if the
    /// task was unbound).
    pub fn cancel_task(&self, task_uuid: &str) -> TaskDbResult<String> {
        let event_uuid = sai_lib::ids::task_uuid_to_event_uuid(task_uuid)
            .ok_or_else(|| TaskDbError::Domain(format!("malformed task uuid {task_uuid:?}")))?
            .to_string();
        let handle = self.pool.ensure_open(&event_uuid, false)?;
        let builder = {
            let conn = handle.conn();
            let task = tasks::get_task(&conn, task_uuid)?
                .ok_or_else(|| TaskDbError::NoSuchTask(task_uuid.to_string()))?;
            tasks::cancel_task(&conn, task_uuid)?;
            task.builder
        };
        self.rollup_event(&event_uuid)?;
        Ok(builder)
    }

    /// Reset-task (spec.md §4.B): wipes logs and artifacts and returns
    /// the task to WAITING.
    pub fn reset_task(&self, task_uuid: &str) -> TaskDbResult<()> {
        let event_uuid = sai_lib::ids::task_uuid_to_event_uuid(task_uuid)
            .ok_or_else(|| TaskDbError::Domain(format!("malformed task uuid {task_uuid:?}")))?
            .to_string();
        let handle = self.pool.ensure_open(&event_uuid, false)?;
        {
            let conn = handle.conn();
            logs::clear_logs_for_task(&conn, task_uuid)?;
            artifacts::clear_artifacts_for_task(&conn, task_uuid)?;
            tasks::reset_task_row(&conn, task_uuid)?;
        }
        self.rollup_event(&event_uuid)?;
        Ok(())
    }

    /// Rebuild: resubmits a terminal task as a fresh WAITING task with a
    /// new uuid, copying its build script and platform (supplemented
    /// from `original_source/src/builder/b-rebuild.c`; see SPEC_FULL.md
    /// §2).
    pub fn rebuild_task(&self, task_uuid: &str) -> TaskDbResult<TaskRow> {
        let original = self.get_task(task_uuid)?;
        let event_uuid = original.event_uuid.clone();
        let handle = self.pool.ensure_open(&event_uuid, false)?;
        let rows = tasks::insert_tasks(
            &handle.conn(),
            &event_uuid,
            &[NewTask {
                taskname: original.taskname.clone(),
                platform: original.platform.clone(),
                build: original.build.clone(),
            }],
        )?;
        self.rollup_event(&event_uuid)?;
        Ok(rows.into_iter().next().expect("insert_tasks returns exactly one row for one input"))
    }

    /// Deletes an event: the caller is expected to have already
    /// cancelled/signalled any bound builders (spec.md §8 scenario 5).
    pub fn delete_event(&self, event_uuid: &str) -> TaskDbResult<()> {
        self.global.delete_event(event_uuid)?;
        self.pool.delete_database(event_uuid)?;
        Ok(())
    }

    /// Reads one artifact's bytes back out for the download endpoint
    /// (spec.md §4.E), keyed by the `art_down_nonce` handed to the
    /// browser alongside the task so a download link never needs a
    /// session cookie.
    pub fn read_artifact(
        &self,
        task_uuid: &str,
        down_nonce: &str,
        filename: &str,
    ) -> TaskDbResult<(ArtifactRow, Vec<u8>)> {
        use std::io::Read;
        let event_uuid = sai_lib::ids::task_uuid_to_event_uuid(task_uuid)
            .ok_or_else(|| TaskDbError::Domain(format!("malformed task uuid {task_uuid:?}")))?;
        let handle = self.pool.ensure_open(event_uuid, false)?;
        let conn = handle.conn();
        let (rowid, row) = artifacts::find_by_down_nonce(&conn, task_uuid, down_nonce, filename)?;
        let mut blob = artifacts::open_blob_for_read(&conn, rowid)?;
        let mut buf = Vec::with_capacity(row.len.max(0) as usize);
        blob.read_to_end(&mut buf)?;
        Ok((row, buf))
    }

    /// The scheduler's pending-task scan (spec.md §4.D): incomplete
    /// events newest-first, preferring a task whose name matches one
    /// that failed on the most recent fully-ran previous event for the
    /// same (repo, ref, platform); otherwise oldest-uuid.
    pub fn pending_for(&self, platform: &Platform, exclude: Option<&str>) -> TaskDbResult<Option<TaskRow>> {
        let like = format!(
            "{}%",
            if platform.os_distro.is_empty() { "%" } else { platform.os_distro.as_str() }
        );
        for event in self.global.incomplete_events_newest_first()? {
            let handle = self.pool.ensure_open(&event.uuid, false)?;
            let candidates =
                tasks::oldest_waiting_for_platform(&handle.conn(), &like, exclude, 5)?;
            let matching: Vec<_> = candidates
                .into_iter()
                .filter(|t| platform.matches(&Platform::parse(&t.platform)))
                .collect();
            if matching.is_empty() {
                continue;
            }
            if let Some(prev) = self.global.most_recent_terminal_event(
                &event.repo_name,
                &event.git_ref,
                event.created,
            )? {
                if prev.state == EventState::Fail {
                    let prev_handle = self.pool.ensure_open(&prev.uuid, false)?;
                    let failed_names: std::collections::HashSet<_> =
                        tasks::tasks_for_event(&prev_handle.conn(), &prev.uuid)?
                            .into_iter()
                            .filter(|t| t.state == SaiState::Fail)
                            .map(|t| t.taskname)
                            .collect();
                    if let Some(priority) =
                        matching.iter().find(|t| failed_names.contains(&t.taskname))
                    {
                        return Ok(Some(priority.clone()));
                    }
                }
            }
            return Ok(matching.into_iter().next());
        }
        Ok(None)
    }

    /// Averaged resource estimate for rebinding `task` onto `builder`
    /// (spec.md §3/§4.D), keyed on the task's owning event's
    /// (repo, ref). Defaults to (0, 0) when no history exists yet.
    pub fn estimate_for(&self, builder: &str, task: &TaskRow) -> TaskDbResult<(i64, i64)> {
        let Some(event) = self.global.get_event(&task.event_uuid)? else {
            return Ok((0, 0));
        };
        let key = BuildMetricRow::key_for(builder, "0", &event.repo_name, &event.git_ref);
        Ok(self.global.estimate_for(&key)?.unwrap_or((0, 0)))
    }
}

/// Event-state rollup rule (spec.md §4.B).
pub fn derive_event_state(tasks: &[TaskRow]) -> EventState {
    if tasks.is_empty() {
        return EventState::Waiting;
    }
    let total = tasks.len();
    let success = tasks.iter().filter(|t| t.state == SaiState::Success).count();
    let fail = tasks.iter().filter(|t| t.state == SaiState::Fail).count();

    if success == total {
        EventState::Success
    } else if fail == total {
        EventState::Fail
    } else if fail > 0 {
        EventState::BeingBuiltHasFailures
    } else {
        EventState::BeingBuilt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> TaskStore {
        TaskStore::open(dir.path().join("sai")).unwrap()
    }

    fn task(state: SaiState) -> TaskRow {
        TaskRow {
            uuid: "a".repeat(64),
            event_uuid: "a".repeat(32),
            taskname: "build".into(),
            platform: "linux/x86_64/gcc".into(),
            state,
            build: String::new(),
            build_step: 0,
            build_step_count: 0,
            builder: String::new(),
            started: 0,
            duration: 0,
            est_peak_mem_kib: 0,
            est_disk_kib: 0,
            art_up_nonce: String::new(),
            art_down_nonce: String::new(),
        }
    }

    #[test]
    fn rollup_rules() {
        assert_eq!(derive_event_state(&[task(SaiState::Success)]), EventState::Success);
        assert_eq!(derive_event_state(&[task(SaiState::Fail)]), EventState::Fail);
        assert_eq!(
            derive_event_state(&[task(SaiState::Fail), task(SaiState::Waiting)]),
            EventState::BeingBuiltHasFailures
        );
        assert_eq!(
            derive_event_state(&[task(SaiState::Waiting), task(SaiState::PassedToBuilder)]),
            EventState::BeingBuilt
        );
    }

    #[test]
    fn ingest_update_and_rollup_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let event_uuid = sai_lib::ids::gen_event_uuid();
        let (event, tasks) = store
            .ingest_event(
                &event_uuid,
                "acme/widget",
                "refs/heads/main",
                "deadbeef",
                "127.0.0.1",
                &[NewTask {
                    taskname: "build".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "echo one\necho two".into(),
                }],
            )
            .unwrap();
        assert_eq!(event.state, EventState::Waiting);
        assert_eq!(tasks.len(), 1);

        let state = store
            .update_task(
                &tasks[0].uuid,
                &TaskUpdate {
                    state: Some(SaiState::Success),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(state, EventState::Success);
    }

    #[test]
    fn cancel_unbinds_builder_and_rolls_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let event_uuid = sai_lib::ids::gen_event_uuid();
        let (_event, tasks) = store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
                taskname: "t".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "true".into(),
            }])
            .unwrap();
        store
            .update_task(
                &tasks[0].uuid,
                &TaskUpdate {
                    state: Some(SaiState::PassedToBuilder),
                    builder: Some("builder1".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let builder = store.cancel_task(&tasks[0].uuid).unwrap();
        assert_eq!(builder, "builder1");
        let t = store.get_task(&tasks[0].uuid).unwrap();
        assert_eq!(t.state, SaiState::Cancelled);
        assert_eq!(t.builder, "");
    }

    #[test]
    fn pending_for_returns_oldest_waiting_matching_platform() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let event_uuid = sai_lib::ids::gen_event_uuid();
        let (_event, tasks) = store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
                taskname: "t".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "true".into(),
            }])
            .unwrap();
        let picked = store
            .pending_for(&Platform::parse("linux/x86_64/gcc"), None)
            .unwrap()
            .unwrap();
        assert_eq!(picked.uuid, tasks[0].uuid);
    }

    #[test]
    fn delete_event_removes_global_row_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let event_uuid = sai_lib::ids::gen_event_uuid();
        store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[])
            .unwrap();
        store.delete_event(&event_uuid).unwrap();
        assert!(store.global.get_event(&event_uuid).unwrap().is_none());
        assert!(!store.pool.db_path(&event_uuid).exists());
    }
}
