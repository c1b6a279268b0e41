//! Task scheduler (spec.md §4.D): a single `Scheduler` owned by one long-lived
//! tokio task, with every other task talking to it over an
//! `mpsc::Sender<SchedulerCommand>` channel plus a 1 Hz tick. Scheduling
//! state lives on exactly one task, so no mutex discipline is needed
//! for the scheduling decision itself (spec.md §5) even though the
//! process overall is multi-threaded.

use crate::dispatch::next_step;
use sai_lib::model::{SaiState, TaskRow};
use sai_lib::platform::Platform;
use sai_registry::BuilderRegistry;
use sai_taskdb::{TaskDbResult, TaskStore, TaskUpdate};
use std::sync::Arc;
use tracing::{info, warn};

/// Up to 4 retries beyond the first candidate per builder per tick
/// (spec.md §4.D).
const MAX_CANDIDATE_RETRIES: usize = 4;

#[derive(Debug)]
pub enum SchedulerCommand {
    TaskStateChanged,
    BuilderConnected { name: String },
    BuilderFreeSlot { name: String },
}

pub struct Dispatched {
    pub builder: String,
    pub task_uuid: String,
    pub step: crate::dispatch::Step,
}

pub struct Scheduler {
    task_store: Arc<TaskStore>,
    registry: Arc<BuilderRegistry>,
}

impl Scheduler {
    pub fn new(task_store: Arc<TaskStore>, registry: Arc<BuilderRegistry>) -> Scheduler {
        Scheduler { task_store, registry }
    }

    /// One pass over every builder with a free slot (spec.md §4.D). This
    /// is called once a second by the owning task's
    /// `tokio::time::interval`, and again immediately after any edge
    /// trigger is drained from the command channel.
    pub fn tick(&self) -> TaskDbResult<Vec<Dispatched>> {
        let mut dispatched = Vec::new();
        for (builder, platform) in self.registry.connected_builder_platforms() {
            if let Some(d) = self.try_dispatch_to_builder(&builder, &platform)? {
                dispatched.push(d);
            }
        }
        Ok(dispatched)
    }

    fn try_dispatch_to_builder(
        &self,
        builder: &str,
        platform: &Platform,
    ) -> TaskDbResult<Option<Dispatched>> {
        let Some(snapshot) = self.registry.snapshot(builder) else {
            return Ok(None);
        };
        if snapshot.avail_slots == 0 {
            return Ok(None);
        }

        let mut exclude = self.registry.last_rejection(builder);
        for attempt in 0..=MAX_CANDIDATE_RETRIES {
            let Some(candidate) = self.task_store.pending_for(platform, exclude.as_deref())? else {
                return Ok(None);
            };
            let (est_mem, est_disk) = self.task_store.estimate_for(builder, &candidate)?;
            if est_mem as u64 <= snapshot.avail_mem_kib && est_disk as u64 <= snapshot.avail_sto_kib
            {
                return self.bind_task(builder, &candidate, est_mem, est_disk).map(Some);
            }
            warn!(
                builder,
                task_uuid = candidate.uuid,
                attempt,
                "candidate exceeds builder resource budget, retrying"
            );
            exclude = Some(candidate.uuid);
        }
        Ok(None)
    }

    /// Binding protocol (spec.md §4.D): PASSED_TO_BUILDER + started=now,
    /// add to inflight, provisionally decrement avail_slots, and
    /// determine the first step message to enqueue on the link.
    fn bind_task(
        &self,
        builder: &str,
        task: &TaskRow,
        est_mem: i64,
        est_disk: i64,
    ) -> TaskDbResult<Dispatched> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.task_store.update_task(
            &task.uuid,
            &TaskUpdate {
                state: Some(SaiState::PassedToBuilder),
                started: Some(now),
                builder: Some(builder.to_string()),
                est_peak_mem_kib: Some(est_mem),
                est_disk_kib: Some(est_disk),
                ..Default::default()
            },
        )?;
        let _ = self.registry.mark_bound(builder, &task.uuid);

        let step = next_step(task).expect("a freshly bound task always has a step 0");
        info!(builder, task_uuid = task.uuid, "bound task to builder");
        Ok(Dispatched {
            builder: builder.to_string(),
            task_uuid: task.uuid.clone(),
            step,
        })
    }

    /// Rejection handling (spec.md §4.D): reset to WAITING without
    /// re-ticking immediately, and remember the uuid so the next tick
    /// doesn't immediately re-offer it to the same builder.
    pub fn on_reject(&self, builder: &str, task_uuid: &str) -> TaskDbResult<()> {
        self.task_store.reset_task(task_uuid)?;
        let _ = self.registry.record_rejection(builder, task_uuid);
        Ok(())
    }

    /// Advances a task to its next step after the current one succeeds,
    /// or to SUCCESS if none remains (spec.md §4.D).
    pub fn advance_step(&self, task_uuid: &str) -> TaskDbResult<Option<crate::dispatch::Step>> {
        let mut next = self.task_store.get_task(task_uuid)?;
        let next_build_step = next.build_step + 1;
        next.build_step = next_build_step;
        match next_step(&next) {
            Some(step) => {
                self.task_store.update_task(
                    task_uuid,
                    &TaskUpdate {
                        build_step: Some(next_build_step),
                        ..Default::default()
                    },
                )?;
                Ok(Some(step))
            }
            None => {
                self.task_store.update_task(
                    task_uuid,
                    &TaskUpdate {
                        state: Some(SaiState::Success),
                        build_step: Some(next_build_step),
                        ..Default::default()
                    },
                )?;
                Ok(None)
            }
        }
    }

    pub fn fail_step(&self, task_uuid: &str) -> TaskDbResult<()> {
        self.task_store.update_task(
            task_uuid,
            &TaskUpdate {
                state: Some(SaiState::Fail),
                ..Default::default()
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sai_lib::ids::gen_event_uuid;
    use sai_taskdb::NewTask;

    fn scheduler(dir: &tempfile::TempDir) -> Scheduler {
        let task_store = Arc::new(TaskStore::open(dir.path().join("sai")).unwrap());
        let registry = Arc::new(BuilderRegistry::new(task_store.global.clone()));
        Scheduler::new(task_store, registry)
    }

    #[test]
    fn tick_binds_oldest_waiting_task_to_matching_builder() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir);
        sched
            .registry
            .connect("b1", 1, vec![Platform::parse("linux/x86_64/gcc")], "ip")
            .unwrap();

        let event_uuid = gen_event_uuid();
        let (_event, tasks) = sched
            .task_store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
                taskname: "t".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "make".into(),
            }])
            .unwrap();

        let dispatched = sched.tick().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].task_uuid, tasks[0].uuid);
        assert_eq!(dispatched[0].step, crate::dispatch::Step::Mirror);

        let t = sched.task_store.get_task(&tasks[0].uuid).unwrap();
        assert_eq!(t.state, SaiState::PassedToBuilder);
        assert_eq!(t.builder, "b1");
    }

    #[test]
    fn rejection_resets_task_and_remembers_uuid_to_skip() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir);
        sched.registry.connect("b1", 1, vec![Platform::parse("linux/x86_64/gcc")], "ip").unwrap();

        let event_uuid = gen_event_uuid();
        let (_event, tasks) = sched
            .task_store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
                taskname: "t".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "make".into(),
            }])
            .unwrap();
        sched.tick().unwrap();

        sched.on_reject("b1", &tasks[0].uuid).unwrap();
        let t = sched.task_store.get_task(&tasks[0].uuid).unwrap();
        assert_eq!(t.state, SaiState::Waiting);
        assert_eq!(sched.registry.last_rejection("b1"), Some(tasks[0].uuid.clone()));
    }

    #[test]
    fn advance_step_walks_user_lines_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir);
        let event_uuid = gen_event_uuid();
        let (_event, tasks) = sched
            .task_store
            .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
                taskname: "t".into(),
                platform: "linux/x86_64/gcc".into(),
                build: "echo hi".into(),
            }])
            .unwrap();
        let uuid = &tasks[0].uuid;

        assert_eq!(sched.advance_step(uuid).unwrap(), Some(crate::dispatch::Step::Checkout));
        assert_eq!(
            sched.advance_step(uuid).unwrap(),
            Some(crate::dispatch::Step::UserLine("echo hi".into()))
        );
        assert_eq!(sched.advance_step(uuid).unwrap(), None);
        let t = sched.task_store.get_task(uuid).unwrap();
        assert_eq!(t.state, SaiState::Success);
    }
}
