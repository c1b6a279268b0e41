//! The data model of spec.md §3: `Event`, `Task`, `Log`, `Artifact`,
//! `BuildMetric`, and the builder registration snapshot. These are plain
//! data carriers; the stores that own their persistence live in
//! `sai-taskdb` and `sai-registry`.

use serde::{Deserialize, Serialize};

pub type EventUuid = String;
pub type TaskUuid = String;

/// State domain shared by events and tasks (spec.md §3). `Deleted` is
/// event-only; tasks never hold it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaiState {
    Waiting,
    PassedToBuilder,
    BeingBuilt,
    Success,
    Fail,
    Cancelled,
    BeingBuiltHasFailures,
    Deleted,
}

impl SaiState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SaiState::Success | SaiState::Fail | SaiState::Cancelled)
    }
}

/// Alias kept for readability at call sites that only ever deal with
/// event rows (events can additionally be `Deleted`, tasks cannot).
pub type EventState = SaiState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub uuid: EventUuid,
    pub repo_name: String,
    pub git_ref: String,
    pub hash: String,
    pub source_ip: String,
    pub created: i64,
    pub last_updated: i64,
    pub state: EventState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub uuid: TaskUuid,
    pub event_uuid: EventUuid,
    pub taskname: String,
    pub platform: String,
    pub state: SaiState,
    pub build: String,
    pub build_step: i64,
    pub build_step_count: i64,
    pub builder: String,
    pub started: i64,
    pub duration: i64,
    pub est_peak_mem_kib: i64,
    pub est_disk_kib: i64,
    pub art_up_nonce: String,
    pub art_down_nonce: String,
}

impl TaskRow {
    /// step 0 = git mirror, step 1 = git checkout, step N>=2 = the
    /// (N-2)-th line of the user script (spec.md §4.D).
    pub fn user_script_lines(&self) -> impl Iterator<Item = &str> {
        self.build.lines()
    }

    pub fn step_count(&self) -> i64 {
        2 + self.build.lines().count() as i64
    }
}

/// Bit encoding of the terminal log's `finished` field (spec.md §3).
pub mod saisprf {
    pub const EXIT: i64 = 0x1000;
    pub const SIGNALLED: i64 = 0x2000;
    pub const TIMEDOUT: i64 = 0x4000;
    pub const TERMINATED: i64 = 0x8000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i64)]
pub enum LogChannel {
    Stdout = 1,
    Stderr = 2,
    Status = 3,
}

impl LogChannel {
    /// Channels 4+ are auxiliary per-instance channels (spec.md §3); this
    /// constructs one, clamped so it never collides with 1-3.
    pub fn auxiliary(n: u32) -> i64 {
        4 + n as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub task_uuid: TaskUuid,
    pub timestamp: i64,
    pub channel: i64,
    pub finished: i64,
    pub len: i64,
    /// base64-encoded opaque bytes, as stored (spec.md §3).
    pub log_b64: String,
}

impl LogRow {
    pub fn decode_final_reason(finished: i64) -> Option<FinalReason> {
        if finished & saisprf::TERMINATED != 0 {
            Some(FinalReason::Terminated)
        } else if finished & saisprf::TIMEDOUT != 0 {
            Some(FinalReason::TimedOut)
        } else if finished & saisprf::SIGNALLED != 0 {
            Some(FinalReason::Signalled(finished & 0xff))
        } else if finished & saisprf::EXIT != 0 {
            Some(FinalReason::Exited(finished & 0xff))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalReason {
    Exited(i64),
    Signalled(i64),
    TimedOut,
    Terminated,
}

impl FinalReason {
    /// Maps a step's terminal log reason to the task-level outcome it
    /// implies (spec.md §7: "the server decodes that into state ∈
    /// {SUCCESS, FAIL, CANCELLED}").
    pub fn to_state(self) -> SaiState {
        match self {
            FinalReason::Exited(0) => SaiState::Success,
            FinalReason::Exited(_) => SaiState::Fail,
            FinalReason::Signalled(_) => SaiState::Fail,
            FinalReason::TimedOut => SaiState::Fail,
            FinalReason::Terminated => SaiState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRow {
    pub task_uuid: TaskUuid,
    pub blob_filename: String,
    pub artifact_up_nonce: String,
    pub artifact_down_nonce: String,
    pub timestamp: i64,
    pub len: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetricRow {
    pub key: String,
    pub unixtime: i64,
    pub us_cpu_user: i64,
    pub us_cpu_sys: i64,
    pub peak_mem_rss: i64,
    pub stg_bytes: i64,
    pub parallel: i64,
    pub step: i64,
}

impl BuildMetricRow {
    /// key = hash(builder, spawn, project, ref) (spec.md §3).
    pub fn key_for(builder: &str, spawn: &str, project: &str, git_ref: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut h = DefaultHasher::new();
        (builder, spawn, project, git_ref).hash(&mut h);
        format!("{:016x}", h.finish())
    }
}

/// Per-step resource usage (spec.md §3 `build_metrics`), carried inside a
/// terminal status log chunk's `log` field as base64 JSON rather than as
/// its own wire frame, since `LogChunk` is otherwise unused on channel 3.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepMetrics {
    pub us_cpu_user: i64,
    pub us_cpu_sys: i64,
    pub peak_mem_rss: i64,
    pub stg_bytes: i64,
    pub parallel: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuilderRegistration {
    pub name: String,
    pub platforms: Vec<String>,
    pub ongoing: u32,
    pub instances: u32,
    pub avail_slots: u32,
    pub avail_mem_kib: u64,
    pub avail_sto_kib: u64,
    pub peer_ip: String,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_counts_fixed_plus_user_lines() {
        let t = TaskRow {
            uuid: "0".repeat(64),
            event_uuid: "0".repeat(32),
            taskname: "build".into(),
            platform: "linux/x86_64/gcc".into(),
            state: SaiState::Waiting,
            build: "echo one\necho two\necho three".into(),
            build_step: 0,
            build_step_count: 0,
            builder: String::new(),
            started: 0,
            duration: 0,
            est_peak_mem_kib: 0,
            est_disk_kib: 0,
            art_up_nonce: String::new(),
            art_down_nonce: String::new(),
        };
        assert_eq!(t.step_count(), 5);
    }

    #[test]
    fn final_reason_decoding() {
        assert_eq!(
            LogRow::decode_final_reason(saisprf::EXIT).unwrap().to_state(),
            SaiState::Success
        );
        assert_eq!(
            LogRow::decode_final_reason(saisprf::EXIT | 1).unwrap().to_state(),
            SaiState::Fail
        );
        assert_eq!(
            LogRow::decode_final_reason(saisprf::SIGNALLED | 9).unwrap().to_state(),
            SaiState::Fail
        );
        assert_eq!(
            LogRow::decode_final_reason(saisprf::TERMINATED).unwrap().to_state(),
            SaiState::Cancelled
        );
        assert!(LogRow::decode_final_reason(0).is_none());
    }
}
