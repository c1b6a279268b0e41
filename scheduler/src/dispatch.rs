//! Per-step dispatch (spec.md §4.D): step 0 is the git mirror helper,
//! step 1 is the checkout, and step N≥2 is the (N-2)-th line of the
//! task's build script.

use sai_lib::model::{EventRow, TaskRow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Mirror,
    Checkout,
    UserLine(String),
}

impl Step {
    /// The `command` field sent to the builder in `TaskAssign` (spec.md
    /// §6): the two fixed steps carry a `@sai-mirror`/`@sai-checkout`
    /// sentinel followed by the (repo, ref, hash) the builder's git
    /// helper needs, since the builder has no database access of its
    /// own to look those up.
    pub fn command(&self, event: &EventRow) -> String {
        match self {
            Step::Mirror => format!("@sai-mirror {} {} {}", event.repo_name, event.git_ref, event.hash),
            Step::Checkout => format!("@sai-checkout {} {} {}", event.repo_name, event.git_ref, event.hash),
            Step::UserLine(line) => line.clone(),
        }
    }
}

pub fn next_step(task: &TaskRow) -> Option<Step> {
    match task.build_step {
        0 => Some(Step::Mirror),
        1 => Some(Step::Checkout),
        n => {
            let idx = (n - 2) as usize;
            task.build.lines().nth(idx).map(|l| Step::UserLine(l.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sai_lib::model::SaiState;

    fn task(build_step: i64) -> TaskRow {
        TaskRow {
            uuid: "a".repeat(64),
            event_uuid: "a".repeat(32),
            taskname: "build".into(),
            platform: "linux/x86_64/gcc".into(),
            state: SaiState::BeingBuilt,
            build: "make\nmake test".into(),
            build_step,
            build_step_count: 4,
            builder: "b1".into(),
            started: 0,
            duration: 0,
            est_peak_mem_kib: 0,
            est_disk_kib: 0,
            art_up_nonce: String::new(),
            art_down_nonce: String::new(),
        }
    }

    #[test]
    fn fixed_steps_then_user_lines_then_done() {
        assert_eq!(next_step(&task(0)), Some(Step::Mirror));
        assert_eq!(next_step(&task(1)), Some(Step::Checkout));
        assert_eq!(next_step(&task(2)), Some(Step::UserLine("make".into())));
        assert_eq!(next_step(&task(3)), Some(Step::UserLine("make test".into())));
        assert_eq!(next_step(&task(4)), None);
    }
}
