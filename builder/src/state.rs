//! Per-instance build state machine (spec.md §4.E):
//!
//! ```text
//! INIT -> MOUNTING -> STARTING_MIRROR -> WAIT_REMOTE_MIRROR -> CHECKEDOUT
//!                                    \-> CHECKOUT_SPEC -/
//! CHECKEDOUT -> EXECUTING_STEPS -> DONE -> UPLOADING_ARTIFACTS -> (destroyed)
//!                                \-> FAILED -/
//! ```
//!
//! The executor doesn't literally walk every named state (mounting and
//! checkout-spec have no Rust-side counterpart once git mirror/checkout
//! are ordinary subprocess steps dispatched like any other), but the
//! state is tracked for logging and for deciding which timeout applies.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Init,
    Mirroring,
    CheckingOut,
    ExecutingSteps,
    Done,
    UploadingArtifacts,
    Failed,
}

impl BuildState {
    pub fn timeout(self) -> std::time::Duration {
        match self {
            BuildState::Mirroring | BuildState::CheckingOut => crate::executor::MIRROR_CHECKOUT_TIMEOUT,
            _ => crate::executor::USER_STEP_TIMEOUT,
        }
    }
}
