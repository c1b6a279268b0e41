//! Server→web change notifications (spec.md §4.B/§6): every task
//! mutation that can change an event's rolled-up state publishes a
//! `sai-taskchange`/`sai-eventchange` pair on the web bridge, so the
//! browse UI never needs to poll for state transitions.

use crate::state::AppState;
use sai_framer::schema::{EventChange, TaskChange, WebFrame};
use sai_taskdb::tasks::state_str;
use tracing::warn;

pub fn task_and_event_changed(state: &AppState, task_uuid: &str) {
    let task = match state.task_store.get_task(task_uuid) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, task_uuid, "failed to load task for change notification");
            return;
        }
    };
    state.web.publish(WebFrame::TaskChange(TaskChange {
        task_uuid: task.uuid.clone(),
        state: state_str(task.state).to_string(),
    }));

    match state.task_store.global.get_event(&task.event_uuid) {
        Ok(Some(event)) => {
            state.web.publish(WebFrame::EventChange(EventChange {
                event_uuid: event.uuid.clone(),
                state: state_str(event.state).to_string(),
            }));
        }
        Ok(None) => {}
        Err(e) => warn!(
            error = %e,
            event_uuid = task.event_uuid,
            "failed to load event for change notification"
        ),
    }
}
