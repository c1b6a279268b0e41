//! Wire schema (spec.md §6): one struct per `"schema"` discriminator,
//! plus a `Frame` enum for dispatch on receive over the server↔builder
//! link (subprotocol `com-warmcat-sai`, path `/builder`).

use serde::{Deserialize, Serialize};

/// Builder→server: announces platform instances at connect time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuilderAnnounce {
    pub name: String,
    pub platforms: Vec<String>,
    pub instances: u32,
}

/// Server→builder: assigns one step of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssign {
    pub task_uuid: String,
    pub event_uuid: String,
    pub step: i64,
    pub step_count: i64,
    pub platform: String,
    pub command: String,
    pub art_up_nonce: String,
    pub art_down_nonce: String,
}

/// Server→builder: cancel an in-progress task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCancel {
    pub task_uuid: String,
}

/// Builder→server: one log chunk for one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogChunk {
    pub task_uuid: String,
    pub timestamp: i64,
    pub channel: i64,
    pub finished: i64,
    pub len: i64,
    pub log: String,
}

/// Builder→server: rejects a task assignment or reports a step's
/// terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskReject {
    pub task_uuid: String,
    pub reason: String,
}

/// Builder→server: artifact header sent on the secondary stream ahead
/// of the binary blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactHeader {
    pub task_uuid: String,
    pub blob_filename: String,
    pub artifact_up_nonce: String,
    pub len: i64,
}

/// Either direction: resource lease request/grant/yield.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRequest {
    pub resname: String,
    pub cookie: String,
    pub amount: u32,
    pub lease: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceGrant {
    pub cookie: String,
    pub amount: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceYield {
    pub cookie: String,
}

/// Periodic builder→server load report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadReport {
    pub name: String,
    pub ongoing: u32,
    pub avail_slots: u32,
    pub avail_mem_kib: u64,
    pub avail_sto_kib: u64,
}

/// Server→web: an individual task or event changed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskChange {
    pub task_uuid: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventChange {
    pub event_uuid: String,
    pub state: String,
}

/// Server→web: the current builder roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildersSnapshot {
    pub builders: Vec<String>,
}

/// Server→web: the top-level event/task overview used by the browse UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Overview {
    pub events: Vec<String>,
}

/// Server→web: log lines for one task, requested by the browse UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskLogs {
    pub task_uuid: String,
    pub lines: Vec<String>,
}

/// Web→server: the reset/delete/cancel/rebuild control-plane commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WebAction {
    Reset,
    Delete,
    Cancel,
    Rebuild,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebCommand {
    pub action: WebAction,
    pub task_uuid: String,
}

/// Dispatch enum for everything received on the server↔builder link.
/// `#[serde(tag = "schema")]` makes deserialization pick the variant by
/// the wire's discriminator field without an extra parsing pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "schema")]
pub enum BuilderFrame {
    #[serde(rename = "com-warmcat-sai-ba")]
    Announce(BuilderAnnounce),
    #[serde(rename = "com-warmcat-sai-ta")]
    Assign(TaskAssign),
    #[serde(rename = "com.warmcat.sai.taskcan")]
    Cancel(TaskCancel),
    #[serde(rename = "com-warmcat-sai-logs")]
    Logs(LogChunk),
    #[serde(rename = "com.warmcat.sai.taskrej")]
    Reject(TaskReject),
    #[serde(rename = "com-warmcat-sai-artifact")]
    Artifact(ArtifactHeader),
    #[serde(rename = "com-warmcat-sai-resource-request")]
    ResourceRequest(ResourceRequest),
    #[serde(rename = "com-warmcat-sai-resource-grant")]
    ResourceGrant(ResourceGrant),
    #[serde(rename = "com-warmcat-sai-resource-yield")]
    ResourceYield(ResourceYield),
    #[serde(rename = "com.warmcat.sai.loadreport")]
    LoadReport(LoadReport),
}

/// Dispatch enum for the server↔web link.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "schema")]
pub enum WebFrame {
    #[serde(rename = "sai-taskchange")]
    TaskChange(TaskChange),
    #[serde(rename = "sai-eventchange")]
    EventChange(EventChange),
    #[serde(rename = "com.warmcat.sai.builders")]
    Builders(BuildersSnapshot),
    #[serde(rename = "sai-overview")]
    Overview(Overview),
    #[serde(rename = "sai-tasklogs")]
    TaskLogs(TaskLogs),
    #[serde(rename = "com.warmcat.sai.loadreport")]
    LoadReport(LoadReport),
    #[serde(rename = "com.warmcat.sai.webcmd")]
    Command(WebCommand),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_frame_round_trips_through_schema_tag() {
        let frame = BuilderFrame::Assign(TaskAssign {
            task_uuid: "a".repeat(64),
            event_uuid: "a".repeat(32),
            step: 2,
            step_count: 4,
            platform: "linux/x86_64/gcc".into(),
            command: "make".into(),
            art_up_nonce: "up".into(),
            art_down_nonce: "down".into(),
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["schema"], "com-warmcat-sai-ta");
        let parsed: BuilderFrame = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn web_frame_dispatches_by_schema() {
        let json = serde_json::json!({
            "schema": "sai-taskchange",
            "task_uuid": "a".repeat(64),
            "state": "SUCCESS",
        });
        let parsed: WebFrame = serde_json::from_value(json).unwrap();
        match parsed {
            WebFrame::TaskChange(tc) => assert_eq!(tc.state, "SUCCESS"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn web_command_round_trips() {
        let cmd = WebCommand {
            action: WebAction::Rebuild,
            task_uuid: "b".repeat(64),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["action"], "rebuild");
        let parsed: WebCommand = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, cmd);
    }
}
