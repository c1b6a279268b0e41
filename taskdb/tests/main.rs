use sai_lib::ids::gen_event_uuid;
use sai_lib::model::{EventState, SaiState};
use sai_lib::platform::Platform;
use sai_taskdb::{NewTask, TaskStore, TaskUpdate};

fn store(dir: &tempfile::TempDir) -> TaskStore {
    TaskStore::open(dir.path().join("sai")).unwrap()
}

#[test]
fn two_task_event_goes_being_built_then_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let event_uuid = gen_event_uuid();
    let (event, tasks) = store
        .ingest_event(
            &event_uuid,
            "acme/widget",
            "refs/heads/main",
            "cafebabe",
            "10.0.0.1",
            &[
                NewTask {
                    taskname: "build-linux".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "make\nmake test".into(),
                },
                NewTask {
                    taskname: "build-mac".into(),
                    platform: "macos/arm64/clang".into(),
                    build: "make".into(),
                },
            ],
        )
        .unwrap();
    assert_eq!(event.state, EventState::Waiting);
    assert_eq!(tasks.len(), 2);

    let state = store
        .update_task(
            &tasks[0].uuid,
            &TaskUpdate {
                state: Some(SaiState::Success),
                duration: Some(42),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(state, EventState::BeingBuilt);

    let state = store
        .update_task(
            &tasks[1].uuid,
            &TaskUpdate {
                state: Some(SaiState::Success),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(state, EventState::Success);

    let got = store.global.get_event(&event_uuid).unwrap().unwrap();
    assert_eq!(got.state, EventState::Success);
}

#[test]
fn one_failure_marks_event_has_failures_then_stays_after_second_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let event_uuid = gen_event_uuid();
    let (_event, tasks) = store
        .ingest_event(
            &event_uuid,
            "acme/widget",
            "refs/heads/main",
            "deadbeef",
            "10.0.0.2",
            &[
                NewTask {
                    taskname: "a".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "true".into(),
                },
                NewTask {
                    taskname: "b".into(),
                    platform: "linux/x86_64/gcc".into(),
                    build: "false".into(),
                },
            ],
        )
        .unwrap();

    let state = store
        .update_task(
            &tasks[1].uuid,
            &TaskUpdate {
                state: Some(SaiState::Fail),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(state, EventState::BeingBuiltHasFailures);

    let state = store
        .update_task(
            &tasks[0].uuid,
            &TaskUpdate {
                state: Some(SaiState::Success),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(state, EventState::BeingBuiltHasFailures);
}

#[test]
fn reset_task_clears_logs_and_artifacts_and_rewaits() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let event_uuid = gen_event_uuid();
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
                state: Some(SaiState::Fail),
                builder: Some("b1".into()),
                ..Default::default()
            },
        )
        .unwrap();

    store.reset_task(&tasks[0].uuid).unwrap();
    let t = store.get_task(&tasks[0].uuid).unwrap();
    assert_eq!(t.state, SaiState::Waiting);
    assert_eq!(t.builder, "");

    let got = store.global.get_event(&event_uuid).unwrap().unwrap();
    assert_eq!(got.state, EventState::Waiting);
}

#[test]
fn pending_for_prefers_platform_match_across_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let e1 = gen_event_uuid();
    store
        .ingest_event(&e1, "r", "ref", "h", "ip", &[NewTask {
            taskname: "t".into(),
            platform: "macos/arm64/clang".into(),
            build: "true".into(),
        }])
        .unwrap();
    let e2 = gen_event_uuid();
    let (_event2, tasks2) = store
        .ingest_event(&e2, "r", "ref", "h", "ip", &[NewTask {
            taskname: "t".into(),
            platform: "linux/x86_64/gcc".into(),
            build: "true".into(),
        }])
        .unwrap();

    let picked = store
        .pending_for(&Platform::parse("linux/x86_64/gcc"), None)
        .unwrap()
        .unwrap();
    assert_eq!(picked.uuid, tasks2[0].uuid);
}

#[test]
fn rebuild_creates_fresh_waiting_task_with_new_uuid() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let event_uuid = gen_event_uuid();
    let (_event, tasks) = store
        .ingest_event(&event_uuid, "r", "ref", "h", "ip", &[NewTask {
            taskname: "t".into(),
            platform: "linux/x86_64/gcc".into(),
            build: "make".into(),
        }])
        .unwrap();
    store
        .update_task(
            &tasks[0].uuid,
            &TaskUpdate {
                state: Some(SaiState::Fail),
                ..Default::default()
            },
        )
        .unwrap();

    let rebuilt = store.rebuild_task(&tasks[0].uuid).unwrap();
    assert_ne!(rebuilt.uuid, tasks[0].uuid);
    assert_eq!(rebuilt.state, SaiState::Waiting);
    assert_eq!(rebuilt.build, "make");
}

#[test]
fn cancel_unbinds_and_returns_builder_name() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    let event_uuid = gen_event_uuid();
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
                builder: Some("builder-7".into()),
                ..Default::default()
            },
        )
        .unwrap();

    let builder = store.cancel_task(&tasks[0].uuid).unwrap();
    assert_eq!(builder, "builder-7");
    let t = store.get_task(&tasks[0].uuid).unwrap();
    assert_eq!(t.state, SaiState::Cancelled);
}
