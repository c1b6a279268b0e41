//! SQL DDL. Per-event databases hold `tasks`, `logs`, `artifacts`
//! (spec.md §3); the global database holds `events` and `builders`.

pub const PER_EVENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    uuid                TEXT PRIMARY KEY CHECK (length(uuid) = 64),
    event_uuid          TEXT NOT NULL CHECK (length(event_uuid) = 32),
    taskname            TEXT NOT NULL DEFAULT '',
    platform            TEXT NOT NULL,
    state               TEXT NOT NULL,
    build               TEXT NOT NULL,
    build_step          INTEGER NOT NULL DEFAULT 0,
    build_step_count    INTEGER NOT NULL DEFAULT 0,
    builder             TEXT NOT NULL DEFAULT '',
    started             INTEGER NOT NULL DEFAULT 0,
    duration            INTEGER NOT NULL DEFAULT 0,
    est_peak_mem_kib    INTEGER NOT NULL DEFAULT 0,
    est_disk_kib        INTEGER NOT NULL DEFAULT 0,
    art_up_nonce        TEXT NOT NULL,
    art_down_nonce      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_uuid   TEXT NOT NULL CHECK (length(task_uuid) = 64),
    timestamp   INTEGER NOT NULL,
    channel     INTEGER NOT NULL,
    finished    INTEGER NOT NULL DEFAULT 0,
    len         INTEGER NOT NULL,
    log         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_logs_task ON logs(task_uuid);

CREATE TABLE IF NOT EXISTS artifacts (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    task_uuid           TEXT NOT NULL CHECK (length(task_uuid) = 64),
    blob_filename       TEXT NOT NULL,
    artifact_up_nonce   TEXT NOT NULL,
    artifact_down_nonce TEXT NOT NULL,
    timestamp           INTEGER NOT NULL,
    len                 INTEGER NOT NULL,
    blob                BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_task ON artifacts(task_uuid);
CREATE INDEX IF NOT EXISTS idx_artifacts_down_nonce ON artifacts(artifact_down_nonce);
"#;

pub const GLOBAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    uuid            TEXT PRIMARY KEY CHECK (length(uuid) = 32),
    repo_name       TEXT NOT NULL,
    git_ref         TEXT NOT NULL,
    hash            TEXT NOT NULL,
    source_ip       TEXT NOT NULL DEFAULT '',
    created         INTEGER NOT NULL,
    last_updated    INTEGER NOT NULL,
    state           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_repo_ref ON events(repo_name, git_ref);

CREATE TABLE IF NOT EXISTS builders (
    name            TEXT PRIMARY KEY,
    platforms       TEXT NOT NULL,
    ongoing         INTEGER NOT NULL DEFAULT 0,
    instances       INTEGER NOT NULL DEFAULT 0,
    peer_ip         TEXT NOT NULL DEFAULT '',
    online          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS build_metrics (
    key             TEXT NOT NULL,
    unixtime        INTEGER NOT NULL,
    us_cpu_user     INTEGER NOT NULL,
    us_cpu_sys      INTEGER NOT NULL,
    peak_mem_rss    INTEGER NOT NULL,
    stg_bytes       INTEGER NOT NULL,
    parallel        INTEGER NOT NULL,
    step            INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_build_metrics_key ON build_metrics(key, unixtime);
"#;
