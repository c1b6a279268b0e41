//! Build-step executor (spec.md §4.E): runs one assigned step to
//! completion, capturing stdout/stderr into log channels 1/2 and
//! opening per-instance auxiliary UDS channels 4/5. Grounded in the
//! original builder's `b-task.c` step reaper, translated from its
//! libwebsockets sul timers to `tokio::select!` against the child's
//! `wait()` future.

use crate::artifacts::{self, ARTIFACTS_SENTINEL};
use crate::link::Outbound;
use crate::mirror::{GitStep, CHECKOUT_SENTINEL, MIRROR_SENTINEL};
use crate::resource_proxy::PendingGrants;
use crate::state::BuildState;
use sai_framer::schema::{BuilderFrame, LogChunk};
use sai_lib::model::{saisprf, StepMetrics};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Clock ticks per second assumed for `/proc/<pid>/stat`'s utime/stime
/// fields. `sysconf(_SC_CLK_TCK)` is 100 on effectively every Linux
/// target this builder runs on.
const CPU_TICK_US: i64 = 10_000;

pub const MIRROR_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(300);
pub const USER_STEP_TIMEOUT: Duration = Duration::from_secs(1800);

/// What a step reports back up the chain once it settles; the caller
/// (the link's per-task driver) turns this into the next action —
/// request the next step, or stop because the task is done or failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Success,
    Failure,
    TimedOut,
    Cancelled,
}

impl StepResult {
    fn finished_bits(self, exit_code: i64) -> i64 {
        match self {
            StepResult::Success | StepResult::Failure => saisprf::EXIT | (exit_code & 0xff),
            StepResult::TimedOut => saisprf::TIMEDOUT,
            StepResult::Cancelled => saisprf::TERMINATED,
        }
    }
}

/// Running peak/total resource usage sampled from `/proc` while a step's
/// subprocess executes.
#[derive(Debug, Clone, Copy, Default)]
struct ResourceSample {
    peak_mem_rss: i64,
    us_cpu_user: i64,
    us_cpu_sys: i64,
}

/// Polls `/proc/<pid>/status` and `/proc/<pid>/stat` every 200ms and
/// keeps the running peak RSS / latest cpu times until `stop` fires.
async fn sample_child_resources(pid: u32, mut stop: watch::Receiver<bool>) -> ResourceSample {
    let mut sample = ResourceSample::default();
    loop {
        if let Ok(status) = tokio::fs::read_to_string(format!("/proc/{pid}/status")).await {
            if let Some(kib) = parse_vm_hwm_kib(&status) {
                sample.peak_mem_rss = sample.peak_mem_rss.max(kib * 1024);
            }
        }
        if let Ok(stat) = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await {
            if let Some((utime, stime)) = parse_proc_stat_times(&stat) {
                sample.us_cpu_user = utime * CPU_TICK_US;
                sample.us_cpu_sys = stime * CPU_TICK_US;
            }
        }
        if *stop.borrow() {
            return sample;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            _ = stop.changed() => {
                if *stop.borrow() {
                    return sample;
                }
            }
        }
    }
}

fn parse_vm_hwm_kib(status: &str) -> Option<i64> {
    status
        .lines()
        .find(|l| l.starts_with("VmHWM:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|n| n.parse().ok())
}

/// `comm` (field 2) is parenthesised and may itself contain spaces or
/// parens, so the stable fields start after the *last* `)` rather than
/// at a fixed offset. Returns (utime, stime) in clock ticks.
fn parse_proc_stat_times(stat: &str) -> Option<(i64, i64)> {
    let after = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is state (originally field 3); utime/stime are fields 14/15,
    // i.e. index 11/12 relative to field 3.
    let utime = fields.get(11)?.parse().ok()?;
    let stime = fields.get(12)?.parse().ok()?;
    Some((utime, stime))
}

fn dir_size_bytes(dir: &Path) -> i64 {
    let mut total = 0i64;
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size_bytes(&entry.path());
        } else {
            total += meta.len() as i64;
        }
    }
    total
}

pub struct StepContext {
    pub task_uuid: String,
    pub step: i64,
    pub home: PathBuf,
    pub build_dir: PathBuf,
    pub art_up_nonce: String,
    pub instance: u32,
}

/// Runs one step's command to completion. `cancel` fires when a
/// `TaskCancel` frame arrives for this task; `grants` lets an
/// `@sai-artifacts` pseudo-step's staged uploads flow out over the
/// link without the executor needing its own websocket handle.
pub async fn run_step(
    ctx: &StepContext,
    command: &str,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    cancel: &mut watch::Receiver<bool>,
    _grants: &PendingGrants,
) -> StepResult {
    if let Some(result) = run_artifacts_pseudo_step(ctx, command, out_tx).await {
        return result;
    }

    let (shell_line, state) = if let Some(git) = GitStep::parse(command) {
        if command.starts_with(MIRROR_SENTINEL) {
            (git.mirror_command(&ctx.home), BuildState::Mirroring)
        } else {
            debug_assert!(command.starts_with(CHECKOUT_SENTINEL));
            (git.checkout_command(&ctx.home, &ctx.build_dir), BuildState::CheckingOut)
        }
    } else {
        (command.to_string(), BuildState::ExecutingSteps)
    };

    run_subprocess(ctx, &shell_line, state.timeout(), out_tx, cancel).await
}

async fn run_artifacts_pseudo_step(
    ctx: &StepContext,
    command: &str,
    out_tx: &mpsc::UnboundedSender<Outbound>,
) -> Option<StepResult> {
    let patterns = command.strip_prefix(ARTIFACTS_SENTINEL)?.trim();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let staged = match artifacts::stage_artifacts(
        &ctx.task_uuid,
        &ctx.art_up_nonce,
        &ctx.build_dir,
        &ctx.home,
        patterns,
        now,
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, task_uuid = ctx.task_uuid, "artifact staging failed");
            return Some(StepResult::Failure);
        }
    };

    for artifact in &staged {
        let _ = out_tx.send(Outbound::Frame(BuilderFrame::Artifact(artifact.header.clone())));
        match artifacts::queue_upload(artifact, 64 * 1024) {
            Ok(mut buf) => {
                while let Some((chunk, _flags)) = buf.drain_for_write(64 * 1024) {
                    let _ = out_tx.send(Outbound::Binary(chunk));
                }
            }
            Err(e) => warn!(error = %e, "failed to read staged artifact for upload"),
        }
    }
    Some(StepResult::Success)
}

async fn run_subprocess(
    ctx: &StepContext,
    shell_line: &str,
    timeout: Duration,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    cancel: &mut watch::Receiver<bool>,
) -> StepResult {
    std::fs::create_dir_all(&ctx.build_dir).ok();

    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(shell_line)
        .current_dir(&ctx.build_dir)
        .env("SAI_BUILDER_RESOURCE_PROXY", resource_proxy_path(ctx))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, task_uuid = ctx.task_uuid, "failed to spawn step");
            return StepResult::Failure;
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    tokio::spawn(stream_log(ctx.task_uuid.clone(), 1, stdout, out_tx.clone()));
    tokio::spawn(stream_log(ctx.task_uuid.clone(), 2, stderr, out_tx.clone()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let sampler = child
        .id()
        .map(|pid| tokio::spawn(sample_child_resources(pid, stop_rx)));

    let mut exit_code: i64 = 1;
    let mut signal: Option<i64> = None;
    let result = tokio::select! {
        status = child.wait() => {
            match status {
                Ok(s) => {
                    match s.code() {
                        Some(code) => {
                            exit_code = code as i64;
                            if s.success() { StepResult::Success } else { StepResult::Failure }
                        }
                        None => {
                            signal = s.signal().map(i64::from);
                            StepResult::Failure
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, task_uuid = ctx.task_uuid, "step wait() failed");
                    StepResult::Failure
                }
            }
        }
        _ = tokio::time::sleep(timeout) => {
            warn!(task_uuid = ctx.task_uuid, ?timeout, "step timed out, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            StepResult::TimedOut
        }
        _ = wait_for_cancel(cancel) => {
            info!(task_uuid = ctx.task_uuid, "step cancelled, escalating to SIGTERM");
            escalate_sigterm(&child).await;
            let _ = child.wait().await;
            StepResult::Cancelled
        }
    };

    let _ = stop_tx.send(true);
    let sample = match sampler {
        Some(handle) => handle.await.unwrap_or_default(),
        None => ResourceSample::default(),
    };
    let build_dir = ctx.build_dir.clone();
    let stg_bytes = tokio::task::spawn_blocking(move || dir_size_bytes(&build_dir))
        .await
        .unwrap_or(0);

    let finished = match signal {
        Some(sig) => saisprf::SIGNALLED | (sig & 0xff),
        None => result.finished_bits(exit_code),
    };

    let metrics = StepMetrics {
        us_cpu_user: sample.us_cpu_user,
        us_cpu_sys: sample.us_cpu_sys,
        peak_mem_rss: sample.peak_mem_rss,
        stg_bytes,
        parallel: 1,
    };
    let metrics_b64 = encode_metrics(&metrics);

    let _ = out_tx.send(Outbound::Frame(BuilderFrame::Logs(LogChunk {
        task_uuid: ctx.task_uuid.clone(),
        timestamp: now_unix(),
        channel: 3,
        finished,
        len: metrics_b64.len() as i64,
        log: metrics_b64,
    })));

    result
}

fn encode_metrics(metrics: &StepMetrics) -> String {
    use base64::Engine;
    let json = serde_json::to_vec(metrics).unwrap_or_default();
    base64::engine::general_purpose::STANDARD.encode(json)
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped without ever cancelling; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

/// Cancellation (spec.md §4.E): successive SIGTERMs at 500 ms intervals,
/// up to 5 attempts.
async fn escalate_sigterm(child: &tokio::process::Child) {
    let Some(pid) = child.id() else { return };
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    for attempt in 1..=5 {
        if nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        if attempt == 5 {
            let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL);
        }
    }
}

async fn stream_log(
    task_uuid: String,
    channel: i64,
    reader: impl tokio::io::AsyncRead + Unpin,
    out_tx: mpsc::UnboundedSender<Outbound>,
) {
    use base64::Engine;
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let log_b64 = base64::engine::general_purpose::STANDARD.encode(line.as_bytes());
        let len = log_b64.len() as i64;
        let _ = out_tx.send(Outbound::Frame(BuilderFrame::Logs(LogChunk {
            task_uuid: task_uuid.clone(),
            timestamp: now_unix(),
            channel,
            finished: 0,
            len,
            log: log_b64,
        })));
    }
}

fn resource_proxy_path(ctx: &StepContext) -> PathBuf {
    ctx.home.join(".sai-resproxy").join(format!("{}.sock", ctx.task_uuid))
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn build_dir_for(home: &Path, task_uuid: &str, instance: u32) -> PathBuf {
    home.join("builds").join(format!("{task_uuid}-{instance}"))
}
