//! The `/builder` websocket link (spec.md §6, subprotocol
//! `com-warmcat-sai`): dials the server, announces the platforms this
//! builder serves, then dispatches each assigned step to its own task
//! and forwards whatever the step produces back over the link.

use crate::executor::{self, StepContext, StepResult};
use crate::resource_proxy::{self, PendingGrants};
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use sai_framer::schema::{BuilderAnnounce, BuilderFrame, LoadReport, TaskAssign};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

/// Cadence for the periodic `com.warmcat.sai.loadreport` the builder
/// pushes so the scheduler's budget check has live mem/disk figures
/// (spec.md §6).
const LOAD_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Outbound {
    Frame(BuilderFrame),
    Binary(Bytes),
}

impl From<BuilderFrame> for Outbound {
    fn from(frame: BuilderFrame) -> Outbound {
        Outbound::Frame(frame)
    }
}

pub struct LinkConfig {
    pub server_url: String,
    pub builder_name: String,
    pub platforms: Vec<String>,
    pub instances: u32,
    pub home: PathBuf,
}

/// Connects once, announces, and serves until the connection drops.
/// The caller is expected to reconnect with backoff on `Err`.
pub async fn run_connection(config: &LinkConfig) -> anyhow::Result<()> {
    let mut request = config.server_url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "com-warmcat-sai".parse()?);

    let (ws_stream, _resp) = tokio_tungstenite::connect_async(request).await?;
    let (mut sink, mut stream) = ws_stream.split();

    let announce = BuilderFrame::Announce(BuilderAnnounce {
        name: config.builder_name.clone(),
        platforms: config.platforms.clone(),
        instances: config.instances,
    });
    sink.send(Message::Text(serde_json::to_string(&announce)?)).await?;
    info!(builder = config.builder_name, "announced to server");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
    let cancels: Arc<DashMap<String, watch::Sender<bool>>> = Arc::new(DashMap::new());
    let grants = PendingGrants::new();
    let mut load_report_tick = tokio::time::interval(LOAD_REPORT_INTERVAL);

    loop {
        tokio::select! {
            _ = load_report_tick.tick() => {
                let report = build_load_report(config, &cancels).await;
                let _ = out_tx.send(Outbound::Frame(BuilderFrame::LoadReport(report)));
            }
            outbound = out_rx.recv() => {
                let Some(msg) = outbound else { break };
                let wire = match msg {
                    Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                        Ok(text) => Message::Text(text),
                        Err(e) => { warn!(error = %e, "failed to serialize outbound frame"); continue }
                    },
                    Outbound::Binary(bytes) => Message::Binary(bytes.to_vec()),
                };
                if sink.send(wire).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BuilderFrame>(&text) {
                            Ok(frame) => handle_inbound(frame, config, &out_tx, &cancels, &grants),
                            Err(e) => warn!(error = %e, "malformed frame from server"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => { warn!(error = %e, "link read error"); break }
                    _ => {}
                }
            }
        }
    }

    warn!(builder = config.builder_name, "link to server closed");
    Ok(())
}

fn handle_inbound(
    frame: BuilderFrame,
    config: &LinkConfig,
    out_tx: &mpsc::UnboundedSender<Outbound>,
    cancels: &Arc<DashMap<String, watch::Sender<bool>>>,
    grants: &PendingGrants,
) {
    match frame {
        BuilderFrame::Assign(assign) => spawn_step(assign, config, out_tx.clone(), cancels.clone(), grants.clone()),
        BuilderFrame::Cancel(c) => {
            if let Some(tx) = cancels.get(&c.task_uuid) {
                let _ = tx.send(true);
            }
        }
        BuilderFrame::ResourceGrant(grant) => grants.resolve(grant),
        other => warn!(?other, "unexpected frame direction from server"),
    }
}

fn spawn_step(
    assign: TaskAssign,
    config: &LinkConfig,
    out_tx: mpsc::UnboundedSender<Outbound>,
    cancels: Arc<DashMap<String, watch::Sender<bool>>>,
    grants: PendingGrants,
) {
    let home = config.home.clone();
    tokio::spawn(async move {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        cancels.insert(assign.task_uuid.clone(), cancel_tx);

        let build_dir = executor::build_dir_for(&home, &assign.task_uuid, 0);
        let socket_dir = home.join(".sai-resproxy");
        let proxy = resource_proxy::spawn_listener(&socket_dir, &assign.task_uuid, grants.clone(), out_tx.clone());

        let ctx = StepContext {
            task_uuid: assign.task_uuid.clone(),
            step: assign.step,
            home: home.clone(),
            build_dir,
            art_up_nonce: assign.art_up_nonce.clone(),
            instance: 0,
        };

        let result = executor::run_step(&ctx, &assign.command, &out_tx, &mut cancel_rx, &grants).await;
        cancels.remove(&assign.task_uuid);

        if let Ok((_, handle)) = proxy {
            handle.abort();
        }

        match result {
            StepResult::Success => info!(task_uuid = assign.task_uuid, step = assign.step, "step succeeded"),
            StepResult::Failure => warn!(task_uuid = assign.task_uuid, step = assign.step, "step failed"),
            StepResult::TimedOut => warn!(task_uuid = assign.task_uuid, step = assign.step, "step timed out"),
            StepResult::Cancelled => info!(task_uuid = assign.task_uuid, step = assign.step, "step cancelled"),
        }
    });
}

/// Backoff applied between reconnect attempts when the link drops.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

async fn build_load_report(
    config: &LinkConfig,
    cancels: &Arc<DashMap<String, watch::Sender<bool>>>,
) -> LoadReport {
    let ongoing = cancels.len() as u32;
    let avail_slots = config.instances.saturating_sub(ongoing);
    LoadReport {
        name: config.builder_name.clone(),
        ongoing,
        avail_slots,
        avail_mem_kib: avail_mem_kib().await,
        avail_sto_kib: avail_sto_kib(&config.home).await,
    }
}

async fn avail_mem_kib() -> u64 {
    let Ok(meminfo) = tokio::fs::read_to_string("/proc/meminfo").await else {
        return 0;
    };
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// No stdlib cross-platform disk-free API exists, and there's no
/// verified `nix` API surface for it in this workspace's pinned
/// version, so this shells out to `df` the same way the executor shells
/// out to `sh -c` for build steps.
async fn avail_sto_kib(path: &std::path::Path) -> u64 {
    let Ok(output) = tokio::process::Command::new("df").arg("-Pk").arg(path).output().await else {
        return 0;
    };
    let Ok(text) = String::from_utf8(output.stdout) else {
        return 0;
    };
    text.lines()
        .nth(1)
        .and_then(|l| l.split_whitespace().nth(3))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

