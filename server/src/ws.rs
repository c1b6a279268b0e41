//! The `/builder` WebSocket link (spec.md §6, subprotocol
//! `com-warmcat-sai`): one connection per builder daemon, carrying every
//! `BuilderFrame` variant in both directions.

use crate::notify;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use sai_framer::schema::{
    BuilderFrame, LoadReport, ResourceGrant, ResourceRequest, TaskReject,
};
use sai_lib::model::{BuildMetricRow, LogRow, SaiState, StepMetrics};
use sai_lib::platform::Platform;
use sai_registry::LeaseOutcome;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub async fn builder_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.protocols(["com-warmcat-sai"])
        .on_upgrade(move |socket| handle_builder_socket(socket, state, peer.ip().to_string()))
}

/// First frame on a fresh connection must be `BuilderAnnounce`; anything
/// else is a protocol violation and the connection is dropped.
async fn handle_builder_socket(socket: WebSocket, state: AppState, peer_ip: String) {
    let (mut sink, mut stream) = socket.split();

    let announce = match stream.next().await {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<BuilderFrame>(&text) {
            Ok(BuilderFrame::Announce(a)) => a,
            Ok(_) => {
                warn!("expected announce as first frame on /builder link");
                return;
            }
            Err(e) => {
                warn!(error = %e, "malformed first frame on /builder link");
                return;
            }
        },
        _ => return,
    };

    let platforms: Vec<Platform> = announce.platforms.iter().map(|p| Platform::parse(p)).collect();
    if state
        .registry
        .connect(&announce.name, announce.instances, platforms, &peer_ip)
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<BuilderFrame>();
    state.links.register(&announce.name, tx);
    info!(builder = announce.name, instances = announce.instances, "builder link established");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(frame) = outbound else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BuilderFrame>(&text) {
                            Ok(frame) => handle_inbound_frame(&state, &announce.name, frame).await,
                            Err(e) => warn!(builder = announce.name, error = %e, "malformed frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.links.remove(&announce.name);
    let _ = state.registry.disconnect(&announce.name);
    info!(builder = announce.name, "builder link closed");
}

async fn handle_inbound_frame(state: &AppState, builder: &str, frame: BuilderFrame) {
    match frame {
        BuilderFrame::Logs(chunk) => {
            let Some(event_uuid) = sai_lib::ids::task_uuid_to_event_uuid(&chunk.task_uuid) else {
                return;
            };
            let event_uuid = event_uuid.to_string();
            let task_uuid = chunk.task_uuid.clone();
            let terminal = chunk.channel == 3 && chunk.finished != 0;
            let finished = chunk.finished;
            let metrics_payload = chunk.log.clone();

            state.log_buffer.push(
                &event_uuid,
                LogRow {
                    task_uuid: chunk.task_uuid,
                    timestamp: chunk.timestamp,
                    channel: chunk.channel,
                    finished: chunk.finished,
                    len: chunk.len,
                    log_b64: chunk.log,
                },
            );

            // First log/status update for a bound task (spec.md §4.C):
            // marks it past the no-start grace so the stale-inflight
            // sweep doesn't yank it back to WAITING mid-build.
            let _ = state.registry.mark_started(builder, &task_uuid);

            if terminal {
                handle_step_terminal(state, builder, &task_uuid, finished, &metrics_payload).await;
            }
        }
        BuilderFrame::Reject(TaskReject { task_uuid, reason }) => {
            warn!(builder, task_uuid, reason, "builder rejected task");
            if let Err(e) = state.scheduler.on_reject(builder, &task_uuid) {
                warn!(error = %e, "failed to reset rejected task after rejection");
            }
            notify::task_and_event_changed(state, &task_uuid);
        }
        BuilderFrame::ResourceRequest(ResourceRequest { resname, cookie, amount, lease }) => {
            match state.leases.request(&resname, &cookie, amount, lease) {
                Ok(LeaseOutcome::Granted) => {
                    state
                        .links
                        .send(builder, BuilderFrame::ResourceGrant(ResourceGrant { cookie, amount }));
                }
                Ok(LeaseOutcome::Queued) => {}
                Err(e) => warn!(error = %e, resname, "resource request failed"),
            }
        }
        BuilderFrame::ResourceYield(y) => {
            state.leases.yield_by_cookie(&y.cookie);
        }
        BuilderFrame::LoadReport(LoadReport { name, ongoing, avail_slots, avail_mem_kib, avail_sto_kib }) => {
            let _ = state
                .registry
                .apply_load_report(&name, ongoing, avail_slots, avail_mem_kib, avail_sto_kib);
        }
        BuilderFrame::Artifact(_) => {
            // Header-only notice; the blob itself arrives on the
            // secondary artifact stream (spec.md §4.E), not this link.
        }
        BuilderFrame::Announce(_)
        | BuilderFrame::Assign(_)
        | BuilderFrame::Cancel(_)
        | BuilderFrame::ResourceGrant(_) => {
            warn!(builder, "unexpected frame direction on /builder link");
        }
    }
}

/// Drives the per-step state machine off a terminal status chunk
/// (spec.md §7): decodes `finished` into a `FinalReason`, records this
/// step's resource usage, and either advances to the next step and
/// re-dispatches it, or frees the builder's inflight slot once the task
/// has nothing left to run.
async fn handle_step_terminal(
    state: &AppState,
    builder: &str,
    task_uuid: &str,
    finished: i64,
    metrics_b64: &str,
) {
    let Some(reason) = LogRow::decode_final_reason(finished) else {
        return;
    };

    record_step_metrics(state, builder, task_uuid, metrics_b64);

    match reason.to_state() {
        SaiState::Success => match state.scheduler.advance_step(task_uuid) {
            Ok(Some(step)) => crate::dispatch_to_link(state, builder, task_uuid, &step),
            Ok(None) => {
                let _ = state.registry.mark_finished(builder, task_uuid);
            }
            Err(e) => warn!(error = %e, task_uuid, "failed to advance step"),
        },
        SaiState::Fail => {
            if let Err(e) = state.scheduler.fail_step(task_uuid) {
                warn!(error = %e, task_uuid, "failed to mark step failed");
            }
            let _ = state.registry.mark_finished(builder, task_uuid);
        }
        SaiState::Cancelled => {
            let _ = state.registry.mark_finished(builder, task_uuid);
        }
        _ => {}
    }

    notify::task_and_event_changed(state, task_uuid);
}

/// Decodes the base64-JSON `StepMetrics` a terminal status chunk carries
/// in its `log` field and writes a `build_metrics` row for it (spec.md
/// §3). Silently drops the sample if the task/event has since vanished
/// or the payload doesn't decode — a missing metrics point doesn't
/// warrant failing the step.
fn record_step_metrics(state: &AppState, builder: &str, task_uuid: &str, metrics_b64: &str) {
    use base64::Engine;
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(metrics_b64) else {
        return;
    };
    let Ok(metrics) = serde_json::from_slice::<StepMetrics>(&bytes) else {
        return;
    };
    let Ok(task) = state.task_store.get_task(task_uuid) else {
        return;
    };
    let Ok(Some(event)) = state.task_store.global.get_event(&task.event_uuid) else {
        return;
    };
    let row = BuildMetricRow {
        key: BuildMetricRow::key_for(builder, "0", &event.repo_name, &event.git_ref),
        unixtime: now_unix(),
        us_cpu_user: metrics.us_cpu_user,
        us_cpu_sys: metrics.us_cpu_sys,
        peak_mem_rss: metrics.peak_mem_rss,
        stg_bytes: metrics.stg_bytes,
        parallel: metrics.parallel,
        step: task.build_step,
    };
    if let Err(e) = state.task_store.global.record_metric(&row) {
        warn!(error = %e, task_uuid, "failed to record build metric");
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
