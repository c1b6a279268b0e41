//! The `/web` WebSocket bridge (spec.md §4.B/§6): browse-UI clients
//! subscribe to `sai-taskchange`/`sai-eventchange`/`sai-overview`
//! notifications and issue reset/cancel/rebuild/delete control
//! commands. Kept entirely at this layer since `sai-taskdb` has no
//! dependency on websockets or `sai-framer`.

use crate::notify;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use sai_framer::buflist::BACKPRESSURE_CEILING;
use sai_framer::schema::{BuilderFrame, Overview, TaskCancel, WebAction, WebCommand, WebFrame};
use tokio::sync::broadcast;
use tracing::warn;

/// Fan-out hub for server→web notifications. One broadcast channel
/// shared by every connected browse-UI client; a slow subscriber drops
/// frames (`Lagged`) rather than stalling the publishers.
#[derive(Clone)]
pub struct WebHub {
    tx: broadcast::Sender<WebFrame>,
}

impl WebHub {
    pub fn new() -> WebHub {
        let (tx, _rx) = broadcast::channel(1024);
        WebHub { tx }
    }

    pub fn publish(&self, frame: WebFrame) {
        let _ = self.tx.send(frame);
    }

    fn subscribe(&self) -> broadcast::Receiver<WebFrame> {
        self.tx.subscribe()
    }
}

impl Default for WebHub {
    fn default() -> WebHub {
        WebHub::new()
    }
}

pub async fn web_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_web_socket(socket, state))
}

async fn handle_web_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let mut rx = state.web.subscribe();

    loop {
        tokio::select! {
            broadcast = rx.recv() => {
                let frame = match broadcast {
                    Ok(f) => f,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if text.len() > BACKPRESSURE_CEILING {
                    warn!(len = text.len(), "dropping oversized web frame over backpressure ceiling");
                    continue;
                }
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WebFrame>(&text) {
                            Ok(WebFrame::Command(cmd)) => handle_web_command(&state, cmd),
                            Ok(_) => warn!("unexpected frame direction on /web link"),
                            Err(e) => warn!(error = %e, "malformed frame on /web link"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Dispatches a reset/cancel/rebuild/delete control command (spec.md
/// §6). `Delete`'s `task_uuid` field carries the owning *event*'s uuid
/// directly: deletion always targets a whole event and the wire schema
/// has no separate event-targeted command shape.
fn handle_web_command(state: &AppState, cmd: WebCommand) {
    match cmd.action {
        WebAction::Reset => {
            if let Err(e) = state.task_store.reset_task(&cmd.task_uuid) {
                warn!(error = %e, task_uuid = cmd.task_uuid, "web reset command failed");
                return;
            }
            notify::task_and_event_changed(state, &cmd.task_uuid);
        }
        WebAction::Cancel => match state.task_store.cancel_task(&cmd.task_uuid) {
            Ok(builder) => {
                if !builder.is_empty() {
                    state.links.send(
                        &builder,
                        BuilderFrame::Cancel(TaskCancel { task_uuid: cmd.task_uuid.clone() }),
                    );
                }
                notify::task_and_event_changed(state, &cmd.task_uuid);
            }
            Err(e) => warn!(error = %e, task_uuid = cmd.task_uuid, "web cancel command failed"),
        },
        WebAction::Rebuild => match state.task_store.rebuild_task(&cmd.task_uuid) {
            Ok(row) => notify::task_and_event_changed(state, &row.uuid),
            Err(e) => warn!(error = %e, task_uuid = cmd.task_uuid, "web rebuild command failed"),
        },
        WebAction::Delete => {
            let event_uuid = cmd.task_uuid.clone();
            if let Err(e) = state.task_store.delete_event(&event_uuid) {
                warn!(error = %e, event_uuid, "web delete command failed");
                return;
            }
            let events = state
                .task_store
                .global
                .incomplete_events_newest_first()
                .map(|rows| rows.into_iter().map(|e| e.uuid).collect())
                .unwrap_or_default();
            state.web.publish(WebFrame::Overview(Overview { events }));
        }
    }
}
