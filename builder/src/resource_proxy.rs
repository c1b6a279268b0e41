//! Per-task resource proxy (spec.md §4.E, grounded in `b-refproxy.c`):
//! a Unix-domain listener exported to the task's subprocess via
//! `SAI_BUILDER_RESOURCE_PROXY`. Clients speak one JSON object per
//! connection — `{resname, cookie, amount, lease}` — which is forwarded
//! verbatim to the server over the main link; the matching reply is
//! relayed back over the same UDS connection. If the client disconnects
//! while still holding an acquired lease, the proxy emits a yield frame
//! so the server doesn't wait out the full lease period.

use crate::link::Outbound;
use sai_framer::schema::{BuilderFrame, ResourceGrant, ResourceRequest, ResourceYield};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Registry of cookies with a reply channel awaiting a grant, shared
/// between every resource-proxy listener task and the main link's
/// inbound-frame dispatcher.
#[derive(Clone, Default)]
pub struct PendingGrants {
    inner: std::sync::Arc<dashmap::DashMap<String, oneshot::Sender<ResourceGrant>>>,
}

impl PendingGrants {
    pub fn new() -> PendingGrants {
        PendingGrants::default()
    }

    pub fn register(&self, cookie: String, reply: oneshot::Sender<ResourceGrant>) {
        self.inner.insert(cookie, reply);
    }

    /// Called from the main link loop when a `ResourceGrant` frame
    /// arrives; delivers it to the waiting proxy task, if any.
    pub fn resolve(&self, grant: ResourceGrant) {
        if let Some((_, reply)) = self.inner.remove(&grant.cookie) {
            let _ = reply.send(grant);
        }
    }

    fn forget(&self, cookie: &str) {
        self.inner.remove(cookie);
    }
}

/// Spawns the UDS listener for one task, returning the socket path to
/// export as `SAI_BUILDER_RESOURCE_PROXY` and a handle that stops the
/// listener (and cleans up the socket file) when dropped.
pub fn spawn_listener(
    socket_dir: &Path,
    task_uuid: &str,
    grants: PendingGrants,
    out_tx: mpsc::UnboundedSender<Outbound>,
) -> std::io::Result<(PathBuf, tokio::task::JoinHandle<()>)> {
    std::fs::create_dir_all(socket_dir)?;
    let path = socket_dir.join(format!("{task_uuid}.sock"));
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    let path_for_task = path.clone();

    let handle = tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "resource proxy accept failed");
                    break;
                }
            };
            tokio::spawn(serve_client(stream, grants.clone(), out_tx.clone()));
        }
        let _ = std::fs::remove_file(&path_for_task);
    });

    Ok((path, handle))
}

async fn serve_client(mut stream: UnixStream, grants: PendingGrants, out_tx: mpsc::UnboundedSender<Outbound>) {
    let mut buf = Vec::new();
    if stream.read_to_end(&mut buf).await.is_err() {
        return;
    }
    let req: ResourceRequest = match serde_json::from_slice(&buf) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "malformed resource proxy request");
            return;
        }
    };

    let (tx, rx) = oneshot::channel();
    grants.register(req.cookie.clone(), tx);
    if out_tx.send(Outbound::Frame(BuilderFrame::ResourceRequest(req.clone()))).is_err() {
        grants.forget(&req.cookie);
        return;
    }

    match rx.await {
        Ok(grant) => {
            let reply = serde_json::to_vec(&serde_json::json!({
                "schema": "com-warmcat-sai-resource-grant",
                "cookie": grant.cookie,
                "amount": grant.amount,
            }))
            .unwrap();
            if stream.write_all(&reply).await.is_err() {
                // Client hung up before we could deliver the grant;
                // yield it rather than hold it until the lease expires.
                let _ = out_tx.send(Outbound::Frame(BuilderFrame::ResourceYield(ResourceYield { cookie: req.cookie })));
            }
        }
        Err(_) => debug!(cookie = req.cookie, "resource proxy client gone before grant arrived"),
    }
}
