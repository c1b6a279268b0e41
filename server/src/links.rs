//! Live outbound channels to connected builders, keyed by builder name.
//! The scheduler's tick task runs on its own task and has no direct
//! handle to any particular builder's websocket; it posts frames here
//! and the owning `ws::handle_builder_socket` task forwards them.

use dashmap::DashMap;
use sai_framer::schema::BuilderFrame;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone, Default)]
pub struct BuilderLinks {
    senders: std::sync::Arc<DashMap<String, UnboundedSender<BuilderFrame>>>,
}

impl BuilderLinks {
    pub fn new() -> BuilderLinks {
        BuilderLinks::default()
    }

    pub fn register(&self, name: &str, tx: UnboundedSender<BuilderFrame>) {
        self.senders.insert(name.to_string(), tx);
    }

    pub fn remove(&self, name: &str) {
        self.senders.remove(name);
    }

    /// Best-effort send; `false` means the builder is no longer
    /// connected (its receiver was dropped or it was never registered).
    pub fn send(&self, name: &str, frame: BuilderFrame) -> bool {
        self.senders
            .get(name)
            .map(|tx| tx.send(frame).is_ok())
            .unwrap_or(false)
    }
}
