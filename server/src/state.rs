//! Shared application state, the same `ProverState`-style shape: one
//! `Arc`-backed struct cloned into every axum handler and into the
//! background tick task.

use crate::links::BuilderLinks;
use crate::web::WebHub;
use sai_lib::config::Config;
use sai_registry::{BuilderRegistry, ResourceLeaseManager};
use sai_scheduler::Scheduler;
use sai_taskdb::{LogBuffer, TaskStore};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub task_store: Arc<TaskStore>,
    pub registry: Arc<BuilderRegistry>,
    pub leases: Arc<ResourceLeaseManager>,
    pub scheduler: Arc<Scheduler>,
    pub log_buffer: Arc<LogBuffer>,
    pub links: BuilderLinks,
    pub web: WebHub,
}
