//! The Sai server daemon (spec.md §1/§6): ingests events, schedules
//! tasks onto connected builders, and serves the artifact/websocket
//! surface. Process shape follows a `host::server::serve` + `bin/main.rs`
//! split: config/logging setup, then a long-running run loop.

mod links;
mod logging;
mod notify;
mod routes;
mod state;
mod web;
mod ws;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use sai_framer::schema::{BuilderFrame, TaskAssign};
use sai_lib::config::{CommonCli, Config};
use sai_registry::{BuilderRegistry, ResourceLeaseManager};
use sai_scheduler::Scheduler;
use sai_taskdb::{logs, LogBuffer, TaskStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = CommonCli::parse();
    let config = Config::load(&cli.config_dir).context("loading config file")?;
    let _log_guard = logging::subscribe_log(&cli.log_mask, None);

    info!(database = %config.database, host = %config.host, "starting sai-server");

    let task_store = Arc::new(TaskStore::open(&config.database)?);
    let registry = Arc::new(BuilderRegistry::new(task_store.global.clone()));
    let leases = Arc::new(ResourceLeaseManager::new(config.resources()?));
    let scheduler = Arc::new(Scheduler::new(task_store.clone(), registry.clone()));

    let state = AppState {
        config: Arc::new(config.clone()),
        task_store,
        registry,
        leases,
        scheduler,
        log_buffer: Arc::new(LogBuffer::new()),
        links: links::BuilderLinks::new(),
        web: web::WebHub::new(),
    };

    tokio::spawn(run_tick_loop(state.clone()));

    let app = Router::new()
        .merge(routes::create_router())
        .route("/builder", get(ws::builder_ws))
        .route("/web", get(web::web_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid host address {:?}", config.host))?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("server stopped serving")?;
    Ok(())
}

/// Drives the scheduler and its supporting sweeps at spec.md's 1 Hz
/// cadence (§4.D tick, §4.A idle sweep, §4.B log coalescing, §4.G lease
/// expiry), all on one task so none of them need their own timer.
async fn run_tick_loop(state: AppState) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        for (builder, task_uuid) in state.registry.prune_stale_inflight() {
            warn!(builder, task_uuid, "inflight task exceeded no-start grace, resetting");
            if let Err(e) = state.task_store.reset_task(&task_uuid) {
                error!(error = %e, task_uuid, "failed to reset stale inflight task");
            } else {
                notify::task_and_event_changed(&state, &task_uuid);
            }
        }

        match state.scheduler.tick() {
            Ok(dispatched) => {
                for d in dispatched {
                    dispatch_to_link(&state, &d.builder, &d.task_uuid, &d.step);
                }
            }
            Err(e) => error!(error = %e, "scheduler tick failed"),
        }

        state.task_store.pool.sweep_idle();

        for (event_uuid, rows) in state.log_buffer.drain() {
            let handle = match state.task_store.pool.ensure_open(&event_uuid, false) {
                Ok(h) => h,
                Err(e) => {
                    warn!(error = %e, event_uuid, "dropping log batch for unopenable event db");
                    continue;
                }
            };
            let mut conn = handle.conn();
            if let Err(e) = logs::write_batch(&mut conn, &rows) {
                error!(error = %e, event_uuid, "failed to write log batch");
            }
        }

        for (resource, cookie) in state.leases.poll_expired() {
            info!(resource, cookie, "resource lease expired");
        }
    }
}

pub(crate) fn dispatch_to_link(state: &AppState, builder: &str, task_uuid: &str, step: &sai_scheduler::Step) {
    let task = match state.task_store.get_task(task_uuid) {
        Ok(t) => t,
        Err(e) => {
            error!(error = %e, task_uuid, "dispatched task vanished before assign could be sent");
            return;
        }
    };
    let event = match state.task_store.global.get_event(&task.event_uuid) {
        Ok(Some(e)) => e,
        Ok(None) => {
            error!(task_uuid, event_uuid = task.event_uuid, "dispatched task's event vanished");
            return;
        }
        Err(e) => {
            error!(error = %e, task_uuid, "failed to load event for dispatch");
            return;
        }
    };
    let frame = BuilderFrame::Assign(TaskAssign {
        task_uuid: task.uuid.clone(),
        event_uuid: task.event_uuid.clone(),
        step: task.build_step,
        step_count: task.build_step_count,
        platform: task.platform.clone(),
        command: step.command(&event),
        art_up_nonce: task.art_up_nonce.clone(),
        art_down_nonce: task.art_down_nonce.clone(),
    });
    if !state.links.send(builder, frame) {
        warn!(builder, task_uuid, "dispatched task but builder link is gone");
    }
    notify::task_and_event_changed(state, task_uuid);
}
