//! The Sai builder daemon (spec.md §1/§4.E): dials a configured server,
//! announces the platforms this machine serves, and executes whatever
//! build steps it's assigned. Process shape mirrors `sai-server`'s
//! binary: config/logging setup, then a long-running run loop.

mod artifacts;
mod error;
mod executor;
mod link;
mod logging;
mod mirror;
mod resource_proxy;
mod state;

use anyhow::Context;
use clap::Parser;
use sai_lib::config::{CommonCli, Config};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = CommonCli::parse();
    let config = Config::load(&cli.config_dir).context("loading config file")?;
    let _log_guard = logging::subscribe_log(&cli.log_mask, None);

    let platforms: Vec<String> = config.platforms.iter().map(|p| p.name.clone()).collect();
    let instances: u32 = config.platforms.iter().map(|p| p.instances).sum();
    let server_url = config
        .platforms
        .iter()
        .find_map(|p| p.servers.first().cloned())
        .context("no server configured under any platform entry")?;
    let builder_name = hostname();

    std::fs::create_dir_all(&config.home).with_context(|| format!("creating home dir {:?}", config.home))?;

    info!(builder = builder_name, server = server_url, ?platforms, "starting sai-builder");

    let link_config = link::LinkConfig {
        server_url,
        builder_name,
        platforms,
        instances,
        home: config.home.clone(),
    };

    loop {
        if let Err(e) = link::run_connection(&link_config).await {
            error!(error = %e, "link to server failed");
        }
        tokio::time::sleep(link::RECONNECT_BACKOFF).await;
    }
}

fn hostname() -> String {
    std::env::var("SAI_BUILDER_NAME")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "builder1".to_string())
}
