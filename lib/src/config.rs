//! CLI flags + the `<config-dir>/conf` JSON file (spec.md §6), merged the
//! way `host::Cli` merges flags over a JSON document: flags always win.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

fn default_log_mask() -> String {
    "info".to_string()
}

/// Common CLI surface shared by the server and builder daemons (spec.md
/// §6: `-c <config-dir>`, `-d <log-mask>`).
#[derive(Parser, Debug, Clone)]
#[command(name = "sai", about = "Sai CI daemon", long_about = None)]
pub struct CommonCli {
    /// Directory holding the `conf` JSON file.
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    pub config_dir: PathBuf,

    /// tracing log-level mask, e.g. "info", "debug", "warn".
    #[arg(short = 'd', long = "log-mask", default_value_t = default_log_mask())]
    pub log_mask: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlatformConfig {
    pub name: String,
    pub instances: u32,
    #[serde(default)]
    pub servers: Vec<String>,
}

/// `<config-dir>/conf` (spec.md §6). JWT fields are retained for
/// round-tripping the file but are not acted on — the JWT login flow is
/// out of scope (spec.md §1).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub home: PathBuf,
    pub perms: String,
    pub host: String,
    pub platforms: Vec<PlatformConfig>,
    /// `"name=budget,name=budget"`, parsed by [`Config::resources`].
    pub resources: String,
    #[serde(rename = "notification-key")]
    pub notification_key: String,
    pub database: String,
    #[serde(rename = "jwt-iss")]
    pub jwt_iss: String,
    #[serde(rename = "jwt-aud")]
    pub jwt_aud: String,
    #[serde(rename = "jwt-auth-alg")]
    pub jwt_auth_alg: String,
    #[serde(rename = "jwt-auth-jwk-path")]
    pub jwt_auth_jwk_path: String,
    #[serde(rename = "task-abandoned-timeout-mins")]
    pub task_abandoned_timeout_mins: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("malformed resources entry {0:?}")]
    BadResources(String),
}

impl Config {
    pub fn load(config_dir: &Path) -> Result<Config, ConfigError> {
        let path = config_dir.join("conf");
        let text = fs::read_to_string(&path).map_err(|e| ConfigError::Io(path.clone(), e))?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path, e))
    }

    /// Parses `"name=budget,name=budget"` into well-known-resource pairs.
    pub fn resources(&self) -> Result<Vec<(String, u32)>, ConfigError> {
        if self.resources.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.resources
            .split(',')
            .map(|entry| {
                let (name, budget) = entry
                    .split_once('=')
                    .ok_or_else(|| ConfigError::BadResources(entry.to_string()))?;
                let budget: u32 = budget
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::BadResources(entry.to_string()))?;
                Ok((name.trim().to_string(), budget))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_parse_pairs() {
        let c = Config {
            resources: "netbw=2,gpu=1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            c.resources().unwrap(),
            vec![("netbw".to_string(), 2), ("gpu".to_string(), 1)]
        );
    }

    #[test]
    fn empty_resources_is_empty_vec() {
        let c = Config::default();
        assert!(c.resources().unwrap().is_empty());
    }

    #[test]
    fn bad_resources_entry_errors() {
        let c = Config {
            resources: "netbw".to_string(),
            ..Default::default()
        };
        assert!(c.resources().is_err());
    }

    #[test]
    fn load_reads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("conf"),
            r#"{"home": "/var/lib/sai", "host": "0.0.0.0:9999", "resources": "netbw=2"}"#,
        )
        .unwrap();
        let cfg = Config::load(dir.path()).unwrap();
        assert_eq!(cfg.host, "0.0.0.0:9999");
        assert_eq!(cfg.resources().unwrap(), vec![("netbw".to_string(), 2)]);
    }
}
