//! Resource lease manager (spec.md §4.G): named well-known resources
//! with a bounded budget and a strict FIFO wait queue.

use crate::error::{RegistryError, RegistryResult};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::time::{delay_queue::Key, DelayQueue};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseOutcome {
    Granted,
    Queued,
}

#[derive(Debug, Clone)]
struct Requisition {
    cookie: String,
    amount: u32,
    lease_secs: u64,
}

struct WellKnownResource {
    budget: u32,
    allocated: u32,
    queued: VecDeque<Requisition>,
    leased: HashMap<String, (u32, Key)>,
}

impl WellKnownResource {
    fn new(budget: u32) -> WellKnownResource {
        WellKnownResource {
            budget,
            allocated: 0,
            queued: VecDeque::new(),
            leased: HashMap::new(),
        }
    }
}

/// Owns one `DelayQueue` per resource expiry horizon; callers drive
/// expiry by polling [`ResourceLeaseManager::poll_expired`] from the
/// scheduler's existing 1 Hz tick (spec.md §4.G), matching the
/// teacher's `tokio-util` dependency rather than spawning a per-lease
/// `tokio::time::sleep` task.
pub struct ResourceLeaseManager {
    resources: Mutex<HashMap<String, WellKnownResource>>,
    expiry: Mutex<DelayQueue<(String, String)>>,
}

impl ResourceLeaseManager {
    pub fn new(budgets: impl IntoIterator<Item = (String, u32)>) -> ResourceLeaseManager {
        let resources = budgets
            .into_iter()
            .map(|(name, budget)| (name, WellKnownResource::new(budget)))
            .collect();
        ResourceLeaseManager {
            resources: Mutex::new(resources),
            expiry: Mutex::new(DelayQueue::new()),
        }
    }

    /// Grants immediately if the budget allows, otherwise enqueues FIFO.
    /// A grant only ever re-checks the head of the queue, so a small
    /// request can never jump a larger one ahead of it in line (spec.md
    /// §4.G).
    pub fn request(
        &self,
        resource: &str,
        cookie: &str,
        amount: u32,
        lease_secs: u64,
    ) -> RegistryResult<LeaseOutcome> {
        let mut resources = self.resources.lock().expect("lease mutex poisoned");
        let r = resources
            .get_mut(resource)
            .ok_or_else(|| RegistryError::NoSuchResource(resource.to_string()))?;

        if r.queued.is_empty() && r.allocated + amount <= r.budget {
            r.allocated += amount;
            let key = self
                .expiry
                .lock()
                .expect("expiry mutex poisoned")
                .insert((resource.to_string(), cookie.to_string()), Duration::from_secs(lease_secs));
            r.leased.insert(cookie.to_string(), (amount, key));
            info!(resource, cookie, amount, "lease granted");
            Ok(LeaseOutcome::Granted)
        } else {
            r.queued.push_back(Requisition {
                cookie: cookie.to_string(),
                amount,
                lease_secs,
            });
            debug!(resource, cookie, amount, "lease queued");
            Ok(LeaseOutcome::Queued)
        }
    }

    /// Frees `cookie`'s slot and attempts to grant the queue head.
    /// Returns `true` if a lease existed and was freed.
    pub fn yield_lease(&self, resource: &str, cookie: &str) -> bool {
        let mut resources = self.resources.lock().expect("lease mutex poisoned");
        let Some(r) = resources.get_mut(resource) else {
            return false;
        };
        let Some((amount, key)) = r.leased.remove(cookie) else {
            return false;
        };
        r.allocated = r.allocated.saturating_sub(amount);
        self.expiry.lock().expect("expiry mutex poisoned").try_remove(&key);
        drop(resources);
        self.check_queued(resource);
        true
    }

    /// Yields a lease when the caller only has the cookie, not the
    /// resource name (spec.md §6 `com-warmcat-sai-resource-yield` carries
    /// only `cookie`). Cookies are generated by the requester and are
    /// unique across resources in practice, so this is a linear scan
    /// over the (small) set of well-known resources rather than a
    /// second index.
    pub fn yield_by_cookie(&self, cookie: &str) -> bool {
        let resource = {
            let resources = self.resources.lock().expect("lease mutex poisoned");
            resources
                .iter()
                .find(|(_, r)| r.leased.contains_key(cookie))
                .map(|(name, _)| name.clone())
        };
        match resource {
            Some(resource) => self.yield_lease(&resource, cookie),
            None => false,
        }
    }

    fn check_queued(&self, resource: &str) {
        let mut resources = self.resources.lock().expect("lease mutex poisoned");
        let Some(r) = resources.get_mut(resource) else {
            return;
        };
        while let Some(next) = r.queued.front() {
            if r.allocated + next.amount > r.budget {
                break;
            }
            let next = r.queued.pop_front().expect("front just checked Some");
            r.allocated += next.amount;
            // Lease-secs for queue-granted requisitions default to the
            // caller's original request; tracked at grant time via the
            // expiry queue so a stalled consumer still times out.
            let key = self.expiry.lock().expect("expiry mutex poisoned").insert(
                (resource.to_string(), next.cookie.clone()),
                Duration::from_secs(next.lease_secs),
            );
            r.leased.insert(next.cookie.clone(), (next.amount, key));
            info!(resource, cookie = next.cookie, "queued lease granted");
        }
    }

    /// Drains any leases whose timer fired, yielding them. Call from the
    /// scheduler's 1 Hz tick. `DelayQueue::poll_expired` wants a task
    /// context even for a one-shot drain, so this drives it with a
    /// no-op waker rather than spawning a dedicated timer task per
    /// lease.
    pub fn poll_expired(&self) -> Vec<(String, String)> {
        use futures::task::noop_waker_ref;
        use std::task::{Context, Poll};

        let mut expired = Vec::new();
        let waker = noop_waker_ref();
        let mut cx = Context::from_waker(waker);
        loop {
            let mut queue = self.expiry.lock().expect("expiry mutex poisoned");
            match queue.poll_expired(&mut cx) {
                Poll::Ready(Some(entry)) => {
                    let (resource, cookie) = entry.into_inner();
                    drop(queue);
                    expired.push((resource, cookie));
                }
                _ => break,
            }
        }
        for (resource, cookie) in &expired {
            let mut resources = self.resources.lock().expect("lease mutex poisoned");
            if let Some(r) = resources.get_mut(resource) {
                if let Some((amount, _)) = r.leased.remove(cookie) {
                    r.allocated = r.allocated.saturating_sub(amount);
                }
            }
            drop(resources);
            self.check_queued(resource);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ResourceLeaseManager {
        ResourceLeaseManager::new([("netbw".to_string(), 2), ("gpu".to_string(), 1)])
    }

    #[test]
    fn grants_within_budget_and_queues_overflow() {
        let mgr = manager();
        assert_eq!(mgr.request("gpu", "c1", 1, 60).unwrap(), LeaseOutcome::Granted);
        assert_eq!(mgr.request("gpu", "c2", 1, 60).unwrap(), LeaseOutcome::Queued);
    }

    #[test]
    fn yield_grants_queue_head_fifo() {
        let mgr = manager();
        assert_eq!(mgr.request("gpu", "c1", 1, 60).unwrap(), LeaseOutcome::Granted);
        assert_eq!(mgr.request("gpu", "c2", 1, 60).unwrap(), LeaseOutcome::Queued);
        assert_eq!(mgr.request("gpu", "c3", 1, 60).unwrap(), LeaseOutcome::Queued);

        assert!(mgr.yield_lease("gpu", "c1"));
        // c2 was queued first, so it must be the one granted, not c3.
        let resources = mgr.resources.lock().unwrap();
        let r = &resources["gpu"];
        assert!(r.leased.contains_key("c2"));
        assert!(!r.leased.contains_key("c3"));
    }

    #[test]
    fn small_request_never_jumps_a_queued_large_one() {
        let mgr = manager();
        assert_eq!(mgr.request("netbw", "big", 2, 60).unwrap(), LeaseOutcome::Granted);
        assert_eq!(mgr.request("netbw", "waiting-big", 2, 60).unwrap(), LeaseOutcome::Queued);
        assert_eq!(mgr.request("netbw", "small", 1, 60).unwrap(), LeaseOutcome::Queued);

        mgr.yield_lease("netbw", "big");
        let resources = mgr.resources.lock().unwrap();
        let r = &resources["netbw"];
        // budget is 2; waiting-big needs 2 and should be granted before
        // small even though small would also fit alone.
        assert!(r.leased.contains_key("waiting-big"));
        assert!(!r.leased.contains_key("small"));
    }

    #[test]
    fn yield_by_cookie_finds_the_owning_resource() {
        let mgr = manager();
        assert_eq!(mgr.request("gpu", "c1", 1, 60).unwrap(), LeaseOutcome::Granted);
        assert!(mgr.yield_by_cookie("c1"));
        assert!(!mgr.yield_by_cookie("c1"));
    }

    #[test]
    fn unknown_resource_is_an_error() {
        let mgr = manager();
        assert!(matches!(
            mgr.request("nope", "c", 1, 1),
            Err(RegistryError::NoSuchResource(_))
        ));
    }
}
