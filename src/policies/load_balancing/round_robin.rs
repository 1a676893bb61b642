use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::trace;

use super::{compute_rotation, slice_rotated_left, LoadBalancingPolicy, QueryPlan};
use crate::cluster::{Host, HostDistance};
use crate::statement::Statement;

const ORDER_TYPE: Ordering = Ordering::Relaxed;

/// A Round-robin load balancing policy.
///
/// Rotates over the registered hosts, treating all of them as local.
/// Host registration is expected from whichever component performs
/// discovery; tests and simple deployments register hosts by hand.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    hosts: RwLock<Vec<Arc<Host>>>,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(Vec::new()),
            index: AtomicUsize::new(0),
        }
    }

    pub fn with_hosts(hosts: impl IntoIterator<Item = Arc<Host>>) -> Self {
        Self {
            hosts: RwLock::new(hosts.into_iter().collect()),
            index: AtomicUsize::new(0),
        }
    }

    pub fn add_host(&self, host: Arc<Host>) {
        let mut hosts = self.hosts.write().unwrap();
        if !hosts.iter().any(|h| h.endpoint() == host.endpoint()) {
            hosts.push(host);
        }
    }

    pub fn remove_host(&self, host: &Host) {
        self.hosts
            .write()
            .unwrap()
            .retain(|h| h.endpoint() != host.endpoint());
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().unwrap().clone()
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn new_query_plan(&self, _statement: Option<&Statement>) -> QueryPlan {
        let hosts = self.hosts.read().unwrap();
        let index = self.index.fetch_add(1, ORDER_TYPE);
        let rotation = compute_rotation(index, hosts.len());
        let rotated_hosts: Vec<Arc<Host>> = slice_rotated_left(&hosts, rotation).cloned().collect();
        trace!(
            hosts = rotated_hosts
                .iter()
                .map(|host| host.endpoint().to_string())
                .collect::<Vec<String>>()
                .join(",")
                .as_str(),
            "RoundRobin"
        );

        Box::new(rotated_hosts.into_iter())
    }

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_string()
    }
}
