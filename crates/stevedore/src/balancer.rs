//! Restricted-host load balancing
//!
//! When direct connectivity to the whole cluster is not permitted, every
//! connection must go through a fixed set of known reachable hosts. The
//! balancer maps an arbitrary requested host onto that set: requests for a
//! known host stick to it, requests for anything else go to the least
//! loaded known host.
//!
//! The load table is a session-lifetime assignment counter, not a live
//! load signal: entries only ever increase and there is no expiry. That
//! keeps the assignment fully reproducible from the call sequence alone.

use parking_lot::Mutex;
use tracing::debug;

/// Maps requested hosts onto a fixed set of reachable hosts
///
/// Shared across worker tasks behind an `Arc`; the lock guards only the
/// compare/increment step and is never held across I/O.
pub struct HostBalancer {
    /// Known hosts in construction order; the order fixes the tie-break
    hosts: Vec<String>,
    /// Assignment counts, indexed like `hosts`
    loads: Mutex<Vec<u64>>,
}

impl HostBalancer {
    /// Create a balancer over an ordered known-host set
    ///
    /// Duplicates are dropped, keeping the first occurrence so the
    /// tie-break order stays the configured order.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for host in hosts {
            let host = host.into();
            if !deduped.contains(&host) {
                deduped.push(host);
            }
        }

        let loads = Mutex::new(vec![0u64; deduped.len()]);
        Self {
            hosts: deduped,
            loads,
        }
    }

    /// Number of known hosts
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    /// Check whether the known-host set is empty
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Resolve a requested host onto the known-host set
    ///
    /// A known host is sticky: its own load is incremented and it is
    /// returned unchanged. An unknown host is mapped to the known host with
    /// the minimum load; ties break to the lowest construction index.
    pub fn resolve(&self, requested: &str) -> String {
        let mut loads = self.loads.lock();

        if let Some(idx) = self.hosts.iter().position(|h| h == requested) {
            loads[idx] += 1;
            return requested.to_string();
        }

        // position of the minimum load; min_by_key keeps the first (lowest
        // index) entry on ties, which is the documented tie-break
        let idx = loads
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(idx, _)| idx)
            .expect("balancer constructed with an empty host list");
        loads[idx] += 1;

        debug!(
            requested,
            assigned = %self.hosts[idx],
            "mapped unreachable host onto known host"
        );
        self.hosts[idx].clone()
    }

    /// Snapshot of (host, load) pairs in construction order
    pub fn loads(&self) -> Vec<(String, u64)> {
        let loads = self.loads.lock();
        self.hosts
            .iter()
            .cloned()
            .zip(loads.iter().copied())
            .collect()
    }
}
