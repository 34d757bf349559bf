//! Allocation of TCP ports for direct row streaming between step copies
//! running on different nodes.
//!
//! Allocation is serialized through one critical section per broker (one
//! broker per node process). Inside it the broker scans forward from the
//! requested range start for a port that is neither leased nor in use by
//! the operating system. Asking again for the same pairing within a run
//! returns the port that was already leased.

use std::{
    collections::{BTreeSet, HashMap},
    net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener},
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use sluice_protocol::cluster::PortAllocationRequest;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortAllocationError {
    #[error("no free port found on '{hostname}' in range {range_start}-{range_end}")]
    Exhausted {
        hostname: String,
        range_start: u16,
        range_end: u16,
    },
}

/// Checks whether the operating system would let us listen on a port
pub trait PortProbe: Send + Sync {
    fn is_available(&self, hostname: &str, port: u16) -> bool;
}

/// Probes by binding a listener and dropping it right away
#[derive(Debug, Default)]
pub struct SocketProbe;

impl PortProbe for SocketProbe {
    fn is_available(&self, hostname: &str, port: u16) -> bool {
        let ip = hostname
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        TcpListener::bind(SocketAddr::new(ip, port)).is_ok()
    }
}

/// Identity of one streaming link within a run
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortLeaseKey {
    pub run_id: String,
    pub hostname: String,
    pub source_node: String,
    pub source_step: String,
    pub source_copy: u32,
    pub target_node: String,
    pub target_step: String,
    pub target_copy: u32,
}

impl From<&PortAllocationRequest> for PortLeaseKey {
    fn from(request: &PortAllocationRequest) -> Self {
        Self {
            run_id: request.run_id.clone(),
            hostname: request.hostname.clone(),
            source_node: request.source_node.clone(),
            source_step: request.source_step.clone(),
            source_copy: request.source_copy,
            target_node: request.target_node.clone(),
            target_step: request.target_step.clone(),
            target_copy: request.target_copy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortLease {
    pub key: PortLeaseKey,
    pub port: u16,
    pub pipeline_name: String,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Leases {
    by_key: HashMap<PortLeaseKey, PortLease>,
    ports_by_host: HashMap<String, BTreeSet<u16>>,
}

pub struct PortBroker {
    leases: Mutex<Leases>,
    probe: Box<dyn PortProbe>,
    range_end: u16,
}

impl Default for PortBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PortBroker {
    pub fn new() -> Self {
        Self::with_probe(SocketProbe, u16::MAX)
    }

    /// Broker using a custom probe and scanning no further than `range_end`
    pub fn with_probe(probe: impl PortProbe + 'static, range_end: u16) -> Self {
        Self {
            leases: Mutex::new(Leases::default()),
            probe: Box::new(probe),
            range_end,
        }
    }

    pub fn allocate(&self, request: &PortAllocationRequest) -> Result<u16, PortAllocationError> {
        let key = PortLeaseKey::from(request);
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(lease) = leases.by_key.get(&key) {
            debug!(run_id = %key.run_id, port = lease.port, "Reusing port lease");
            return Ok(lease.port);
        }

        let leased = leases
            .ports_by_host
            .get(&request.hostname)
            .cloned()
            .unwrap_or_default();

        let port = (request.range_start..=self.range_end)
            .filter(|port| !leased.contains(port))
            .find(|port| self.probe.is_available(&request.hostname, *port))
            .ok_or_else(|| {
                warn!(
                    hostname = %request.hostname,
                    range_start = request.range_start,
                    "No free port left for cluster streaming"
                );
                PortAllocationError::Exhausted {
                    hostname: request.hostname.clone(),
                    range_start: request.range_start,
                    range_end: self.range_end,
                }
            })?;

        leases
            .ports_by_host
            .entry(request.hostname.clone())
            .or_default()
            .insert(port);
        leases.by_key.insert(
            key.clone(),
            PortLease {
                key,
                port,
                pipeline_name: request.pipeline_name.clone(),
                allocated_at: Utc::now(),
            },
        );

        info!(
            run_id = %request.run_id,
            hostname = %request.hostname,
            port,
            source = %format!("{}/{}.{}", request.source_node, request.source_step, request.source_copy),
            target = %format!("{}/{}.{}", request.target_node, request.target_step, request.target_copy),
            "Allocated cluster port"
        );
        Ok(port)
    }

    /// Release every lease of a run, returning how many were released
    pub fn release_run(&self, run_id: &str) -> usize {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let Leases {
            by_key,
            ports_by_host,
        } = &mut *leases;

        let mut released = 0;
        by_key.retain(|key, lease| {
            if key.run_id != run_id {
                return true;
            }
            if let Some(ports) = ports_by_host.get_mut(&key.hostname) {
                ports.remove(&lease.port);
            }
            released += 1;
            false
        });
        ports_by_host.retain(|_, ports| !ports.is_empty());

        if released > 0 {
            debug!(run_id = %run_id, released, "Released cluster ports");
        }
        released
    }

    pub fn leases(&self, run_id: &str) -> Vec<PortLease> {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<PortLease> = leases
            .by_key
            .values()
            .filter(|lease| lease.key.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by_key(|lease| lease.port);
        found
    }
}
