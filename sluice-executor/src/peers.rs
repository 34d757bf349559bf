//! Slaves known to a master node

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};
use sluice_protocol::cluster::{PeerNode, SlaveDetection};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, SlaveDetection>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or refresh a peer, marking it active
    pub fn register(&self, node: PeerNode, now: DateTime<Utc>) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        match peers.get_mut(&node.name) {
            Some(detection) => {
                if !detection.active {
                    info!(peer = %node, "Peer is active again");
                }
                detection.node = node;
                detection.active = true;
                detection.last_active_at = now;
            }
            None => {
                info!(peer = %node, "Registered new peer");
                peers.insert(
                    node.name.clone(),
                    SlaveDetection {
                        node,
                        active: true,
                        last_active_at: now,
                        last_inactive_at: None,
                    },
                );
            }
        }
    }

    /// Mark peers that did not register within `timeout` as inactive, returning how many flipped
    pub fn expire(&self, now: DateTime<Utc>, timeout: TimeDelta) -> usize {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        let mut expired = 0;
        for detection in peers.values_mut() {
            if detection.active && now - detection.last_active_at > timeout {
                warn!(peer = %detection.node, last_active_at = %detection.last_active_at, "Peer stopped reporting");
                detection.active = false;
                detection.last_inactive_at = Some(now);
                expired += 1;
            }
        }
        expired
    }

    pub fn list(&self) -> Vec<SlaveDetection> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
