//! A slave announces itself to its masters and keeps doing so, which is
//! how a master tells active from silent slaves.

use std::time::Duration;

use futures::future::join_all;
use sluice_client::{ClientConfig, RemoteExecutionClient};
use sluice_protocol::cluster::PeerNode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Config;

/// Register with every master once, returning how many accepted
pub async fn report_to_masters(clients: &[RemoteExecutionClient], node: &PeerNode) -> usize {
    let results = join_all(clients.iter().map(|client| client.register_slave(node))).await;

    clients
        .iter()
        .zip(results)
        .filter(|(client, result)| match result {
            Ok(()) => {
                debug!(master = %client.node(), "Registered with master");
                true
            }
            Err(e) => {
                warn!(master = %client.node(), error = %e, "Unable to register with master");
                false
            }
        })
        .count()
}

/// Register every `interval` until shutdown
pub async fn run(config: Config, interval: Duration, shutdown: CancellationToken) {
    let client_config = ClientConfig::default().with_timeout(interval.max(Duration::from_secs(1)));
    let clients: Vec<RemoteExecutionClient> = config
        .masters
        .iter()
        .cloned()
        .map(|master| RemoteExecutionClient::new(master).with_config(client_config.clone()))
        .collect();

    if clients.is_empty() {
        return;
    }

    info!(masters = clients.len(), interval = ?interval, "Reporting to masters");
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {
                report_to_masters(&clients, &config.node).await;
            }
        }
    }
}
