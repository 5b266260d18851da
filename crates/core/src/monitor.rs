//! Swarm connection monitor.

use crate::links::LinkTable;
use rehost_storage::{SourceStore, StoreEvent, SwarmStats};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Count and log swarm connections until shutdown.
pub async fn run_swarm_monitor(
    store: Arc<dyn SourceStore>,
    links: Arc<LinkTable>,
    stats: Arc<SwarmStats>,
    mut events: broadcast::Receiver<StoreEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Ok(StoreEvent::ConnectionOpened { peer, topics }) => {
                    stats.record_connection_opened();
                    info!(
                        "Opened connection to {} ({} open)",
                        peer,
                        stats.active_connections()
                    );
                    if tracing::enabled!(tracing::Level::DEBUG) {
                        let names: Vec<String> = topics
                            .iter()
                            .map(|topic| match store.resolve_discovery(topic) {
                                Some(identifier) => links.describe(&identifier),
                                None => format!("unknown topic {topic}"),
                            })
                            .collect();
                        debug!("Connection to {} shares: {}", peer, names.join(", "));
                    }
                }
                Ok(StoreEvent::ConnectionClosed { peer }) => {
                    stats.record_connection_closed();
                    info!(
                        "Closed connection to {} ({} open)",
                        peer,
                        stats.active_connections()
                    );
                }
                Ok(StoreEvent::SourceOpened { .. }) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Swarm monitor missed {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }
    debug!("Swarm monitor stopped");
}
