use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SwarmStatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
}

/// Swarm connection counters, updated by the event monitor.
#[derive(Debug, Default)]
pub struct SwarmStats {
    opened: AtomicU64,
    closed: AtomicU64,
}

impl SwarmStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        let opened = self.opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.closed.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> SwarmStatsSnapshot {
        let connections_opened = self.opened.load(Ordering::Relaxed);
        let connections_closed = self.closed.load(Ordering::Relaxed);
        SwarmStatsSnapshot {
            connections_opened,
            connections_closed,
            active_connections: connections_opened.saturating_sub(connections_closed),
        }
    }
}
