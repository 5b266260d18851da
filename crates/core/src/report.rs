//! Inventory and aggregate numbers derived from one walk.

use crate::links::LinkTable;
use crate::walker::TopologyNode;
use serde::Serialize;
use std::fmt::Write;

/// Aggregates exported as gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RehostMetrics {
    pub nr_connections: u64,
    pub total_bytes: u64,
    pub nr_incomplete_cores: u64,
    pub total_cores: u64,
    pub cores_without_peers: u64,
}

/// Result of a single topology walk plus the swarm connection count.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub nodes: Vec<TopologyNode>,
    pub connections: u64,
}

impl Inventory {
    pub fn new(nodes: Vec<TopologyNode>, connections: u64) -> Self {
        Self { nodes, connections }
    }

    pub fn announced(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter().filter(|node| node.announce)
    }

    pub fn replicated_only(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter().filter(|node| !node.announce)
    }

    pub fn metrics(&self) -> RehostMetrics {
        let mut metrics = RehostMetrics {
            nr_connections: self.connections,
            total_cores: self.nodes.len() as u64,
            ..Default::default()
        };
        for node in &self.nodes {
            metrics.total_bytes += node.state.byte_size;
            if !node.state.is_complete() {
                metrics.nr_incomplete_cores += 1;
            }
            if node.state.peer_count == 0 {
                metrics.cores_without_peers += 1;
            }
        }
        metrics
    }

    /// One-line overview, suitable for periodic logging.
    pub fn summary(&self) -> String {
        format!(
            "Nr announced (served) keys: {} -- Nr replicated-but-not-announced keys: {} -- Nr open connections: {}",
            self.announced().count(),
            self.replicated_only().count(),
            self.connections
        )
    }

    /// Per-source inventory, one line each, indented by depth.
    pub fn details(&self, links: &LinkTable) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let name = match node.owner {
                Some(owner) => format!("{} (secondary of {})", node.identifier, owner),
                None => links.describe(&node.identifier),
            };
            let _ = write!(
                out,
                "{:indent$}{} [{}] {}/{} blocks, {} bytes, {} peers",
                "",
                name,
                if node.announce { "announced" } else { "replicated" },
                node.state.length_downloaded,
                node.state.length_known,
                node.state.byte_size,
                node.state.peer_count,
                indent = node.depth * 2
            );
            if let Some(info) = &node.info {
                let _ = write!(out, " -- {info}");
            }
            out.push('\n');
        }
        out
    }
}
