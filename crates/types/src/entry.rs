//! Registry records and live replication state.

use crate::identifier::{DiscoveryKey, Identifier};
use serde::{Deserialize, Serialize};

/// A source the registry hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedEntry {
    pub identifier: Identifier,

    /// Whether the source is advertised to the swarm.
    pub announce: bool,

    /// Free-text annotation supplied by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,

    /// Secondary source, once the linker has resolved one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<Identifier>,
}

impl HostedEntry {
    pub fn new(identifier: Identifier, info: Option<String>) -> Self {
        Self {
            identifier,
            announce: true,
            info,
            secondary: None,
        }
    }

    pub fn replicated_only(identifier: Identifier) -> Self {
        Self {
            identifier,
            announce: false,
            info: None,
            secondary: None,
        }
    }
}

/// Wire shape of a registry listing: `{key, info?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl From<&HostedEntry> for KeyInfo {
    fn from(entry: &HostedEntry) -> Self {
        Self {
            key: entry.identifier,
            info: entry.info.clone(),
        }
    }
}

/// Replication progress of a single source as reported by the store.
///
/// Changes continuously while replication runs, so it is re-read on every
/// walk rather than cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceState {
    pub identifier: Identifier,
    pub discovery_key: DiscoveryKey,
    /// Number of blocks the source is known to contain.
    pub length_known: u64,
    /// Number of contiguous blocks present locally.
    pub length_downloaded: u64,
    pub peer_count: u64,
    pub byte_size: u64,
}

impl SourceState {
    /// State of a source nothing is known about yet.
    pub fn empty(identifier: Identifier) -> Self {
        Self {
            identifier,
            discovery_key: identifier.discovery_key(),
            length_known: 0,
            length_downloaded: 0,
            peer_count: 0,
            byte_size: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.length_downloaded == self.length_known
    }

    pub fn missing_blocks(&self) -> u64 {
        self.length_known.saturating_sub(self.length_downloaded)
    }
}
