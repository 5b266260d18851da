//! Interface to the replication layer.

use crate::Result;
use async_trait::async_trait;
use rehost_types::{DiscoveryKey, HostedEntry, Identifier, SourceState};
use tokio::sync::broadcast;

/// Events emitted by the replication layer independently of any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A source was opened locally, hosted directly or pulled in by another.
    /// `secondary_of` is set when it was opened as a container's secondary.
    SourceOpened {
        identifier: Identifier,
        secondary_of: Option<Identifier>,
    },
    /// A swarm connection was established with `peer`, sharing `topics`.
    ConnectionOpened {
        peer: Identifier,
        topics: Vec<DiscoveryKey>,
    },
    ConnectionClosed { peer: Identifier },
}

/// Replication capability used by the registry, linker and walker.
///
/// Implementations own the transport and the append-only storage; the core
/// only asks them to start or stop hosting a source and reads back what they
/// currently know.
///
/// A directly hosted source keeps open everything it pulls in: the secondary
/// of a container and the entries of a keyset, transitively. A source stays
/// open while any directly hosted source still reaches it.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Host `identifier` directly, announcing it when `announce` is set.
    /// Hosting an already hosted source only updates its announce flag.
    async fn host(&self, identifier: Identifier, announce: bool) -> Result<()>;

    /// Drop the direct hold on `identifier`. It keeps replicating, without
    /// being announced, while another hosted source still pulls it in.
    /// Unknown sources are ignored.
    async fn unhost(&self, identifier: Identifier) -> Result<()>;

    /// Current replication state, or `None` when the source is not open.
    async fn state(&self, identifier: Identifier) -> Result<Option<SourceState>>;

    /// First block of the source. Suspends until the block is available.
    async fn first_block(&self, identifier: Identifier) -> Result<Vec<u8>>;

    /// Entries listed by a keyset source.
    async fn keyset(&self, identifier: Identifier) -> Result<Vec<HostedEntry>>;

    /// Every source currently open, sorted.
    fn open_sources(&self) -> Vec<Identifier>;

    /// Map a swarm topic back to the locally known source, if any.
    fn resolve_discovery(&self, key: &DiscoveryKey) -> Option<Identifier>;

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    async fn close(&self) -> Result<()>;
}
