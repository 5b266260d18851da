//! In-process replication store.
//!
//! Stands in for a real swarm-backed store: sources are "replicated" by the
//! caller writing blocks and progress into it directly. What is open follows
//! what is hosted: every directly hosted source, plus the secondaries of open
//! containers and the entries of open keysets once their headers are known.

use crate::store::{SourceStore, StoreEvent};
use crate::{Result, StoreError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rehost_types::{DiscoveryKey, HostedEntry, Identifier, SourceKind, SourceState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default)]
struct MemorySource {
    announce: bool,
    length_known: u64,
    length_downloaded: u64,
    byte_size: u64,
}

/// Why a source should be open.
#[derive(Debug, Clone, Copy)]
struct Wanted {
    announce: bool,
    secondary_of: Option<Identifier>,
}

/// In-memory [`SourceStore`].
#[derive(Clone)]
pub struct MemorySourceStore {
    inner: Arc<MemorySourceStoreInner>,
}

struct MemorySourceStoreInner {
    /// Directly hosted sources and their announce flag
    direct: RwLock<HashMap<Identifier, bool>>,

    /// Open sources
    sources: RwLock<HashMap<Identifier, MemorySource>>,

    /// First block per source; watchers wait on these
    blocks: RwLock<HashMap<Identifier, watch::Sender<Option<Vec<u8>>>>>,

    /// Contents of keyset sources
    keysets: RwLock<HashMap<Identifier, Vec<HostedEntry>>>,

    /// Open swarm connections: peer -> shared topics
    connections: RwLock<HashMap<Identifier, Vec<DiscoveryKey>>>,

    /// Sources whose host/unhost calls fail
    rejected: RwLock<HashSet<Identifier>>,

    events: broadcast::Sender<StoreEvent>,
    closed: AtomicBool,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MemorySourceStoreInner {
                direct: RwLock::new(HashMap::new()),
                sources: RwLock::new(HashMap::new()),
                blocks: RwLock::new(HashMap::new()),
                keysets: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                rejected: RwLock::new(HashSet::new()),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn emit(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn header_kind(&self, identifier: &Identifier) -> Option<SourceKind> {
        let blocks = self.inner.blocks.read();
        let block = blocks.get(identifier)?.borrow().clone()?;
        Some(SourceKind::from_header(&block))
    }

    /// Everything the directly hosted sources pull in, in discovery order.
    fn reachable(&self, direct: &HashMap<Identifier, bool>) -> Vec<(Identifier, Wanted)> {
        let mut roots: Vec<_> = direct.iter().map(|(id, announce)| (*id, *announce)).collect();
        roots.sort();
        let mut queue: VecDeque<(Identifier, Wanted)> = roots
            .into_iter()
            .map(|(identifier, announce)| {
                (
                    identifier,
                    Wanted {
                        announce,
                        secondary_of: None,
                    },
                )
            })
            .collect();

        let mut order: Vec<(Identifier, Wanted)> = Vec::new();
        let mut seen: HashMap<Identifier, usize> = HashMap::new();
        while let Some((identifier, wanted)) = queue.pop_front() {
            if let Some(&index) = seen.get(&identifier) {
                order[index].1.announce |= wanted.announce;
                continue;
            }
            seen.insert(identifier, order.len());
            order.push((identifier, wanted));

            match self.header_kind(&identifier) {
                Some(SourceKind::Container { secondary }) => queue.push_back((
                    secondary,
                    Wanted {
                        announce: false,
                        secondary_of: Some(identifier),
                    },
                )),
                Some(SourceKind::Keyset) => {
                    let entries = self
                        .inner
                        .keysets
                        .read()
                        .get(&identifier)
                        .cloned()
                        .unwrap_or_default();
                    queue.extend(entries.into_iter().map(|entry| {
                        (
                            entry.identifier,
                            Wanted {
                                announce: entry.announce,
                                secondary_of: None,
                            },
                        )
                    }));
                }
                Some(SourceKind::Plain) | None => {}
            }
        }
        order
    }

    /// Change the direct holds, then open and close sources to match.
    fn update_direct(&self, change: impl FnOnce(&mut HashMap<Identifier, bool>)) {
        let opened = {
            let mut direct = self.inner.direct.write();
            change(&mut direct);
            let wanted = self.reachable(&direct);
            let keep: HashSet<Identifier> = wanted.iter().map(|(id, _)| *id).collect();

            let mut sources = self.inner.sources.write();
            sources.retain(|identifier, _| {
                let open = keep.contains(identifier);
                if !open {
                    debug!("Closed source {}", identifier);
                }
                open
            });

            let mut opened = Vec::new();
            for (identifier, wanted) in wanted {
                match sources.get_mut(&identifier) {
                    Some(source) => source.announce = wanted.announce,
                    None => {
                        sources.insert(
                            identifier,
                            MemorySource {
                                announce: wanted.announce,
                                ..Default::default()
                            },
                        );
                        opened.push((identifier, wanted.secondary_of));
                    }
                }
            }
            opened
        };

        for (identifier, secondary_of) in opened {
            debug!("Opened source {}", identifier);
            self.emit(StoreEvent::SourceOpened {
                identifier,
                secondary_of,
            });
        }
    }

    fn refresh(&self) {
        self.update_direct(|_| {});
    }

    /// Make the first block of a source available, waking any waiters.
    pub fn write_first_block(&self, identifier: Identifier, block: Vec<u8>) {
        {
            let mut blocks = self.inner.blocks.write();
            blocks
                .entry(identifier)
                .or_insert_with(|| watch::channel(None).0)
                .send_replace(Some(block));
        }
        self.refresh();
    }

    /// Write a header block declaring `kind`.
    pub fn write_header(&self, identifier: Identifier, kind: SourceKind) {
        self.write_first_block(identifier, kind.to_header());
    }

    /// Replace the entries listed by a keyset source.
    pub fn set_keyset(&self, identifier: Identifier, entries: Vec<HostedEntry>) {
        self.inner.keysets.write().insert(identifier, entries);
        self.refresh();
    }

    /// Record replication progress for an open source.
    pub fn set_progress(
        &self,
        identifier: Identifier,
        length_known: u64,
        length_downloaded: u64,
        byte_size: u64,
    ) {
        if let Some(source) = self.inner.sources.write().get_mut(&identifier) {
            source.length_known = length_known;
            source.length_downloaded = length_downloaded;
            source.byte_size = byte_size;
        }
    }

    pub fn open_connection(&self, peer: Identifier, topics: Vec<DiscoveryKey>) {
        self.inner.connections.write().insert(peer, topics.clone());
        self.emit(StoreEvent::ConnectionOpened { peer, topics });
    }

    pub fn close_connection(&self, peer: Identifier) {
        let removed = self.inner.connections.write().remove(&peer).is_some();
        if removed {
            self.emit(StoreEvent::ConnectionClosed { peer });
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    /// Make host/unhost of `identifier` fail until [`Self::accept`] is called.
    pub fn reject(&self, identifier: Identifier) {
        self.inner.rejected.write().insert(identifier);
    }

    pub fn accept(&self, identifier: Identifier) {
        self.inner.rejected.write().remove(&identifier);
    }

    pub fn is_hosted(&self, identifier: &Identifier) -> bool {
        self.inner.sources.read().contains_key(identifier)
    }

    pub fn is_announced(&self, identifier: &Identifier) -> bool {
        self.inner
            .sources
            .read()
            .get(identifier)
            .map(|source| source.announce)
            .unwrap_or(false)
    }

    /// Whether `identifier` is hosted directly, not only pulled in.
    pub fn is_hosted_directly(&self, identifier: &Identifier) -> bool {
        self.inner.direct.read().contains_key(identifier)
    }

    fn check_rejected(&self, identifier: Identifier) -> Result<()> {
        if self.inner.rejected.read().contains(&identifier) {
            return Err(StoreError::Unavailable(
                identifier,
                "rejected by store".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MemorySourceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn host(&self, identifier: Identifier, announce: bool) -> Result<()> {
        self.ensure_open()?;
        self.check_rejected(identifier)?;
        self.update_direct(|direct| {
            direct.insert(identifier, announce);
        });
        Ok(())
    }

    async fn unhost(&self, identifier: Identifier) -> Result<()> {
        self.ensure_open()?;
        self.check_rejected(identifier)?;
        self.update_direct(|direct| {
            direct.remove(&identifier);
        });
        if self.is_hosted(&identifier) {
            debug!("{} stays open, still pulled in by another source", identifier);
        }
        Ok(())
    }

    async fn state(&self, identifier: Identifier) -> Result<Option<SourceState>> {
        self.ensure_open()?;
        let source = match self.inner.sources.read().get(&identifier) {
            Some(source) => source.clone(),
            None => return Ok(None),
        };

        let discovery_key = identifier.discovery_key();
        let peer_count = self
            .inner
            .connections
            .read()
            .values()
            .filter(|topics| topics.contains(&discovery_key))
            .count() as u64;

        Ok(Some(SourceState {
            identifier,
            discovery_key,
            length_known: source.length_known,
            length_downloaded: source.length_downloaded,
            peer_count,
            byte_size: source.byte_size,
        }))
    }

    async fn first_block(&self, identifier: Identifier) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let mut receiver = {
            let mut blocks = self.inner.blocks.write();
            blocks
                .entry(identifier)
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let block = receiver
            .wait_for(|block| block.is_some())
            .await
            .map_err(|_| StoreError::Closed)?;
        let bytes: Option<Vec<u8>> = (*block).clone();
        Ok(bytes.unwrap_or_default())
    }

    async fn keyset(&self, identifier: Identifier) -> Result<Vec<HostedEntry>> {
        self.ensure_open()?;
        Ok(self
            .inner
            .keysets
            .read()
            .get(&identifier)
            .cloned()
            .unwrap_or_default())
    }

    fn open_sources(&self) -> Vec<Identifier> {
        let mut ids: Vec<Identifier> = self.inner.sources.read().keys().copied().collect();
        ids.sort();
        ids
    }

    fn resolve_discovery(&self, key: &DiscoveryKey) -> Option<Identifier> {
        self.inner
            .sources
            .read()
            .keys()
            .find(|identifier| identifier.discovery_key() == *key)
            .copied()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes pending first-block waiters with an error.
        self.inner.blocks.write().clear();
        self.inner.connections.write().clear();
        Ok(())
    }
}
