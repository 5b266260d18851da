//! Source registry: the set of keys this node hosts.

use crate::errors::{RehostError, Result};
use crate::linker::LinkerHandle;
use parking_lot::RwLock;
use rehost_storage::{KeysetIndex, SourceStore};
use rehost_types::{HostedEntry, Identifier};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct RegistryEntries {
    order: Vec<Identifier>,
    entries: HashMap<Identifier, HostedEntry>,
}

impl RegistryEntries {
    fn upsert(&mut self, entry: HostedEntry) {
        if self.entries.insert(entry.identifier, entry.clone()).is_none() {
            self.order.push(entry.identifier);
        }
    }

    fn remove(&mut self, identifier: &Identifier) -> Option<HostedEntry> {
        let removed = self.entries.remove(identifier)?;
        self.order.retain(|id| id != identifier);
        Some(removed)
    }

    fn list(&self) -> Vec<HostedEntry> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }
}

/// Owns which keys are hosted and keeps the index and the store in step.
///
/// Mutations go through a single async writer lock so the index, the store
/// and the in-memory view never disagree about an entry.
pub struct SourceRegistry {
    store: Arc<dyn SourceStore>,
    index: Arc<dyn KeysetIndex>,
    linker: LinkerHandle,
    entries: RwLock<RegistryEntries>,
    writer: Mutex<()>,
    ready: OnceCell<()>,
}

impl SourceRegistry {
    pub fn new(
        store: Arc<dyn SourceStore>,
        index: Arc<dyn KeysetIndex>,
        linker: LinkerHandle,
    ) -> Self {
        Self {
            store,
            index,
            linker,
            entries: RwLock::new(RegistryEntries::default()),
            writer: Mutex::new(()),
            ready: OnceCell::new(),
        }
    }

    /// The registry's own identity, root of the hosting topology.
    pub fn root(&self) -> Identifier {
        self.index.root()
    }

    /// Load the persisted entries and start hosting them.
    ///
    /// Runs once; concurrent and later callers wait for the same load.
    pub async fn ready(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                let _guard = self.writer.lock().await;
                let root = self.index.root();
                self.store
                    .host(root, true)
                    .await
                    .map_err(|source| RehostError::AddFailed { key: root, source })?;

                let persisted = self.index.load()?;
                let count = persisted.len();
                for entry in persisted {
                    let key = entry.identifier;
                    self.store
                        .host(key, entry.announce)
                        .await
                        .map_err(|source| RehostError::AddFailed { key, source })?;
                    self.entries.write().upsert(entry);
                    self.linker.observe(key);
                }

                info!("Registry {} ready with {} keys", root, count);
                Ok::<(), RehostError>(())
            })
            .await?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Start hosting `identifier`. Adding an existing key only updates its info.
    pub async fn add(&self, identifier: Identifier, info: Option<String>) -> Result<()> {
        self.ready().await?;
        let _guard = self.writer.lock().await;

        let previous = self.entries.read().entries.get(&identifier).cloned();
        let entry = HostedEntry::new(identifier, info);
        self.index
            .put(&entry)
            .map_err(|source| RehostError::AddFailed {
                key: identifier,
                source,
            })?;

        if let Err(source) = self.store.host(identifier, true).await {
            self.restore_index(identifier, previous);
            return Err(RehostError::AddFailed {
                key: identifier,
                source,
            });
        }

        self.entries.write().upsert(entry);
        self.linker.observe(identifier);
        info!("Added key {}", identifier);
        Ok(())
    }

    /// Stop hosting `identifier`. Unknown keys are ignored.
    pub async fn remove(&self, identifier: Identifier) -> Result<()> {
        self.ready().await?;
        let _guard = self.writer.lock().await;

        let Some(previous) = self.entries.read().entries.get(&identifier).cloned() else {
            debug!("Not removing {}: not hosted", identifier);
            return Ok(());
        };

        self.index
            .delete(&identifier)
            .map_err(|source| RehostError::RemoveFailed {
                key: identifier,
                source,
            })?;

        if let Err(source) = self.store.unhost(identifier).await {
            self.restore_index(identifier, Some(previous));
            return Err(RehostError::RemoveFailed {
                key: identifier,
                source,
            });
        }

        self.entries.write().remove(&identifier);
        info!("Removed key {}", identifier);
        Ok(())
    }

    fn restore_index(&self, identifier: Identifier, previous: Option<HostedEntry>) {
        let restored = match previous {
            Some(entry) => self.index.put(&entry),
            None => self.index.delete(&identifier).map(|_| ()),
        };
        if let Err(err) = restored {
            warn!("Could not restore index entry for {}: {}", identifier, err);
        }
    }

    /// Snapshot of hosted entries in insertion order.
    pub fn list(&self) -> Vec<HostedEntry> {
        self.entries.read().list()
    }

    pub fn get(&self, identifier: &Identifier) -> Option<HostedEntry> {
        self.entries.read().entries.get(identifier).cloned()
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.entries.read().entries.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<()> {
        self.index.flush()?;
        Ok(())
    }
}
