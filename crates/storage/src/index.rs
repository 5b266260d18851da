//! Durable key index backing the registry.

use crate::{Result, StoreError};
use parking_lot::RwLock;
use rehost_types::{HostedEntry, Identifier};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Persistent set of hosted entries, kept in insertion order.
pub trait KeysetIndex: Send + Sync {
    /// Identity of the registry's own root source. Stable across restarts.
    fn root(&self) -> Identifier;

    /// All entries, oldest first.
    fn load(&self) -> Result<Vec<HostedEntry>>;

    /// Insert or update an entry. Updating keeps its original position.
    fn put(&self, entry: &HostedEntry) -> Result<()>;

    /// Remove an entry; returns whether it was present.
    fn delete(&self, identifier: &Identifier) -> Result<bool>;

    fn flush(&self) -> Result<()>;
}

/// Stored value for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub seq: u64,
    pub announce: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl IndexRecord {
    fn into_entry(self, identifier: Identifier) -> HostedEntry {
        HostedEntry {
            identifier,
            announce: self.announce,
            info: self.info,
            secondary: None,
        }
    }
}

/// Sled-backed index
pub struct SledKeysetIndex {
    db: Db,
    entries: Tree,
    root: Identifier,
}

impl SledKeysetIndex {
    /// Open (or create) the index `name` in the database at `path`.
    ///
    /// A fresh index gets a random root identity which is persisted, so every
    /// later open of the same index reports the same root.
    pub fn open<P: AsRef<Path>>(path: P, name: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let entries = db.open_tree(format!("keyset:{name}"))?;
        let metadata = db.open_tree("metadata")?;

        let root_key = format!("root:{name}");
        let root = match metadata.get(root_key.as_bytes())? {
            Some(raw) => decode_identifier(&raw)?,
            None => {
                let root = Identifier::random();
                metadata.insert(root_key.as_bytes(), root.as_bytes().as_slice())?;
                metadata.flush()?;
                info!("Created keyset index {} with root {}", name, root);
                root
            }
        };

        Ok(Self { db, entries, root })
    }

    fn record(&self, identifier: &Identifier) -> Result<Option<IndexRecord>> {
        self.entries
            .get(identifier.as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }
}

impl KeysetIndex for SledKeysetIndex {
    fn root(&self) -> Identifier {
        self.root
    }

    fn load(&self) -> Result<Vec<HostedEntry>> {
        let mut records = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (key, value) = item?;
            let identifier = decode_identifier(&key)?;
            let record: IndexRecord = serde_json::from_slice(&value)?;
            records.push((identifier, record));
        }
        records.sort_by_key(|(_, record)| record.seq);
        Ok(records
            .into_iter()
            .map(|(identifier, record)| record.into_entry(identifier))
            .collect())
    }

    fn put(&self, entry: &HostedEntry) -> Result<()> {
        let seq = match self.record(&entry.identifier)? {
            Some(existing) => existing.seq,
            None => self.db.generate_id()?,
        };
        let record = IndexRecord {
            seq,
            announce: entry.announce,
            info: entry.info.clone(),
        };
        self.entries
            .insert(entry.identifier.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    fn delete(&self, identifier: &Identifier) -> Result<bool> {
        Ok(self.entries.remove(identifier.as_bytes())?.is_some())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_identifier(raw: &[u8]) -> Result<Identifier> {
    let bytes: [u8; 32] = raw.try_into().map_err(|_| {
        StoreError::Serialization(serde::de::Error::custom(format!(
            "stored identifier has {} bytes",
            raw.len()
        )))
    })?;
    Ok(Identifier::from_bytes(bytes))
}

/// Volatile index for tests and throwaway runs.
pub struct MemoryKeysetIndex {
    root: Identifier,
    inner: RwLock<MemoryIndexInner>,
}

#[derive(Default)]
struct MemoryIndexInner {
    next_seq: u64,
    records: HashMap<Identifier, IndexRecord>,
}

impl MemoryKeysetIndex {
    pub fn new() -> Self {
        Self::with_root(Identifier::random())
    }

    pub fn with_root(root: Identifier) -> Self {
        Self {
            root,
            inner: RwLock::new(MemoryIndexInner::default()),
        }
    }
}

impl Default for MemoryKeysetIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeysetIndex for MemoryKeysetIndex {
    fn root(&self) -> Identifier {
        self.root
    }

    fn load(&self) -> Result<Vec<HostedEntry>> {
        let inner = self.inner.read();
        let mut records: Vec<_> = inner.records.iter().collect();
        records.sort_by_key(|(_, record)| record.seq);
        Ok(records
            .into_iter()
            .map(|(identifier, record)| record.clone().into_entry(*identifier))
            .collect())
    }

    fn put(&self, entry: &HostedEntry) -> Result<()> {
        let mut inner = self.inner.write();
        let seq = match inner.records.get(&entry.identifier) {
            Some(existing) => existing.seq,
            None => {
                inner.next_seq += 1;
                inner.next_seq
            }
        };
        inner.records.insert(
            entry.identifier,
            IndexRecord {
                seq,
                announce: entry.announce,
                info: entry.info.clone(),
            },
        );
        Ok(())
    }

    fn delete(&self, identifier: &Identifier) -> Result<bool> {
        Ok(self.inner.write().records.remove(identifier).is_some())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
