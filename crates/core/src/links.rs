//! What the linker has learned about each source's header.

use parking_lot::RwLock;
use rehost_types::{Identifier, SourceKind};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct LinkTableInner {
    kinds: HashMap<Identifier, SourceKind>,
    /// secondary -> owning container
    owners: HashMap<Identifier, Identifier>,
}

/// Decoded source kinds and secondary ownership.
///
/// Written only by the linker, read by the walker and for naming sources in
/// logs. All writes are keyed upserts, so recording the same header twice is
/// harmless.
#[derive(Debug, Default)]
pub struct LinkTable {
    inner: RwLock<LinkTableInner>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, identifier: Identifier, kind: SourceKind) {
        let mut inner = self.inner.write();
        if let Some(SourceKind::Container { secondary }) = inner.kinds.insert(identifier, kind) {
            // The header changed; drop the stale ownership edge.
            if kind.secondary() != Some(secondary) {
                inner.owners.remove(&secondary);
            }
        }
        if let Some(secondary) = kind.secondary() {
            inner.owners.insert(secondary, identifier);
        }
    }

    pub fn kind(&self, identifier: &Identifier) -> Option<SourceKind> {
        self.inner.read().kinds.get(identifier).copied()
    }

    pub fn is_resolved(&self, identifier: &Identifier) -> bool {
        self.inner.read().kinds.contains_key(identifier)
    }

    pub fn secondary_of(&self, identifier: &Identifier) -> Option<Identifier> {
        self.kind(identifier).and_then(|kind| kind.secondary())
    }

    pub fn owner_of(&self, identifier: &Identifier) -> Option<Identifier> {
        self.inner.read().owners.get(identifier).copied()
    }

    /// Human-readable name: the hex key, plus its owner once linked.
    pub fn describe(&self, identifier: &Identifier) -> String {
        match self.owner_of(identifier) {
            Some(owner) => format!("{identifier} (secondary of {owner})"),
            None => identifier.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
