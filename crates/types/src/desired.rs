//! Declared-state documents.
//!
//! A declared-state document is a JSON object mapping hex identifiers to
//! `{ "info"?: string }`. It fully describes which keys should be hosted.

use crate::identifier::{Identifier, IdentifierError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DesiredStateError {
    #[error("document is not a JSON object of key -> {{info}}: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("document key {key:?} is not a valid identifier: {source}")]
    InvalidKey {
        key: String,
        #[source]
        source: IdentifierError,
    },

    #[error("document lists {key} more than once")]
    DuplicateKey { key: Identifier },
}

/// Per-key settings in a declared-state document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

impl DesiredEntry {
    pub fn with_info(info: impl Into<String>) -> Self {
        Self {
            info: Some(info.into()),
        }
    }
}

/// The full desired key-set, ordered by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    entries: BTreeMap<Identifier, DesiredEntry>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a declared-state document, validating every key.
    pub fn from_json(raw: &str) -> Result<Self, DesiredStateError> {
        let document: BTreeMap<String, DesiredEntry> = serde_json::from_str(raw)?;
        let mut entries = BTreeMap::new();
        for (key, entry) in document {
            let identifier = Identifier::from_hex(&key)
                .map_err(|source| DesiredStateError::InvalidKey { key, source })?;
            // Keys differing only in hex case name the same identifier.
            if entries.insert(identifier, entry).is_some() {
                return Err(DesiredStateError::DuplicateKey { key: identifier });
            }
        }
        Ok(Self { entries })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(id, entry)| {
                (
                    id.to_hex(),
                    serde_json::to_value(entry).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn insert(&mut self, identifier: Identifier, entry: DesiredEntry) {
        self.entries.insert(identifier, entry);
    }

    pub fn get(&self, identifier: &Identifier) -> Option<&DesiredEntry> {
        self.entries.get(identifier)
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.entries.contains_key(identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Identifier, &DesiredEntry)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Identifier> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(Identifier, DesiredEntry)> for DesiredState {
    fn from_iter<T: IntoIterator<Item = (Identifier, DesiredEntry)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
