//! Source header decoding.
//!
//! The first block of a source declares what kind of source it is. Keysets
//! list further sources; containers pair themselves with a secondary source
//! that holds their payload.

use crate::identifier::Identifier;
use serde::{Deserialize, Serialize};

/// Kind of a source, as declared by its header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum SourceKind {
    /// No recognised header.
    Plain,
    /// A nested set of keys (another registry's index).
    Keyset,
    /// A composite entry whose payload lives in a secondary source.
    Container { secondary: Identifier },
}

impl SourceKind {
    /// Decode a header block. Anything unrecognised is a plain source.
    pub fn from_header(block: &[u8]) -> Self {
        serde_json::from_slice(block).unwrap_or(SourceKind::Plain)
    }

    /// Encode as a header block.
    pub fn to_header(&self) -> Vec<u8> {
        // Serializing a fieldless tag or a hex string cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn secondary(&self) -> Option<Identifier> {
        match self {
            SourceKind::Container { secondary } => Some(*secondary),
            _ => None,
        }
    }

    pub fn is_keyset(&self) -> bool {
        matches!(self, SourceKind::Keyset)
    }
}
