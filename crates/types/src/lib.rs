//! Rehost shared types
//!
//! Identifiers for content-addressed sources, the records the registry keeps
//! about them, the live replication state reported by the store, and the
//! declared-state document an operator uses to describe what should be hosted.

pub mod desired;
pub mod entry;
pub mod header;
pub mod identifier;

pub use desired::{DesiredEntry, DesiredState, DesiredStateError};
pub use entry::{HostedEntry, KeyInfo, SourceState};
pub use header::SourceKind;
pub use identifier::{DiscoveryKey, Identifier, IdentifierError, IDENTIFIER_HEX_LEN, IDENTIFIER_LEN};
