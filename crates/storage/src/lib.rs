//! Rehost storage layer
//!
//! - `store`: the capability the core calls into to replicate sources, and
//!   the events the replication layer emits
//! - `memory`: an in-process [`SourceStore`] used for local mode and tests
//! - `index`: the registry's own durable, insertion-ordered key index
//! - `stats`: swarm connection counters shared with whoever reports them

pub mod index;
pub mod memory;
pub mod stats;
pub mod store;

pub use index::{IndexRecord, KeysetIndex, MemoryKeysetIndex, SledKeysetIndex};
pub use memory::MemorySourceStore;
pub use stats::{SwarmStats, SwarmStatsSnapshot};
pub use store::{SourceStore, StoreEvent};

use rehost_types::Identifier;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Source {0} is unavailable: {1}")]
    Unavailable(Identifier, String),
    #[error("Store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;
