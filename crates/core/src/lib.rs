//! Rehost core
//!
//! Keeps a declared set of keys hosted, follows the topology those keys open
//! up (nested keysets and container secondaries) and reports on it.
//!
//! - `registry`: the hosted key-set, persisted through a [`KeysetIndex`]
//! - `linker` / `links`: background header decoding and secondary ownership
//! - `walker`: deduplicated traversal of the hosting topology
//! - `reconciler`: remove-then-add sync against a declared document
//! - `report`: inventory text and aggregate metrics from one walk
//! - `monitor`: swarm connection counting and logging

pub mod errors;
pub mod linker;
pub mod links;
pub mod monitor;
pub mod reconciler;
pub mod registry;
pub mod report;
pub mod walker;

pub use errors::{RehostError, Result};
pub use linker::{Linker, LinkerConfig, LinkerHandle};
pub use links::LinkTable;
pub use reconciler::{load_declared_state, ReconcileFailure, ReconcileOutcome, ReconcilePlan};
pub use registry::SourceRegistry;
pub use report::{Inventory, RehostMetrics};
pub use walker::TopologyNode;

use parking_lot::Mutex;
use rehost_storage::{KeysetIndex, SourceStore, SwarmStats};
use rehost_types::{DesiredState, HostedEntry, Identifier};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct RehosterConfig {
    pub linker: LinkerConfig,
}

/// Entry point tying the registry, linker, walker and reporter together.
///
/// Must be created inside a tokio runtime: construction spawns the linker and
/// the swarm monitor, both stopped by [`Rehoster::close`].
pub struct Rehoster {
    registry: SourceRegistry,
    store: Arc<dyn SourceStore>,
    links: Arc<LinkTable>,
    stats: Arc<SwarmStats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Rehoster {
    pub fn new(
        store: Arc<dyn SourceStore>,
        index: Arc<dyn KeysetIndex>,
        stats: Arc<SwarmStats>,
        config: RehosterConfig,
    ) -> Self {
        let links = Arc::new(LinkTable::new());
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (linker, handle) =
            Linker::new(store.clone(), links.clone(), index.root(), config.linker);
        let monitor = monitor::run_swarm_monitor(
            store.clone(),
            links.clone(),
            stats.clone(),
            store.subscribe(),
            shutdown_rx.clone(),
        );
        let tasks = vec![
            tokio::spawn(linker.run(shutdown_rx)),
            tokio::spawn(monitor),
        ];

        Self {
            registry: SourceRegistry::new(store.clone(), index, handle),
            store,
            links,
            stats,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn root(&self) -> Identifier {
        self.registry.root()
    }

    pub async fn ready(&self) -> Result<()> {
        self.registry.ready().await
    }

    pub async fn add(&self, identifier: Identifier, info: Option<String>) -> Result<()> {
        self.registry.add(identifier, info).await
    }

    pub async fn remove(&self, identifier: Identifier) -> Result<()> {
        self.registry.remove(identifier).await
    }

    /// Hosted entries in insertion order, with linked secondaries filled in.
    pub fn list(&self) -> Vec<HostedEntry> {
        self.registry
            .list()
            .into_iter()
            .map(|mut entry| {
                entry.secondary = self.links.secondary_of(&entry.identifier);
                entry
            })
            .collect()
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.registry.contains(identifier)
    }

    pub fn describe(&self, identifier: &Identifier) -> String {
        self.links.describe(identifier)
    }

    pub async fn walk(&self) -> Vec<TopologyNode> {
        walker::walk(
            self.store.as_ref(),
            &self.links,
            self.registry.root(),
            self.registry.list(),
        )
        .await
    }

    pub async fn inventory(&self) -> Inventory {
        Inventory::new(self.walk().await, self.stats.active_connections())
    }

    pub async fn reconcile(&self, desired: &DesiredState) -> Result<ReconcileOutcome> {
        reconciler::reconcile(&self.registry, desired).await
    }

    /// Load the declared-state document at `path` and reconcile against it.
    pub async fn sync_from_path(&self, path: &Path) -> Result<ReconcileOutcome> {
        let desired = load_declared_state(path).await?;
        self.reconcile(&desired).await
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn stats(&self) -> &SwarmStats {
        &self.stats
    }

    /// Stop background tasks, close the store and flush the index.
    pub async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!("Background task ended abnormally: {err}");
            }
        }

        self.store.close().await?;
        self.registry.flush()?;
        info!("Rehoster closed");
        Ok(())
    }
}
