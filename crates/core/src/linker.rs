//! Secondary-source linker.
//!
//! Every source the registry adds, re-hosts at startup, or that the store
//! reports as opened is queued here. A task per source waits for its first
//! block, decodes the header and records the result in the [`LinkTable`].
//! The registry root and sources opened as a container's secondary carry no
//! header and are never queued.
//! Linking is best-effort: it never blocks the caller that queued the source
//! and a source that never produces a header only costs a warning.

use crate::errors::RehostError;
use crate::links::LinkTable;
use rehost_storage::{SourceStore, StoreEvent};
use rehost_types::{Identifier, SourceKind};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// How long a single attempt waits for the first block.
    pub link_timeout: Duration,
    /// Attempts before giving up on a source until it is observed again.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            link_timeout: Duration::from_secs(30),
            attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Queues sources for linking.
#[derive(Debug, Clone)]
pub struct LinkerHandle {
    tx: mpsc::UnboundedSender<Identifier>,
}

impl LinkerHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<Identifier>) -> Self {
        Self { tx }
    }

    pub fn observe(&self, identifier: Identifier) {
        if self.tx.send(identifier).is_err() {
            debug!("Linker stopped, not linking {}", identifier);
        }
    }
}

pub struct Linker {
    store: Arc<dyn SourceStore>,
    links: Arc<LinkTable>,
    root: Identifier,
    config: LinkerConfig,
    queue: mpsc::UnboundedReceiver<Identifier>,
    events: broadcast::Receiver<StoreEvent>,
    in_flight: HashSet<Identifier>,
    tasks: JoinSet<Identifier>,
}

impl Linker {
    /// Build a linker and the handle feeding it. Subscribes to store events
    /// immediately so nothing opened before [`Linker::run`] starts is missed.
    pub fn new(
        store: Arc<dyn SourceStore>,
        links: Arc<LinkTable>,
        root: Identifier,
        config: LinkerConfig,
    ) -> (Self, LinkerHandle) {
        let (tx, queue) = mpsc::unbounded_channel();
        let events = store.subscribe();
        let linker = Self {
            store,
            links,
            root,
            config,
            queue,
            events,
            in_flight: HashSet::new(),
            tasks: JoinSet::new(),
        };
        (linker, LinkerHandle { tx })
    }

    /// Process queued sources until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                queued = self.queue.recv() => match queued {
                    Some(identifier) => self.schedule(identifier),
                    None => break,
                },
                event = self.events.recv(), if events_open => match event {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Linker missed {} store events", skipped);
                    }
                    Err(RecvError::Closed) => events_open = false,
                },
                Some(finished) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match finished {
                        Ok(identifier) => {
                            self.in_flight.remove(&identifier);
                        }
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => warn!("Link task failed: {err:?}"),
                    }
                }
            }
        }

        self.tasks.abort_all();
        debug!("Linker stopped with {} tasks in flight", self.in_flight.len());
    }

    fn on_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::SourceOpened {
                identifier,
                secondary_of: None,
            } => self.schedule(identifier),
            StoreEvent::SourceOpened {
                identifier,
                secondary_of: Some(owner),
            } => debug!("Not linking {}: opened as secondary of {}", identifier, owner),
            StoreEvent::ConnectionOpened { .. } | StoreEvent::ConnectionClosed { .. } => {}
        }
    }

    fn schedule(&mut self, identifier: Identifier) {
        if identifier == self.root
            || self.links.is_resolved(&identifier)
            || self.links.owner_of(&identifier).is_some()
        {
            return;
        }
        if !self.in_flight.insert(identifier) {
            return;
        }

        let store = self.store.clone();
        let links = self.links.clone();
        let config = self.config.clone();
        self.tasks.spawn(async move {
            match link_source(store.as_ref(), &links, &config, identifier).await {
                Ok(_) => {}
                Err(err @ RehostError::LinkTimeout { .. }) => warn!("{err}"),
                Err(err) => debug!("Could not link {}: {}", identifier, err),
            }
            identifier
        });
    }
}

/// Wait for the header of `identifier` and record its kind, retrying a
/// bounded number of times on timeout.
pub async fn link_source(
    store: &dyn SourceStore,
    links: &LinkTable,
    config: &LinkerConfig,
    identifier: Identifier,
) -> Result<SourceKind, RehostError> {
    for attempt in 1..=config.attempts {
        match timeout(config.link_timeout, store.first_block(identifier)).await {
            Ok(Ok(block)) => {
                let kind = SourceKind::from_header(&block);
                links.record(identifier, kind);
                match kind.secondary() {
                    Some(secondary) => {
                        info!("Linked {} as secondary of {}", secondary, identifier)
                    }
                    None => debug!("Resolved {} as {:?}", identifier, kind),
                }
                return Ok(kind);
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                debug!(
                    "Timed out waiting for the header of {} (attempt {}/{})",
                    identifier, attempt, config.attempts
                );
                if attempt < config.attempts {
                    sleep(config.retry_delay).await;
                }
            }
        }
    }

    Err(RehostError::LinkTimeout {
        key: identifier,
        attempts: config.attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rehost_storage::MemorySourceStore;

    fn id(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    fn quick_config() -> LinkerConfig {
        LinkerConfig {
            link_timeout: Duration::from_millis(20),
            attempts: 2,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn link_source_records_container_owner() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        store.write_header(id(1), SourceKind::Container { secondary: id(2) });

        let kind = link_source(&store, &links, &quick_config(), id(1))
            .await
            .unwrap();
        assert_eq!(kind, SourceKind::Container { secondary: id(2) });
        assert_eq!(links.owner_of(&id(2)), Some(id(1)));
    }

    #[tokio::test]
    async fn link_source_gives_up_after_bounded_attempts() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();

        let err = link_source(&store, &links, &quick_config(), id(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RehostError::LinkTimeout { attempts: 2, .. }));
        assert!(!links.is_resolved(&id(1)));
    }

    #[tokio::test]
    async fn linker_links_observed_sources_in_background() {
        let store = Arc::new(MemorySourceStore::new());
        let links = Arc::new(LinkTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (linker, handle) = Linker::new(store.clone(), links.clone(), id(0), quick_config());
        let task = tokio::spawn(linker.run(shutdown_rx));

        handle.observe(id(1));
        store.write_header(id(1), SourceKind::Container { secondary: id(2) });

        timeout(Duration::from_secs(2), async {
            while links.owner_of(&id(2)).is_none() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("link should resolve");

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn root_and_known_secondaries_are_not_scheduled() {
        let store = Arc::new(MemorySourceStore::new());
        let links = Arc::new(LinkTable::new());
        let (mut linker, _handle) = Linker::new(store, links.clone(), id(0), quick_config());

        linker.schedule(id(0));
        assert!(linker.tasks.is_empty());

        links.record(id(1), SourceKind::Container { secondary: id(2) });
        linker.schedule(id(2));
        assert!(linker.tasks.is_empty());

        linker.schedule(id(3));
        linker.schedule(id(3));
        assert_eq!(linker.tasks.len(), 1);
        linker.tasks.abort_all();
    }

    #[tokio::test]
    async fn secondaries_opened_by_the_store_are_not_scheduled() {
        let store = Arc::new(MemorySourceStore::new());
        let links = Arc::new(LinkTable::new());
        let (mut linker, _handle) = Linker::new(store, links, id(0), quick_config());

        linker.on_event(StoreEvent::SourceOpened {
            identifier: id(0),
            secondary_of: None,
        });
        linker.on_event(StoreEvent::SourceOpened {
            identifier: id(2),
            secondary_of: Some(id(1)),
        });
        assert!(linker.tasks.is_empty());

        linker.on_event(StoreEvent::SourceOpened {
            identifier: id(1),
            secondary_of: None,
        });
        assert_eq!(linker.tasks.len(), 1);
        linker.tasks.abort_all();
    }

    #[tokio::test]
    async fn linker_reacts_to_opened_sources() {
        let store = Arc::new(MemorySourceStore::new());
        let links = Arc::new(LinkTable::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (linker, _handle) = Linker::new(store.clone(), links.clone(), id(0), quick_config());
        let task = tokio::spawn(linker.run(shutdown_rx));

        store.write_header(id(5), SourceKind::Keyset);
        store.host(id(5), true).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while !links.is_resolved(&id(5)) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("opened source should be linked");
        assert_eq!(links.kind(&id(5)), Some(SourceKind::Keyset));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
