//! Deduplicated traversal of the hosting topology.
//!
//! The topology is rooted at the registry's own identity. The root's children
//! are the registry entries; a keyset source's children are the entries it
//! lists; a container has one secondary edge. Sources can be shared between
//! keysets and keysets can list each other, so the graph may contain cycles.

use crate::links::LinkTable;
use rehost_storage::SourceStore;
use rehost_types::{HostedEntry, Identifier, SourceKind, SourceState};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// One source as seen by a walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyNode {
    pub identifier: Identifier,
    pub announce: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    /// Container this source is the secondary of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Identifier>,
    pub depth: usize,
    pub state: SourceState,
}

struct Pending {
    identifier: Identifier,
    announce: bool,
    info: Option<String>,
    parent: Option<Identifier>,
    owner: Option<Identifier>,
    depth: usize,
}

impl Pending {
    fn child_of(entry: HostedEntry, parent: Identifier, depth: usize) -> Self {
        Self {
            identifier: entry.identifier,
            announce: entry.announce,
            info: entry.info,
            parent: Some(parent),
            owner: None,
            depth,
        }
    }
}

/// Walk everything reachable from `root`, visiting each source once.
///
/// `entries` are the root's children. The root is always the first node, with
/// a zeroed state when the store has none for it. Sources the store no longer
/// reports are left out. Sources the store replicates but no edge reaches yet,
/// such as a secondary whose container has not been linked, come last as
/// replicated-only nodes without a parent.
pub async fn walk(
    store: &dyn SourceStore,
    links: &LinkTable,
    root: Identifier,
    entries: Vec<HostedEntry>,
) -> Vec<TopologyNode> {
    let root_state = match store.state(root).await {
        Ok(Some(state)) => state,
        Ok(None) => SourceState::empty(root),
        Err(err) => {
            debug!("No state for root {}: {}", root, err);
            SourceState::empty(root)
        }
    };

    let mut nodes = vec![TopologyNode {
        identifier: root,
        announce: true,
        info: None,
        owner: None,
        parent: None,
        depth: 0,
        state: root_state,
    }];
    let mut visited: HashMap<Identifier, usize> = HashMap::from([(root, 0)]);
    let mut queue: VecDeque<Pending> = entries
        .into_iter()
        .map(|entry| Pending::child_of(entry, root, 1))
        .collect();

    while let Some(pending) = queue.pop_front() {
        if let Some(&index) = visited.get(&pending.identifier) {
            if pending.announce && !nodes[index].announce {
                nodes[index].announce = true;
            }
            continue;
        }

        let identifier = pending.identifier;
        let state = match store.state(identifier).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!("Skipping {}: not open in the store", links.describe(&identifier));
                continue;
            }
            Err(err) => {
                debug!("Skipping {}: {}", links.describe(&identifier), err);
                continue;
            }
        };

        visited.insert(identifier, nodes.len());
        nodes.push(TopologyNode {
            identifier,
            announce: pending.announce,
            info: pending.info,
            owner: pending.owner.or_else(|| links.owner_of(&identifier)),
            parent: pending.parent,
            depth: pending.depth,
            state,
        });

        let depth = pending.depth + 1;
        match links.kind(&identifier) {
            Some(SourceKind::Keyset) => match store.keyset(identifier).await {
                Ok(children) => queue.extend(
                    children
                        .into_iter()
                        .map(|entry| Pending::child_of(entry, identifier, depth)),
                ),
                Err(err) => debug!("Could not list keyset {}: {}", identifier, err),
            },
            Some(SourceKind::Container { secondary }) => queue.push_back(Pending {
                identifier: secondary,
                announce: false,
                info: None,
                parent: Some(identifier),
                owner: Some(identifier),
                depth,
            }),
            Some(SourceKind::Plain) | None => {}
        }
    }

    for identifier in store.open_sources() {
        if visited.contains_key(&identifier) {
            continue;
        }
        let state = match store.state(identifier).await {
            Ok(Some(state)) => state,
            Ok(None) => continue,
            Err(err) => {
                debug!("Skipping {}: {}", links.describe(&identifier), err);
                continue;
            }
        };
        debug!("Found unlinked source {}", links.describe(&identifier));
        visited.insert(identifier, nodes.len());
        nodes.push(TopologyNode {
            identifier,
            announce: false,
            info: None,
            owner: links.owner_of(&identifier),
            parent: None,
            depth: 1,
            state,
        });
    }

    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rehost_storage::MemorySourceStore;

    fn id(byte: u8) -> Identifier {
        Identifier::from_bytes([byte; 32])
    }

    async fn hosted(store: &MemorySourceStore, ids: &[u8]) {
        for byte in ids {
            store.host(id(*byte), true).await.unwrap();
        }
    }

    #[tokio::test]
    async fn root_is_always_present() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();

        let nodes = walk(&store, &links, id(0), vec![]).await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].identifier, id(0));
        assert!(nodes[0].announce);
        assert_eq!(nodes[0].state, SourceState::empty(id(0)));
    }

    #[tokio::test]
    async fn cycles_are_visited_once() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0, 1, 2]).await;

        // 1 lists 2, 2 lists 1 and the root.
        links.record(id(1), SourceKind::Keyset);
        links.record(id(2), SourceKind::Keyset);
        store.set_keyset(id(1), vec![HostedEntry::new(id(2), None)]);
        store.set_keyset(
            id(2),
            vec![HostedEntry::new(id(1), None), HostedEntry::new(id(0), None)],
        );

        let nodes = walk(&store, &links, id(0), vec![HostedEntry::new(id(1), None)]).await;
        let ids: Vec<_> = nodes.iter().map(|n| n.identifier).collect();
        assert_eq!(ids, vec![id(0), id(1), id(2)]);
        assert_eq!(nodes[2].parent, Some(id(1)));
        assert_eq!(nodes[2].depth, 2);
    }

    #[tokio::test]
    async fn shared_secondary_is_counted_once() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0, 1, 2, 9]).await;
        store.set_progress(id(9), 4, 4, 1000);

        links.record(id(1), SourceKind::Container { secondary: id(9) });
        links.record(id(2), SourceKind::Container { secondary: id(9) });

        let nodes = walk(
            &store,
            &links,
            id(0),
            vec![HostedEntry::new(id(1), None), HostedEntry::new(id(2), None)],
        )
        .await;

        let secondaries: Vec<_> = nodes.iter().filter(|n| n.identifier == id(9)).collect();
        assert_eq!(secondaries.len(), 1);
        assert!(!secondaries[0].announce);
        assert!(secondaries[0].owner.is_some());
        let total: u64 = nodes.iter().map(|n| n.state.byte_size).sum();
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn replicated_only_node_is_upgraded_when_announced_later() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0, 1, 5]).await;

        // 5 is first reached as the secondary of 1, then listed directly.
        links.record(id(1), SourceKind::Container { secondary: id(5) });
        let nodes = walk(
            &store,
            &links,
            id(0),
            vec![HostedEntry::new(id(1), None), HostedEntry::new(id(5), None)],
        )
        .await;

        let node = nodes.iter().find(|n| n.identifier == id(5)).unwrap();
        assert!(node.announce);
        assert_eq!(nodes.iter().filter(|n| n.identifier == id(5)).count(), 1);
    }

    #[tokio::test]
    async fn unlinked_secondary_is_reported_raw_then_under_its_owner() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0, 1]).await;
        store.write_header(id(1), SourceKind::Container { secondary: id(5) });
        let entries = vec![HostedEntry::new(id(1), None)];

        // The store already replicates 5; the link table knows nothing yet.
        let nodes = walk(&store, &links, id(0), entries.clone()).await;
        let node = nodes.iter().find(|n| n.identifier == id(5)).unwrap();
        assert!(!node.announce);
        assert_eq!((node.owner, node.parent), (None, None));
        assert_eq!(links.describe(&id(5)), id(5).to_hex());

        links.record(id(1), SourceKind::Container { secondary: id(5) });
        let nodes = walk(&store, &links, id(0), entries).await;
        assert_eq!(nodes.iter().filter(|n| n.identifier == id(5)).count(), 1);
        let node = nodes.iter().find(|n| n.identifier == id(5)).unwrap();
        assert_eq!((node.owner, node.parent), (Some(id(1)), Some(id(1))));
        assert_eq!(node.depth, 2);
    }

    #[tokio::test]
    async fn keyset_children_opened_by_the_store_are_walked() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0]).await;
        store.set_keyset(id(1), vec![HostedEntry::replicated_only(id(2))]);
        store.write_header(id(1), SourceKind::Keyset);
        store.host(id(1), true).await.unwrap();
        links.record(id(1), SourceKind::Keyset);

        let nodes = walk(&store, &links, id(0), vec![HostedEntry::new(id(1), None)]).await;
        let child = nodes.iter().find(|n| n.identifier == id(2)).unwrap();
        assert_eq!(child.parent, Some(id(1)));
        assert!(!child.announce);
    }

    #[tokio::test]
    async fn sources_missing_from_the_store_are_skipped() {
        let store = MemorySourceStore::new();
        let links = LinkTable::new();
        hosted(&store, &[0, 1]).await;

        let nodes = walk(
            &store,
            &links,
            id(0),
            vec![HostedEntry::new(id(1), None), HostedEntry::new(id(2), None)],
        )
        .await;
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.identifier != id(2)));
    }
}
