//! Bring the registry in line with a declared key-set.

use crate::errors::{RehostError, Result};
use crate::registry::SourceRegistry;
use rehost_types::{DesiredState, DesiredStateError, Identifier};
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

/// A key the reconciler could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileFailure {
    pub key: Identifier,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub added: Vec<Identifier>,
    pub updated: Vec<Identifier>,
    pub removed: Vec<Identifier>,
    pub unchanged: usize,
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of registry operations that were performed.
    pub fn operations(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

/// Operations needed to turn the current registry into `desired`.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_remove: Vec<Identifier>,
    pub to_add: Vec<Identifier>,
    pub to_update: Vec<Identifier>,
    pub unchanged: usize,
}

pub fn plan(registry: &SourceRegistry, desired: &DesiredState) -> ReconcilePlan {
    let current = registry.list();
    let mut plan = ReconcilePlan {
        to_remove: current
            .iter()
            .map(|entry| entry.identifier)
            .filter(|identifier| !desired.contains(identifier))
            .collect(),
        ..Default::default()
    };

    for (identifier, wanted) in desired.iter() {
        match current.iter().find(|entry| entry.identifier == *identifier) {
            None => plan.to_add.push(*identifier),
            Some(entry) if entry.info != wanted.info => plan.to_update.push(*identifier),
            Some(_) => plan.unchanged += 1,
        }
    }
    plan
}

/// Apply `desired`: all removals first, then additions and info updates.
///
/// A key that fails is recorded in the outcome and the rest still proceed.
pub async fn reconcile(registry: &SourceRegistry, desired: &DesiredState) -> Result<ReconcileOutcome> {
    registry.ready().await?;
    let plan = plan(registry, desired);
    let mut outcome = ReconcileOutcome {
        unchanged: plan.unchanged,
        ..Default::default()
    };

    for identifier in plan.to_remove {
        match registry.remove(identifier).await {
            Ok(()) => outcome.removed.push(identifier),
            Err(err) => record_failure(&mut outcome, identifier, err),
        }
    }

    for (identifier, is_update) in plan
        .to_add
        .into_iter()
        .map(|id| (id, false))
        .chain(plan.to_update.into_iter().map(|id| (id, true)))
    {
        let info = desired.get(&identifier).and_then(|entry| entry.info.clone());
        match registry.add(identifier, info).await {
            Ok(()) if is_update => outcome.updated.push(identifier),
            Ok(()) => outcome.added.push(identifier),
            Err(err) => record_failure(&mut outcome, identifier, err),
        }
    }

    info!(
        "Reconciled declared state: {} added, {} updated, {} removed, {} unchanged, {} failed",
        outcome.added.len(),
        outcome.updated.len(),
        outcome.removed.len(),
        outcome.unchanged,
        outcome.failures.len()
    );
    Ok(outcome)
}

fn record_failure(outcome: &mut ReconcileOutcome, key: Identifier, err: RehostError) {
    warn!("Could not reconcile {}: {}", key, err);
    outcome.failures.push(ReconcileFailure {
        key,
        error: err.to_string(),
    });
}

/// Read and parse a declared-state document.
pub async fn load_declared_state(path: &Path) -> Result<DesiredState> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RehostError::ConfigUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

    DesiredState::from_json(&raw).map_err(|err| RehostError::ConfigMalformed {
        path: path.to_path_buf(),
        reason: match err {
            DesiredStateError::Malformed(inner) => inner.to_string(),
            other => other.to_string(),
        },
    })
}
