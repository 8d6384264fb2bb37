//! One reconciliation pass: snapshot, detect, propagate, apply.
//!
//! Ordering per pass:
//! 1. bail out if a local operation is inside its cooldown;
//! 2. snapshot both sources concurrently and expand the gateway record;
//! 3. diff against the catalog;
//! 4. with auto-apply off, report the events and stop;
//! 5. recheck the guard, since a local operation may have started while
//!    snapshotting;
//! 6. propagate container-side additions into the internal state;
//! 7. apply all events to the catalog in one transaction.
//!
//! Per-event failures are collected in the result. Only catalog read and
//! write failures abort the pass.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Catalog, Entries};
use crate::detector::{ChangeDetector, apply_event};
use crate::error::SyncError;
use crate::gateway::GatewayExpander;
use crate::guard::OperationGuard;
use crate::model::{ChangeEvent, ChangeKind, ServerRecord, Snapshot, SourceKind};
use crate::source::{SourceMutator, SourceSnapshotter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    /// Write detected events to the catalog. Off means detect-only.
    pub auto_apply: bool,
    /// Add container-side servers to the internal state.
    pub propagate: bool,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            auto_apply: true,
            propagate: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    RecentLocalOperation,
    SourcesUnavailable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::RecentLocalOperation => "recent-local-operation",
            SkipReason::SourcesUnavailable => "sources-unavailable",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureStage {
    Propagation,
    Catalog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFailure {
    pub event: ChangeEvent,
    pub stage: FailureStage,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub run_id: Uuid,
    /// Events written to the catalog.
    pub applied: Vec<ChangeEvent>,
    /// Events detected but not written (auto-apply off).
    pub pending: Vec<ChangeEvent>,
    pub failed: Vec<EventFailure>,
    /// Names added to the internal state during this pass.
    pub propagated: Vec<String>,
    /// Catalog-only entries that took an external source as their origin.
    pub adopted: Vec<String>,
    pub skipped_reason: Option<SkipReason>,
    pub skipped_sources: Vec<SourceKind>,
}

impl ReconciliationResult {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            applied: Vec::new(),
            pending: Vec::new(),
            failed: Vec::new(),
            propagated: Vec::new(),
            adopted: Vec::new(),
            skipped_reason: None,
            skipped_sources: Vec::new(),
        }
    }

    fn skipped(run_id: Uuid, reason: SkipReason, sources: Vec<SourceKind>) -> Self {
        Self {
            skipped_reason: Some(reason),
            skipped_sources: sources,
            ..Self::new(run_id)
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped_reason.is_some()
    }

    /// Every event the pass detected, whether or not it was written.
    pub fn detected(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.applied
            .iter()
            .chain(self.pending.iter())
            .chain(self.failed.iter().map(|f| &f.event))
    }
}

struct ApplyOutcome {
    applied: Vec<ChangeEvent>,
    failed: Vec<EventFailure>,
    adopted: Vec<String>,
}

/// Apply `events` in order, then refresh `last_seen` for every observed
/// entry and let catalog-only entries adopt the source that reports them.
fn apply_events(
    entries: &mut Entries,
    events: &[ChangeEvent],
    observed: &BTreeMap<String, ServerRecord>,
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome {
        applied: Vec::new(),
        failed: Vec::new(),
        adopted: Vec::new(),
    };
    for event in events {
        match apply_event(entries, event) {
            Ok(()) => outcome.applied.push(event.clone()),
            Err(err) => outcome.failed.push(EventFailure {
                event: event.clone(),
                stage: FailureStage::Catalog,
                reason: err.to_string(),
            }),
        }
    }
    for (name, record) in observed {
        let Some(entry) = entries.get_mut(name) else {
            continue;
        };
        entry.last_seen = record.last_seen;
        if entry.origin_source == SourceKind::CatalogOnly {
            entry.origin_source = record.source;
            outcome.adopted.push(name.clone());
        }
    }
    outcome
}

pub struct ReconciliationEngine {
    snapshotter: SourceSnapshotter,
    expander: GatewayExpander,
    detector: ChangeDetector,
    mutator: Arc<SourceMutator>,
    catalog: Arc<Catalog>,
    guard: Arc<OperationGuard>,
}

impl ReconciliationEngine {
    pub fn new(
        snapshotter: SourceSnapshotter,
        expander: GatewayExpander,
        detector: ChangeDetector,
        mutator: Arc<SourceMutator>,
        catalog: Arc<Catalog>,
        guard: Arc<OperationGuard>,
    ) -> Self {
        Self {
            snapshotter,
            expander,
            detector,
            mutator,
            catalog,
            guard,
        }
    }

    /// Snapshot both external sources concurrently. The internal-state
    /// snapshot comes back with its gateway record expanded.
    pub async fn snapshot_sources(&self) -> BTreeMap<SourceKind, Snapshot> {
        let (internal, container) = tokio::join!(
            self.snapshotter.snapshot(SourceKind::InternalState),
            self.snapshotter.snapshot(SourceKind::ContainerRuntime),
        );
        let internal = internal.map_records(|records| self.expander.expand(records));
        BTreeMap::from([
            (SourceKind::InternalState, internal),
            (SourceKind::ContainerRuntime, container),
        ])
    }

    pub async fn reconcile(
        &self,
        policy: ReconcilePolicy,
    ) -> Result<ReconciliationResult, SyncError> {
        self.reconcile_unless(policy, &CancellationToken::new()).await
    }

    /// [`ReconciliationEngine::reconcile`] whose catalog write is dropped
    /// once `abandon` is cancelled.
    pub async fn reconcile_unless(
        &self,
        policy: ReconcilePolicy,
        abandon: &CancellationToken,
    ) -> Result<ReconciliationResult, SyncError> {
        let run_id = Uuid::new_v4();
        if !self.guard.is_sync_safe() {
            tracing::debug!(%run_id, "skipping reconciliation: recent local operation");
            return Ok(ReconciliationResult::skipped(
                run_id,
                SkipReason::RecentLocalOperation,
                Vec::new(),
            ));
        }

        let started = self.guard.now();
        let snapshots = self.snapshot_sources().await;
        let skipped_sources: Vec<SourceKind> = snapshots
            .iter()
            .filter(|(_, s)| !s.is_valid())
            .map(|(k, _)| *k)
            .collect();
        if skipped_sources.len() == snapshots.len() {
            tracing::warn!(%run_id, "no source could be read; nothing to reconcile");
            return Ok(ReconciliationResult::skipped(
                run_id,
                SkipReason::SourcesUnavailable,
                skipped_sources,
            ));
        }

        let catalog = self.catalog.read().await?;
        let detection = self.detector.detect(&snapshots, &catalog, Utc::now());
        let mut result = ReconciliationResult::new(run_id);
        result.skipped_sources = detection.skipped_sources.clone();

        if !policy.auto_apply {
            if !detection.events.is_empty() {
                tracing::info!(%run_id, pending = detection.events.len(), "changes detected");
            }
            result.pending = detection.events;
            return Ok(result);
        }

        if !self.guard.quiet_since(started) {
            tracing::debug!(%run_id, "local operation started mid-pass; discarding detection");
            return Ok(ReconciliationResult::skipped(
                run_id,
                SkipReason::RecentLocalOperation,
                result.skipped_sources,
            ));
        }

        if policy.propagate {
            let internal = snapshots.get(&SourceKind::InternalState);
            for event in detection.events.iter().filter(|e| needs_propagation(e)) {
                match self.propagate(event, internal).await {
                    Ok(true) => result.propagated.push(event.name.clone()),
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(
                            %run_id,
                            name = %event.name,
                            error = %err,
                            "propagation failed"
                        );
                        result.failed.push(EventFailure {
                            event: event.clone(),
                            stage: FailureStage::Propagation,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        let events = detection.events;
        let observed = detection.external;
        let outcome = self
            .catalog
            .update_unless(abandon, |entries| apply_events(entries, &events, &observed))
            .await?;
        for failure in &outcome.failed {
            tracing::warn!(
                %run_id,
                event = %failure.event,
                reason = %failure.reason,
                "event not applied"
            );
        }
        result.applied = outcome.applied;
        result.failed.extend(outcome.failed);
        result.adopted = outcome.adopted;

        if !result.applied.is_empty() || !result.failed.is_empty() {
            tracing::info!(
                %run_id,
                applied = result.applied.len(),
                failed = result.failed.len(),
                propagated = result.propagated.len(),
                "reconciliation applied"
            );
        }
        for event in &result.applied {
            tracing::info!(%run_id, "{event}");
        }
        Ok(result)
    }

    /// Add a container-side server to the internal state. `Ok(false)` when
    /// the internal state already lists it.
    async fn propagate(
        &self,
        event: &ChangeEvent,
        internal: Option<&Snapshot>,
    ) -> Result<bool, SyncError> {
        let failed = |reason: &str| SyncError::PropagationFailed {
            name: event.name.clone(),
            reason: reason.to_string(),
        };
        let internal = internal
            .filter(|s| s.is_valid())
            .ok_or_else(|| failed("internal state could not be read"))?;
        if internal.contains(&event.name) {
            return Ok(false);
        }
        let record = event.after.as_ref().ok_or_else(|| failed("event carries no record"))?;
        self.guard.mark_operation_start();
        self.mutator.add_internal(record).await?;
        Ok(true)
    }
}

fn needs_propagation(event: &ChangeEvent) -> bool {
    event.kind == ChangeKind::Added
        && matches!(
            event.source,
            SourceKind::ContainerRuntime | SourceKind::GatewayExpanded
        )
}
