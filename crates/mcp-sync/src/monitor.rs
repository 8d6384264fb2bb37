//! Periodic background reconciliation.
//!
//! The monitor owns one spawned task that ticks on a fixed interval and runs
//! a reconciliation per tick. `stop` cancels between ticks and waits for an
//! in-flight tick up to a grace period; a tick still running after that is
//! abandoned and its result discarded. `status` never waits on a tick.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::write_json_atomic;
use crate::error::SyncError;
use crate::model::{ChangeEvent, SourceKind};
use crate::reconcile::{ReconcilePolicy, ReconciliationEngine, ReconciliationResult, SkipReason};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);
/// Detected events kept in the status.
pub const RECENT_CHANGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor is already {0}")]
    AlreadyRunning(MonitorState),

    #[error("monitor is not running")]
    NotRunning,

    #[error("monitor interval must be greater than zero")]
    InvalidInterval,
}

/// Condensed outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub applied: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped_reason: Option<SkipReason>,
    pub skipped_sources: Vec<SourceKind>,
    pub error: Option<String>,
}

impl TickSummary {
    fn from_result(at: DateTime<Utc>, result: &ReconciliationResult) -> Self {
        Self {
            at,
            run_id: Some(result.run_id),
            applied: result.applied.len(),
            pending: result.pending.len(),
            failed: result.failed.len(),
            skipped_reason: result.skipped_reason,
            skipped_sources: result.skipped_sources.clone(),
            error: None,
        }
    }

    fn from_error(at: DateTime<Utc>, err: &SyncError) -> Self {
        Self {
            at,
            run_id: None,
            applied: 0,
            pending: 0,
            failed: 0,
            skipped_reason: None,
            skipped_sources: Vec::new(),
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub interval_secs: Option<f64>,
    pub auto_apply: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub changes_detected: u64,
    pub changes_applied: u64,
    pub errors: u64,
    pub abandoned_ticks: u64,
    pub last_result: Option<TickSummary>,
    /// Most recent detected events, oldest first.
    pub recent_changes: VecDeque<ChangeEvent>,
}

impl MonitorStatus {
    fn record(&mut self, at: DateTime<Utc>, outcome: &Result<ReconciliationResult, SyncError>) {
        self.ticks += 1;
        self.last_tick_at = Some(at);
        match outcome {
            Ok(result) => {
                let detected: Vec<&ChangeEvent> = result.detected().collect();
                self.changes_detected += detected.len() as u64;
                self.changes_applied += result.applied.len() as u64;
                for event in detected {
                    if self.recent_changes.len() == RECENT_CHANGES {
                        self.recent_changes.pop_front();
                    }
                    self.recent_changes.push_back(event.clone());
                }
                self.last_result = Some(TickSummary::from_result(at, result));
            }
            Err(err) => {
                self.errors += 1;
                self.last_result = Some(TickSummary::from_error(at, err));
            }
        }
    }
}

struct Shared {
    status: Mutex<MonitorStatus>,
    /// Set under the status lock when `stop` gives up on a tick.
    abandoned: AtomicBool,
    state_file: Option<PathBuf>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MonitorStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn persist(&self) {
        let Some(path) = self.state_file.clone() else {
            return;
        };
        let snapshot = self.lock().clone();
        let written =
            tokio::task::spawn_blocking(move || write_json_atomic(&path, &snapshot)).await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "failed to persist monitor state"),
            Err(e) => tracing::debug!(error = %e, "monitor state writer panicked"),
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
    /// Cancelled when `stop` gives up on an in-flight tick.
    abandon: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BackgroundMonitor {
    engine: Arc<ReconciliationEngine>,
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
    grace: Duration,
    propagate: bool,
}

impl BackgroundMonitor {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self {
            engine,
            shared: Arc::new(Shared {
                status: Mutex::new(MonitorStatus::default()),
                abandoned: AtomicBool::new(false),
                state_file: None,
            }),
            task: Mutex::new(None),
            grace: DEFAULT_GRACE,
            propagate: true,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_propagation(mut self, propagate: bool) -> Self {
        self.propagate = propagate;
        self
    }

    /// Write the status to `path` after every tick and on stop.
    pub fn with_state_file(mut self, path: PathBuf) -> Self {
        self.shared = Arc::new(Shared {
            status: Mutex::new(MonitorStatus::default()),
            abandoned: AtomicBool::new(false),
            state_file: Some(path),
        });
        self
    }

    fn task_slot(&self) -> MutexGuard<'_, Option<RunningTask>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the loop. Must be called from within a tokio runtime.
    pub fn start(&self, interval: Duration, auto_apply: bool) -> Result<(), MonitorError> {
        if interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }
        let mut slot = self.task_slot();
        {
            let mut status = self.shared.lock();
            if status.state != MonitorState::Stopped || slot.is_some() {
                return Err(MonitorError::AlreadyRunning(status.state));
            }
            *status = MonitorStatus {
                state: MonitorState::Starting,
                interval_secs: Some(interval.as_secs_f64()),
                auto_apply,
                started_at: Some(Utc::now()),
                ..MonitorStatus::default()
            };
            self.shared.abandoned.store(false, Ordering::SeqCst);
        }

        let cancel = CancellationToken::new();
        let abandon = CancellationToken::new();
        let policy = ReconcilePolicy {
            auto_apply,
            propagate: self.propagate,
        };
        let handle = tokio::spawn(run_loop(
            self.engine.clone(),
            self.shared.clone(),
            cancel.clone(),
            abandon.clone(),
            interval,
            policy,
        ));
        *slot = Some(RunningTask {
            cancel,
            abandon,
            handle,
        });
        self.shared.lock().state = MonitorState::Running;
        tracing::info!(interval = ?interval, auto_apply, "monitor started");
        Ok(())
    }

    /// Cancel the loop and wait for it, up to the grace period.
    pub async fn stop(&self) -> Result<MonitorStatus, MonitorError> {
        let task = self.task_slot().take().ok_or(MonitorError::NotRunning)?;
        self.shared.lock().state = MonitorState::Stopping;
        task.cancel.cancel();

        let mut handle = task.handle;
        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "monitor task failed"),
            Err(_) => {
                {
                    let mut status = self.shared.lock();
                    self.shared.abandoned.store(true, Ordering::SeqCst);
                    status.abandoned_ticks += 1;
                }
                task.abandon.cancel();
                handle.abort();
                tracing::warn!(grace = ?self.grace, "tick still running after grace; abandoned");
            }
        }

        let status = {
            let mut status = self.shared.lock();
            status.state = MonitorState::Stopped;
            status.clone()
        };
        self.shared.persist().await;
        tracing::info!(ticks = status.ticks, "monitor stopped");
        Ok(status)
    }

    pub fn status(&self) -> MonitorStatus {
        self.shared.lock().clone()
    }
}

async fn run_loop(
    engine: Arc<ReconciliationEngine>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    abandon: CancellationToken,
    interval: Duration,
    policy: ReconcilePolicy,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("monitor loop cancelled");
                break;
            }
            _ = ticker.tick() => {
                let at = Utc::now();
                let outcome = engine.reconcile_unless(policy, &abandon).await;
                match &outcome {
                    Ok(result) if result.is_skipped() => tracing::debug!(
                        run_id = %result.run_id,
                        reason = ?result.skipped_reason,
                        "tick skipped"
                    ),
                    Ok(_) => {}
                    Err(err) if err.is_write_conflict() => {
                        tracing::warn!(error = %err, "catalog busy; retrying next tick")
                    }
                    Err(err) => tracing::error!(error = %err, "reconciliation failed"),
                }
                {
                    let mut status = shared.lock();
                    if shared.abandoned.load(Ordering::SeqCst) {
                        break;
                    }
                    status.record(at, &outcome);
                }
                shared.persist().await;
            }
        }
    }
}

/// Read a status written by another process's monitor.
pub fn read_state_file(path: &std::path::Path) -> anyhow::Result<Option<MonitorStatus>> {
    use anyhow::Context;
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let status = serde_json::from_str(&content)
        .with_context(|| format!("parsing monitor state {}", path.display()))?;
    Ok(Some(status))
}
