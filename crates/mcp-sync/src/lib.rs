//! Keeps a local catalog of MCP servers consistent with the assistant's own
//! server list and the desktop container runtime's registry, without reacting
//! to its own writes.

pub mod catalog;
pub mod config;
pub mod detector;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod ops;
pub mod reconcile;
pub mod source;

use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::Settings;
use crate::detector::ChangeDetector;
use crate::gateway::GatewayExpander;
use crate::guard::OperationGuard;
use crate::ops::ServerOps;
use crate::reconcile::ReconciliationEngine;
use crate::source::{CommandRunner, SourceMutator, SourceSnapshotter, TokioCommandRunner};

/// Components wired from one set of settings, sharing a single guard.
pub struct App {
    pub engine: Arc<ReconciliationEngine>,
    pub ops: ServerOps,
    pub catalog: Arc<Catalog>,
}

impl App {
    pub fn new(settings: &Settings) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(TokioCommandRunner::new().with_extra_path(settings.extra_path.clone()));
        Self::with_runner(settings, runner)
    }

    pub fn with_runner(settings: &Settings, runner: Arc<dyn CommandRunner>) -> Self {
        let catalog = Arc::new(Catalog::new(
            settings.catalog_file.clone(),
            settings.catalog_timeout,
        ));
        let guard = Arc::new(OperationGuard::new(settings.cooldown));
        let mutator = Arc::new(SourceMutator::new(
            runner.clone(),
            settings.mutation.clone(),
            settings.snapshot_timeout,
        ));
        let engine = Arc::new(ReconciliationEngine::new(
            SourceSnapshotter::new(runner, settings.list.clone(), settings.snapshot_timeout),
            GatewayExpander::new(settings.gateway.clone()),
            ChangeDetector::new(settings.merge.clone()),
            mutator.clone(),
            catalog.clone(),
            guard.clone(),
        ));
        let ops = ServerOps::new(catalog.clone(), guard, mutator);
        Self {
            engine,
            ops,
            catalog,
        }
    }
}
