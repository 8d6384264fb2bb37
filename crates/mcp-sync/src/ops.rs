//! User-initiated server operations.
//!
//! Each operation marks the shared guard before touching anything, so a
//! reconciliation racing with it stays out until the cooldown has passed.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::Catalog;
use crate::error::SyncError;
use crate::guard::OperationGuard;
use crate::model::{CatalogEntry, EntryStatus, Scope, SourceKind};
use crate::source::SourceMutator;

/// A server defined by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewServer {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub scope: Option<Scope>,
}

pub struct ServerOps {
    catalog: Arc<Catalog>,
    guard: Arc<OperationGuard>,
    mutator: Arc<SourceMutator>,
}

impl ServerOps {
    pub fn new(
        catalog: Arc<Catalog>,
        guard: Arc<OperationGuard>,
        mutator: Arc<SourceMutator>,
    ) -> Self {
        Self {
            catalog,
            guard,
            mutator,
        }
    }

    /// Record a new catalog-only server and, with `propagate`, add it to the
    /// internal state. An orphaned entry of the same name is replaced.
    pub async fn add(&self, server: NewServer, propagate: bool) -> Result<CatalogEntry, SyncError> {
        self.guard.mark_operation_start();
        let existing = self.catalog.read().await?;
        if existing.get(&server.name).is_some_and(|e| !e.is_orphaned()) {
            return Err(SyncError::DuplicateServer(server.name));
        }

        let mut entry = CatalogEntry::catalog_only(
            &server.name,
            &server.command,
            server.args,
            server.env,
            server.scope,
            Utc::now(),
        );
        if propagate {
            self.mutator.add_internal(&entry.to_record()).await?;
            entry.propagated = true;
        }
        let stored = entry.clone();
        self.catalog
            .update(|entries| {
                entries.insert(stored.name.clone(), stored.clone());
            })
            .await?;
        tracing::info!(name = %entry.name, propagate, "server added");
        Ok(entry)
    }

    /// Withdraw the server from its source and keep it as disabled. The entry
    /// stays disabled even if another source keeps reporting it.
    pub async fn disable(&self, name: &str) -> Result<CatalogEntry, SyncError> {
        self.guard.mark_operation_start();
        let entry = self.lookup(name).await?;
        self.withdraw(&entry).await?;
        let updated = self.set_status(name, withdrawn).await?;
        tracing::info!(name, "server disabled");
        Ok(updated)
    }

    /// Re-propagate the server to its source and mark it active.
    pub async fn enable(&self, name: &str) -> Result<CatalogEntry, SyncError> {
        self.guard.mark_operation_start();
        let entry = self.lookup(name).await?;
        match entry.source {
            SourceKind::ContainerRuntime | SourceKind::GatewayExpanded => {
                self.mutator.enable_container(name).await?
            }
            SourceKind::InternalState | SourceKind::CatalogOnly => {
                let mut record = entry.to_record();
                record.enabled = true;
                self.mutator.add_internal(&record).await?
            }
        }
        let updated = self
            .set_status(name, |e| {
                e.enable_locally();
                if e.source == SourceKind::CatalogOnly {
                    e.propagated = true;
                }
            })
            .await?;
        tracing::info!(name, "server enabled");
        Ok(updated)
    }

    /// Withdraw the server from its source. Catalog-only entries are deleted;
    /// entries that came from an external source are kept as disabled.
    pub async fn remove(&self, name: &str) -> Result<Option<CatalogEntry>, SyncError> {
        self.guard.mark_operation_start();
        let entry = self.lookup(name).await?;
        if entry.status != EntryStatus::Disabled {
            self.withdraw(&entry).await?;
        }
        if entry.origin_source == SourceKind::CatalogOnly {
            self.catalog
                .update(|entries| {
                    entries.remove(name);
                })
                .await?;
            tracing::info!(name, "server removed from catalog");
            return Ok(None);
        }
        let updated = self.set_status(name, withdrawn).await?;
        tracing::info!(name, "server removed; kept as disabled");
        Ok(Some(updated))
    }

    /// Delete orphaned entries from the catalog.
    pub async fn compact(&self) -> Result<Vec<String>, SyncError> {
        self.guard.mark_operation_start();
        Ok(self.catalog.compact().await?)
    }

    async fn lookup(&self, name: &str) -> Result<CatalogEntry, SyncError> {
        self.catalog
            .read()
            .await?
            .remove(name)
            .ok_or_else(|| SyncError::UnknownServer(name.to_string()))
    }

    async fn withdraw(&self, entry: &CatalogEntry) -> Result<(), SyncError> {
        match entry.source {
            SourceKind::ContainerRuntime | SourceKind::GatewayExpanded => {
                self.mutator.disable_container(&entry.name).await
            }
            SourceKind::InternalState => {
                self.mutator.remove_internal(&entry.name, entry.scope).await
            }
            SourceKind::CatalogOnly if entry.propagated => {
                self.mutator.remove_internal(&entry.name, entry.scope).await
            }
            SourceKind::CatalogOnly => {
                tracing::debug!(name = %entry.name, "not in any source; nothing to withdraw");
                Ok(())
            }
        }
    }

    async fn set_status<F>(&self, name: &str, f: F) -> Result<CatalogEntry, SyncError>
    where
        F: Fn(&mut CatalogEntry) + Send + Sync,
    {
        let updated = self
            .catalog
            .update(|entries| {
                entries.get_mut(name).map(|entry| {
                    f(entry);
                    entry.clone()
                })
            })
            .await?;
        updated.ok_or_else(|| SyncError::UnknownServer(name.to_string()))
    }
}

fn withdrawn(entry: &mut CatalogEntry) {
    entry.disable_locally();
    entry.propagated = false;
}
