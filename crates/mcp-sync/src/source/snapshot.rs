//! Point-in-time listings from the external sources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::parser::{
    ParseError, parse_container_runtime, parse_internal_state, parse_registry_yaml,
};
use super::runner::{CommandRunner, Invocation};
use crate::error::SyncError;
use crate::model::{ServerRecord, Snapshot, SourceKind};

/// Listing commands per source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCommands {
    pub internal_state: Vec<String>,
    pub container_runtime: Vec<String>,
    /// When set, the container runtime is read from this registry file
    /// instead of its CLI.
    pub registry_file: Option<PathBuf>,
}

impl Default for ListCommands {
    fn default() -> Self {
        Self {
            internal_state: argv(&["claude", "mcp", "list"]),
            container_runtime: argv(&["docker", "mcp", "server", "list"]),
            registry_file: None,
        }
    }
}

pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub struct SourceSnapshotter {
    runner: Arc<dyn CommandRunner>,
    commands: ListCommands,
    timeout: Duration,
}

impl SourceSnapshotter {
    pub fn new(runner: Arc<dyn CommandRunner>, commands: ListCommands, timeout: Duration) -> Self {
        Self {
            runner,
            commands,
            timeout,
        }
    }

    /// Take one snapshot. Never fails: any problem reading the source comes
    /// back as an invalid snapshot and a warning carrying the raw failure.
    pub async fn snapshot(&self, source: SourceKind) -> Snapshot {
        let taken_at = Utc::now();
        let listed = match source {
            SourceKind::InternalState => {
                self.list(source, &self.commands.internal_state, taken_at, parse_internal_state)
                    .await
            }
            SourceKind::ContainerRuntime => match &self.commands.registry_file {
                Some(path) => self.read_registry(path, taken_at).await,
                None => {
                    self.list(
                        source,
                        &self.commands.container_runtime,
                        taken_at,
                        parse_container_runtime,
                    )
                    .await
                }
            },
            SourceKind::GatewayExpanded | SourceKind::CatalogOnly => {
                Err(unavailable(source, "not an external listing".to_string()))
            }
        };

        match listed {
            Ok(records) => {
                tracing::debug!(source = %source, records = records.len(), "snapshot taken");
                Snapshot::valid(source, taken_at, records)
            }
            Err(err) => {
                tracing::warn!(source = %source, error = %err, "snapshot unavailable");
                Snapshot::unavailable(source, taken_at, err.to_string())
            }
        }
    }

    async fn list(
        &self,
        source: SourceKind,
        argv: &[String],
        taken_at: DateTime<Utc>,
        parse: fn(&str, DateTime<Utc>) -> Result<Vec<ServerRecord>, ParseError>,
    ) -> Result<Vec<ServerRecord>, SyncError> {
        let invocation =
            Invocation::from_argv(argv).map_err(|e| unavailable(source, e.to_string()))?;
        let output = self
            .runner
            .run(&invocation, self.timeout)
            .await
            .map_err(|e| unavailable(source, e.to_string()))?;
        if !output.success() {
            let stderr = output.stderr_lossy();
            tracing::warn!(
                source = %source,
                status = ?output.status,
                stderr = %stderr.trim(),
                "'{}' exited unsuccessfully",
                invocation.display()
            );
            return Err(unavailable(
                source,
                format!("exit status {:?}: {}", output.status, stderr.trim()),
            ));
        }
        let stdout = String::from_utf8(output.stdout)
            .map_err(|_| unavailable(source, "output is not UTF-8".to_string()))?;
        parse(&stdout, taken_at).map_err(|e| {
            tracing::warn!(source = %source, raw = %stdout, "unparseable listing");
            unavailable(source, e.to_string())
        })
    }

    async fn read_registry(
        &self,
        path: &std::path::Path,
        taken_at: DateTime<Utc>,
    ) -> Result<Vec<ServerRecord>, SyncError> {
        let source = SourceKind::ContainerRuntime;
        let read = tokio::time::timeout(self.timeout, tokio::fs::read_to_string(path));
        let content = match read.await {
            Ok(Ok(content)) => content,
            Ok(Err(e)) => {
                return Err(unavailable(
                    source,
                    format!("reading {}: {e}", path.display()),
                ));
            }
            Err(_) => {
                return Err(unavailable(
                    source,
                    format!("reading {} timed out", path.display()),
                ));
            }
        };
        parse_registry_yaml(&content, taken_at).map_err(|e| unavailable(source, e.to_string()))
    }
}

fn unavailable(kind: SourceKind, reason: String) -> SyncError {
    SyncError::SnapshotUnavailable { kind, reason }
}
