//! Writes to the external sources: adding servers to the internal state and
//! toggling them in the container runtime.

use std::sync::Arc;
use std::time::Duration;

use super::runner::{CommandRunner, Invocation};
use super::snapshot::argv;
use crate::error::SyncError;
use crate::model::{Scope, ServerRecord};

/// Mutation command prefixes. Arguments are appended per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationCommands {
    pub internal_add: Vec<String>,
    pub internal_remove: Vec<String>,
    pub container_enable: Vec<String>,
    pub container_disable: Vec<String>,
}

impl Default for MutationCommands {
    fn default() -> Self {
        Self {
            internal_add: argv(&["claude", "mcp", "add"]),
            internal_remove: argv(&["claude", "mcp", "remove"]),
            container_enable: argv(&["docker", "mcp", "server", "enable"]),
            container_disable: argv(&["docker", "mcp", "server", "disable"]),
        }
    }
}

pub struct SourceMutator {
    runner: Arc<dyn CommandRunner>,
    commands: MutationCommands,
    timeout: Duration,
}

impl SourceMutator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        commands: MutationCommands,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            commands,
            timeout,
        }
    }

    /// `claude mcp add [--scope S] [-e K=V]... NAME -- COMMAND ARGS...`
    pub async fn add_internal(&self, record: &ServerRecord) -> Result<(), SyncError> {
        let mut extra: Vec<String> = Vec::new();
        if let Some(scope) = record.scope.and_then(cli_scope) {
            extra.push("--scope".to_string());
            extra.push(scope.to_string());
        }
        for (key, value) in &record.env {
            extra.push("-e".to_string());
            extra.push(format!("{key}={value}"));
        }
        extra.push(record.name.clone());
        extra.push("--".to_string());
        extra.push(record.command.clone());
        extra.extend(record.args.iter().cloned());
        self.exec(&record.name, &self.commands.internal_add, extra).await
    }

    pub async fn remove_internal(&self, name: &str, scope: Option<Scope>) -> Result<(), SyncError> {
        let mut extra = vec![name.to_string()];
        if let Some(scope) = scope.and_then(cli_scope) {
            extra.push("--scope".to_string());
            extra.push(scope.to_string());
        }
        self.exec(name, &self.commands.internal_remove, extra).await
    }

    pub async fn enable_container(&self, name: &str) -> Result<(), SyncError> {
        self.exec(name, &self.commands.container_enable, vec![name.to_string()])
            .await
    }

    pub async fn disable_container(&self, name: &str) -> Result<(), SyncError> {
        self.exec(name, &self.commands.container_disable, vec![name.to_string()])
            .await
    }

    async fn exec(
        &self,
        name: &str,
        prefix: &[String],
        extra: Vec<String>,
    ) -> Result<(), SyncError> {
        let failed = |reason: String| SyncError::PropagationFailed {
            name: name.to_string(),
            reason,
        };
        let invocation = Invocation::from_argv(prefix)
            .map_err(|e| failed(e.to_string()))?
            .with_args(extra);
        let output = self
            .runner
            .run(&invocation, self.timeout)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            let stderr = output.stderr_lossy();
            return Err(failed(format!(
                "'{}' exited with {:?}: {}",
                invocation.program,
                output.status,
                stderr.trim()
            )));
        }
        tracing::info!("ran '{}'", invocation.display());
        Ok(())
    }
}

/// The assistant CLI only knows user and project scopes.
fn cli_scope(scope: Scope) -> Option<&'static str> {
    match scope {
        Scope::System => None,
        Scope::User => Some("user"),
        Scope::Project => Some("project"),
    }
}
