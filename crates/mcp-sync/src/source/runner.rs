//! Command execution seam.
//!
//! Everything that touches an external CLI goes through [`CommandRunner`], so
//! snapshotting and propagation can be driven by canned output in tests. The
//! default [`TokioCommandRunner`] spawns the process, captures stdout/stderr,
//! and kills it when the timeout elapses.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RunError;

/// Program plus arguments for one external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Split a configured argv (`["claude", "mcp", "list"]`) into program and args.
    pub fn from_argv(argv: &[String]) -> Result<Self, RunError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| RunError::InvalidInvocation("empty command".to_string()))?;
        if program.trim().is_empty() {
            return Err(RunError::InvalidInvocation("blank program name".to_string()));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn with_args<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(extra.into_iter().map(Into::into));
        self
    }

    /// Space-joined form used in logs and for matching canned responses.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Captured result of a finished process. A nonzero status is not an error
/// at this layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RawOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion, or fail with [`RunError::TimedOut`]
    /// once `timeout` elapses. Launch failures are errors; exit codes are not.
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<RawOutput, RunError>;
}

/// Spawns real processes via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner {
    extra_path: Vec<PathBuf>,
}

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories appended to `PATH` for spawned children. GUI-launched
    /// sessions often lack the package-manager bin directories.
    pub fn with_extra_path(mut self, dirs: Vec<PathBuf>) -> Self {
        self.extra_path = dirs;
        self
    }

    fn child_path(&self) -> Option<OsString> {
        if self.extra_path.is_empty() {
            return None;
        }
        let current = std::env::var_os("PATH").unwrap_or_default();
        let mut dirs: Vec<PathBuf> = std::env::split_paths(&current).collect();
        for dir in &self.extra_path {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        std::env::join_paths(dirs).ok()
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<RawOutput, RunError> {
        let mut cmd = tokio::process::Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = self.child_path() {
            cmd.env("PATH", path);
        }

        tracing::debug!("exec: {}", invocation.display());
        let child = cmd.spawn().map_err(|source| RunError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => Ok(RawOutput {
                status: out.status.code(),
                stdout: out.stdout,
                stderr: out.stderr,
            }),
            Ok(Err(source)) => Err(RunError::Spawn {
                program: invocation.program.clone(),
                source,
            }),
            Err(_) => Err(RunError::TimedOut {
                program: invocation.program.clone(),
                timeout,
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(matches!(
            Invocation::from_argv(&[]),
            Err(RunError::InvalidInvocation(_))
        ));
        let inv = Invocation::from_argv(&argv(&["claude", "mcp", "list"])).unwrap();
        assert_eq!(inv.program, "claude");
        assert_eq!(inv.with_args(["--json"]).display(), "claude mcp list --json");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_captures_output_and_status() {
        let runner = TokioCommandRunner::new();
        let inv = Invocation::from_argv(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        let out = runner.run(&inv, Duration::from_secs(5)).await.unwrap();
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "out");
        assert_eq!(out.stderr_lossy().trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tokio_runner_times_out() {
        let runner = TokioCommandRunner::new();
        let inv = Invocation::from_argv(&argv(&["sleep", "5"])).unwrap();
        let err = runner
            .run(&inv, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let runner = TokioCommandRunner::new();
        let inv = Invocation::from_argv(&argv(&["definitely-not-a-real-binary-4f1e"])).unwrap();
        let err = runner.run(&inv, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RunError::Spawn { .. }));
    }
}
