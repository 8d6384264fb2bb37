//! External sources: command execution, listing parsers, snapshots and writes.

pub mod mutate;
pub mod parser;
pub mod runner;
pub mod snapshot;

pub use mutate::{MutationCommands, SourceMutator};
pub use runner::{CommandRunner, Invocation, RawOutput, TokioCommandRunner};
pub use snapshot::{ListCommands, SourceSnapshotter};
