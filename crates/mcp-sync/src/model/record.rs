//! Server records and the snapshots that carry them.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a server record was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// The assistant's own list of wired-up servers.
    InternalState,
    /// The desktop container runtime's enable/disable registry.
    ContainerRuntime,
    /// Synthesized from the internal state's aggregate gateway record.
    GatewayExpanded,
    /// Added through this manager and not observed externally.
    CatalogOnly,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::InternalState => "internal-state",
            SourceKind::ContainerRuntime => "container-runtime",
            SourceKind::GatewayExpanded => "gateway-expanded",
            SourceKind::CatalogOnly => "catalog-only",
        }
    }

    /// The snapshot through which records of this kind are observed.
    ///
    /// Gateway-expanded records come out of the internal-state listing, so
    /// their visibility follows that snapshot. Catalog-only records have none.
    pub fn snapshot_source(self) -> Option<SourceKind> {
        match self {
            SourceKind::InternalState | SourceKind::GatewayExpanded => {
                Some(SourceKind::InternalState)
            }
            SourceKind::ContainerRuntime => Some(SourceKind::ContainerRuntime),
            SourceKind::CatalogOnly => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "internal-state" | "internal" => Ok(SourceKind::InternalState),
            "container-runtime" | "container" | "docker" => Ok(SourceKind::ContainerRuntime),
            "gateway-expanded" | "gateway" => Ok(SourceKind::GatewayExpanded),
            "catalog-only" | "catalog" => Ok(SourceKind::CatalogOnly),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

/// Configuration scope of a server inside the assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    System,
    User,
    Project,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::System => "system",
            Scope::User => "user",
            Scope::Project => "project",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Scope::System),
            "user" | "global" => Ok(Scope::User),
            "project" | "local" => Ok(Scope::Project),
            other => Err(format!("unknown scope '{other}'")),
        }
    }
}

/// One addressable MCP server as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub source: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub enabled: bool,
    pub last_seen: DateTime<Utc>,
}

impl ServerRecord {
    /// True when the two records would launch different processes.
    pub fn launch_differs(&self, other: &ServerRecord) -> bool {
        self.command != other.command || self.args != other.args
    }

    /// True when any field tracked for MODIFIED detection differs.
    pub fn differs_from(&self, other: &ServerRecord) -> bool {
        self.launch_differs(other) || self.env != other.env || self.enabled != other.enabled
    }
}

/// An immutable, timestamped listing from one external source.
///
/// An invalid snapshot means the source could not be read. It carries no
/// records and must never be treated as "the source reports nothing".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    source: SourceKind,
    taken_at: DateTime<Utc>,
    valid: bool,
    records: Vec<ServerRecord>,
    failure: Option<String>,
}

impl Snapshot {
    pub fn valid(source: SourceKind, taken_at: DateTime<Utc>, records: Vec<ServerRecord>) -> Self {
        Self {
            source,
            taken_at,
            valid: true,
            records,
            failure: None,
        }
    }

    pub fn unavailable(
        source: SourceKind,
        taken_at: DateTime<Utc>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            source,
            taken_at,
            valid: false,
            records: Vec::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn records(&self) -> &[ServerRecord] {
        &self.records
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Replace the records of a valid snapshot, keeping source and timestamp.
    /// Invalid snapshots are returned unchanged.
    pub fn map_records<F>(self, f: F) -> Self
    where
        F: FnOnce(Vec<ServerRecord>) -> Vec<ServerRecord>,
    {
        if !self.valid {
            return self;
        }
        Self {
            records: f(self.records),
            ..self
        }
    }

    /// True when a record with this name is present.
    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }
}
