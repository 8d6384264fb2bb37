//! Persisted catalog entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Scope, ServerRecord, SourceKind};

/// Lifecycle status of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Disabled,
    /// The originating source stopped reporting it; kept for audit and recovery.
    Orphaned,
}

impl EntryStatus {
    fn for_enabled(enabled: bool) -> Self {
        if enabled {
            EntryStatus::Active
        } else {
            EntryStatus::Disabled
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryStatus::Active => "active",
            EntryStatus::Disabled => "disabled",
            EntryStatus::Orphaned => "orphaned",
        })
    }
}

/// The catalog's last known good view of one server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub enabled: bool,
    /// Source that most recently reported this entry.
    pub source: SourceKind,
    /// Source that introduced this entry.
    pub origin_source: SourceKind,
    pub status: EntryStatus,
    /// Disabled through this manager. Sources that still report the server
    /// enabled do not turn it back on.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub locally_disabled: bool,
    /// Catalog-only entry that was also written to the internal state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub propagated: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl CatalogEntry {
    /// New entry for a record observed for the first time.
    pub fn from_record(record: &ServerRecord) -> Self {
        Self {
            name: record.name.clone(),
            command: record.command.clone(),
            args: record.args.clone(),
            env: record.env.clone(),
            scope: record.scope,
            enabled: record.enabled,
            source: record.source,
            origin_source: record.source,
            status: EntryStatus::for_enabled(record.enabled),
            locally_disabled: false,
            propagated: false,
            first_seen: record.last_seen,
            last_seen: record.last_seen,
        }
    }

    /// New entry added directly through this manager.
    pub fn catalog_only(
        name: &str,
        command: &str,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        scope: Option<Scope>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args,
            env,
            scope,
            enabled: true,
            source: SourceKind::CatalogOnly,
            origin_source: SourceKind::CatalogOnly,
            status: EntryStatus::Active,
            locally_disabled: false,
            propagated: false,
            first_seen: now,
            last_seen: now,
        }
    }

    /// The entry viewed as a record, for diffing and event payloads.
    pub fn to_record(&self) -> ServerRecord {
        ServerRecord {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            source: self.source,
            scope: self.scope,
            enabled: self.enabled,
            last_seen: self.last_seen,
        }
    }

    /// `record` as this entry would take it in: a locally disabled entry
    /// stays disabled whatever the source says.
    pub fn as_observed(&self, record: &ServerRecord) -> ServerRecord {
        let mut observed = record.clone();
        observed.enabled = record.enabled && !self.locally_disabled;
        observed
    }

    /// Take over the observed fields of `record`. Revives orphaned entries.
    pub fn observe(&mut self, record: &ServerRecord) {
        let enabled = record.enabled && !self.locally_disabled;
        self.command.clone_from(&record.command);
        self.args.clone_from(&record.args);
        self.env.clone_from(&record.env);
        if record.scope.is_some() {
            self.scope = record.scope;
        }
        self.enabled = enabled;
        self.source = record.source;
        self.status = EntryStatus::for_enabled(enabled);
        self.last_seen = record.last_seen;
    }

    /// Set the enabled flag and the matching non-orphaned status.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.status = EntryStatus::for_enabled(enabled);
    }

    /// Disable and pin it that way until [`CatalogEntry::enable_locally`].
    pub fn disable_locally(&mut self) {
        self.set_enabled(false);
        self.locally_disabled = true;
    }

    pub fn enable_locally(&mut self) {
        self.set_enabled(true);
        self.locally_disabled = false;
    }

    pub fn is_orphaned(&self) -> bool {
        self.status == EntryStatus::Orphaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, enabled: bool) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            command: "npx".to_string(),
            args: vec!["-y".to_string(), "server-fs".to_string()],
            env: BTreeMap::new(),
            source: SourceKind::InternalState,
            scope: Some(Scope::User),
            enabled,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn from_record_sets_origin_and_status() {
        let entry = CatalogEntry::from_record(&record("fs", false));
        assert_eq!(entry.origin_source, SourceKind::InternalState);
        assert_eq!(entry.status, EntryStatus::Disabled);
        assert_eq!(entry.first_seen, entry.last_seen);
    }

    #[test]
    fn observe_revives_orphaned_entry_but_keeps_origin() {
        let mut entry = CatalogEntry::from_record(&record("fs", true));
        entry.status = EntryStatus::Orphaned;
        let mut seen = record("fs", true);
        seen.source = SourceKind::ContainerRuntime;
        seen.scope = None;
        entry.observe(&seen);
        assert_eq!(entry.status, EntryStatus::Active);
        assert_eq!(entry.source, SourceKind::ContainerRuntime);
        assert_eq!(entry.origin_source, SourceKind::InternalState);
        assert_eq!(entry.scope, Some(Scope::User));
    }

    #[test]
    fn locally_disabled_entry_ignores_enabled_observations() {
        let mut entry = CatalogEntry::from_record(&record("fs", true));
        entry.disable_locally();
        let mut seen = record("fs", true);
        seen.args.push("--verbose".to_string());
        assert!(!entry.as_observed(&seen).enabled);

        entry.observe(&seen);
        assert_eq!(entry.status, EntryStatus::Disabled);
        assert_eq!(entry.args.last().map(String::as_str), Some("--verbose"));

        entry.enable_locally();
        entry.observe(&seen);
        assert_eq!(entry.status, EntryStatus::Active);
        assert!(!entry.locally_disabled);
    }

    #[test]
    fn flags_are_omitted_from_json_until_set() {
        let mut entry = CatalogEntry::from_record(&record("fs", true));
        let json = serde_json::to_value(&entry).unwrap();
        assert!(json.get("locally_disabled").is_none());
        assert!(json.get("propagated").is_none());

        entry.disable_locally();
        let back: CatalogEntry =
            serde_json::from_value(serde_json::to_value(&entry).unwrap()).unwrap();
        assert!(back.locally_disabled);
    }
}
