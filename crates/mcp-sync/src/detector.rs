//! Diffing external snapshots against the catalog.
//!
//! Detection is pure: it reads snapshots and catalog entries and returns
//! ordered [`ChangeEvent`]s. Nothing is written here.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Entries;
use crate::error::SyncError;
use crate::model::{
    CatalogEntry, ChangeEvent, ChangeKind, EntryStatus, ServerRecord, Snapshot, SourceKind,
};

/// How the `enabled` flag is settled when sources disagree about a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnabledTieBreak {
    /// Take the flag of the record that won on precedence.
    #[default]
    Precedence,
    /// Enabled if any source reports it enabled.
    AnyEnabled,
    /// Enabled only if every source reports it enabled.
    AllEnabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    /// Highest precedence first. Sources not listed rank last.
    pub precedence: Vec<SourceKind>,
    pub enabled_tie_break: EnabledTieBreak,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            precedence: vec![
                SourceKind::InternalState,
                SourceKind::ContainerRuntime,
                SourceKind::GatewayExpanded,
            ],
            enabled_tie_break: EnabledTieBreak::Precedence,
        }
    }
}

impl MergePolicy {
    fn rank(&self, source: SourceKind) -> usize {
        self.precedence
            .iter()
            .position(|s| *s == source)
            .unwrap_or(self.precedence.len())
    }
}

/// Output of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct Detection {
    /// ADDED, then MODIFIED, then REMOVED; each group sorted by name.
    pub events: Vec<ChangeEvent>,
    /// Sources whose snapshot was invalid and therefore ignored.
    pub skipped_sources: Vec<SourceKind>,
    /// Merged view of every valid snapshot.
    pub external: BTreeMap<String, ServerRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    policy: MergePolicy,
}

impl ChangeDetector {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn detect(
        &self,
        snapshots: &BTreeMap<SourceKind, Snapshot>,
        catalog: &Entries,
        detected_at: DateTime<Utc>,
    ) -> Detection {
        let mut validated: BTreeSet<SourceKind> = BTreeSet::new();
        let mut skipped_sources = Vec::new();
        for (kind, snapshot) in snapshots {
            if snapshot.is_valid() {
                validated.insert(*kind);
            } else {
                tracing::debug!(
                    source = %kind,
                    taken_at = %snapshot.taken_at(),
                    reason = snapshot.failure().unwrap_or("unknown"),
                    "ignoring invalid snapshot"
                );
                skipped_sources.push(*kind);
            }
        }

        let external = self.merge(snapshots.values().filter(|s| s.is_valid()));
        let event = |kind, name: &str, source, before, after| ChangeEvent {
            kind,
            name: name.to_string(),
            source,
            before,
            after,
            detected_at,
        };

        let mut events = Vec::new();
        for (name, record) in &external {
            if !catalog.contains_key(name) {
                events.push(event(
                    ChangeKind::Added,
                    name,
                    record.source,
                    None,
                    Some(record.clone()),
                ));
            }
        }
        for (name, record) in &external {
            let Some(entry) = catalog.get(name) else {
                continue;
            };
            let before = entry.to_record();
            let observed = entry.as_observed(record);
            if entry.is_orphaned() || before.differs_from(&observed) {
                events.push(event(
                    ChangeKind::Modified,
                    name,
                    record.source,
                    Some(before),
                    Some(observed),
                ));
            }
        }
        for (name, entry) in catalog {
            if external.contains_key(name) || !removal_candidate(entry, &validated) {
                continue;
            }
            events.push(event(
                ChangeKind::Removed,
                name,
                entry.origin_source,
                Some(entry.to_record()),
                None,
            ));
        }

        Detection {
            events,
            skipped_sources,
            external,
        }
    }

    /// Merge records from valid snapshots by name, resolving conflicts by
    /// precedence. Every launch conflict is logged with both versions.
    pub fn merge<'a, I>(&self, snapshots: I) -> BTreeMap<String, ServerRecord>
    where
        I: IntoIterator<Item = &'a Snapshot>,
    {
        let mut merged: BTreeMap<String, ServerRecord> = BTreeMap::new();
        for record in snapshots.into_iter().flat_map(|s| s.records()) {
            let Some(existing) = merged.get_mut(&record.name) else {
                merged.insert(record.name.clone(), record.clone());
                continue;
            };
            let incoming_wins = self.policy.rank(record.source) < self.policy.rank(existing.source);
            if existing.launch_differs(record) {
                let (kept, dropped) = if incoming_wins {
                    (&*record, &*existing)
                } else {
                    (&*existing, &*record)
                };
                tracing::warn!(
                    name = %record.name,
                    kept_source = %kept.source,
                    kept = %launch_line(kept),
                    dropped_source = %dropped.source,
                    dropped = %launch_line(dropped),
                    "sources disagree on launch command"
                );
            }
            let enabled = match self.policy.enabled_tie_break {
                EnabledTieBreak::Precedence if incoming_wins => record.enabled,
                EnabledTieBreak::Precedence => existing.enabled,
                EnabledTieBreak::AnyEnabled => existing.enabled || record.enabled,
                EnabledTieBreak::AllEnabled => existing.enabled && record.enabled,
            };
            if incoming_wins {
                *existing = record.clone();
            }
            existing.enabled = enabled;
        }
        merged
    }
}

/// A catalog entry absent from every snapshot is REMOVED only when the
/// snapshot its origin is observed through was valid. Catalog-only, orphaned
/// and disabled entries never are.
fn removal_candidate(entry: &CatalogEntry, validated: &BTreeSet<SourceKind>) -> bool {
    if matches!(entry.status, EntryStatus::Orphaned | EntryStatus::Disabled) {
        return false;
    }
    entry
        .origin_source
        .snapshot_source()
        .is_some_and(|s| validated.contains(&s))
}

fn launch_line(record: &ServerRecord) -> String {
    std::iter::once(record.command.as_str())
        .chain(record.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apply one event to in-memory entries.
///
/// Applying an event twice leaves the same result. An event whose target is
/// gone, or that would orphan a catalog-only entry, is stale.
pub fn apply_event(entries: &mut Entries, event: &ChangeEvent) -> Result<(), SyncError> {
    let stale = |reason: &str| SyncError::StaleEvent {
        name: event.name.clone(),
        reason: reason.to_string(),
    };
    match event.kind {
        ChangeKind::Added | ChangeKind::Modified => {
            let after = event
                .after
                .as_ref()
                .ok_or_else(|| stale("event carries no record"))?;
            match entries.get_mut(&event.name) {
                Some(entry) => entry.observe(after),
                None if event.kind == ChangeKind::Added => {
                    entries.insert(event.name.clone(), CatalogEntry::from_record(after));
                }
                None => return Err(stale("entry no longer in catalog")),
            }
        }
        ChangeKind::Removed => {
            let entry = entries
                .get_mut(&event.name)
                .ok_or_else(|| stale("entry no longer in catalog"))?;
            if entry.origin_source == SourceKind::CatalogOnly {
                return Err(stale("catalog-only entries are never orphaned"));
            }
            entry.status = EntryStatus::Orphaned;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn rec(name: &str, source: SourceKind, args: &[&str]) -> ServerRecord {
        ServerRecord {
            name: name.to_string(),
            command: "docker".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            source,
            scope: None,
            enabled: true,
            last_seen: Utc::now(),
        }
    }

    fn snapshots(list: Vec<Snapshot>) -> BTreeMap<SourceKind, Snapshot> {
        list.into_iter().map(|s| (s.source(), s)).collect()
    }

    fn apply_all(entries: &mut Entries, events: &[ChangeEvent]) {
        for e in events {
            apply_event(entries, e).unwrap();
        }
    }

    #[test]
    fn new_container_server_is_added() {
        let now = Utc::now();
        let snaps = snapshots(vec![
            Snapshot::valid(SourceKind::InternalState, now, vec![]),
            Snapshot::valid(
                SourceKind::ContainerRuntime,
                now,
                vec![rec("sqlite", SourceKind::ContainerRuntime, &["sqlite"])],
            ),
        ]);
        let detection = ChangeDetector::default().detect(&snaps, &Entries::new(), now);
        assert_eq!(detection.events.len(), 1);
        let ev = &detection.events[0];
        assert_eq!(ev.kind, ChangeKind::Added);
        assert_eq!(ev.name, "sqlite");
        assert_eq!(ev.source, SourceKind::ContainerRuntime);
        assert!(ev.before.is_none());
    }

    #[test]
    fn invalid_snapshot_never_removes() {
        let now = Utc::now();
        let mut catalog = Entries::new();
        for name in ["a", "b", "c"] {
            catalog.insert(
                name.to_string(),
                CatalogEntry::from_record(&rec(name, SourceKind::ContainerRuntime, &[name])),
            );
        }
        let snaps = snapshots(vec![
            Snapshot::valid(SourceKind::InternalState, now, vec![]),
            Snapshot::unavailable(SourceKind::ContainerRuntime, now, "timed out"),
        ]);
        let detection = ChangeDetector::default().detect(&snaps, &catalog, now);
        assert!(detection.events.is_empty());
        assert_eq!(detection.skipped_sources, vec![SourceKind::ContainerRuntime]);
    }

    #[test]
    fn internal_state_timeout_keeps_internal_and_gateway_entries() {
        let now = Utc::now();
        let mut catalog = Entries::new();
        for name in ["fs", "git", "fetch", "memory", "time"] {
            catalog.insert(
                name.to_string(),
                CatalogEntry::from_record(&rec(name, SourceKind::InternalState, &[name])),
            );
        }
        catalog.insert(
            "github".to_string(),
            CatalogEntry::from_record(&rec("github", SourceKind::GatewayExpanded, &[])),
        );
        catalog.insert(
            "sqlite".to_string(),
            CatalogEntry::from_record(&rec("sqlite", SourceKind::ContainerRuntime, &[])),
        );
        let snaps = snapshots(vec![
            Snapshot::unavailable(SourceKind::InternalState, now, "timed out after 15s"),
            Snapshot::valid(SourceKind::ContainerRuntime, now, vec![]),
        ]);

        let detection = ChangeDetector::default().detect(&snaps, &catalog, now);
        assert_eq!(detection.skipped_sources, vec![SourceKind::InternalState]);
        let events: Vec<_> = detection.events.iter().map(|e| e.to_string()).collect();
        assert_eq!(events, vec!["REMOVED sqlite (container-runtime)"]);

        apply_all(&mut catalog, &detection.events);
        assert_eq!(
            catalog.values().filter(|e| e.status == EntryStatus::Active).count(),
            6
        );
    }

    #[test]
    fn locally_disabled_entry_is_not_revived_by_another_source() {
        let now = Utc::now();
        let mut entry =
            CatalogEntry::from_record(&rec("github", SourceKind::ContainerRuntime, &[]));
        entry.disable_locally();
        let mut catalog = Entries::new();
        catalog.insert("github".to_string(), entry);
        let snaps = snapshots(vec![
            Snapshot::valid(
                SourceKind::InternalState,
                now,
                vec![rec("github", SourceKind::GatewayExpanded, &[])],
            ),
            Snapshot::valid(SourceKind::ContainerRuntime, now, vec![]),
        ]);

        let detector = ChangeDetector::default();
        let first = detector.detect(&snaps, &catalog, now).events;
        assert!(first.is_empty(), "unexpected events: {first:?}");

        let mut moved = rec("github", SourceKind::GatewayExpanded, &["--new"]);
        moved.last_seen = now;
        let snaps = snapshots(vec![
            Snapshot::valid(SourceKind::InternalState, now, vec![moved]),
            Snapshot::valid(SourceKind::ContainerRuntime, now, vec![]),
        ]);
        let events = detector.detect(&snaps, &catalog, now).events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].after.as_ref().map(|r| r.enabled), Some(false));
        apply_all(&mut catalog, &events);
        assert_eq!(catalog["github"].status, EntryStatus::Disabled);
        assert_eq!(catalog["github"].args, vec!["--new"]);
    }

    #[test]
    fn orphaned_entry_comes_back_as_modified() {
        let now = Utc::now();
        let mut entry = CatalogEntry::from_record(&rec("x", SourceKind::InternalState, &["x"]));
        entry.status = EntryStatus::Orphaned;
        let mut catalog = Entries::new();
        catalog.insert("x".to_string(), entry);
        let snaps = snapshots(vec![Snapshot::valid(
            SourceKind::InternalState,
            now,
            vec![rec("x", SourceKind::InternalState, &["x"])],
        )]);
        let detection = ChangeDetector::default().detect(&snaps, &catalog, now);
        assert_eq!(detection.events.len(), 1);
        assert_eq!(detection.events[0].kind, ChangeKind::Modified);

        apply_all(&mut catalog, &detection.events);
        assert_eq!(catalog["x"].status, EntryStatus::Active);
        assert_eq!(catalog["x"].origin_source, SourceKind::InternalState);
    }

    #[test]
    fn removal_requires_valid_origin_and_orphans() {
        let now = Utc::now();
        let mut catalog = Entries::new();
        catalog.insert(
            "fs".to_string(),
            CatalogEntry::from_record(&rec("fs", SourceKind::InternalState, &[])),
        );
        catalog.insert(
            "gh".to_string(),
            CatalogEntry::from_record(&rec("gh", SourceKind::GatewayExpanded, &[])),
        );
        catalog.insert(
            "mine".to_string(),
            CatalogEntry::catalog_only("mine", "npx", vec![], BTreeMap::new(), None, now),
        );
        let mut off = CatalogEntry::from_record(&rec("off", SourceKind::InternalState, &[]));
        off.set_enabled(false);
        catalog.insert("off".to_string(), off);

        let snaps = snapshots(vec![Snapshot::valid(SourceKind::InternalState, now, vec![])]);
        let detection = ChangeDetector::default().detect(&snaps, &catalog, now);
        let removed: Vec<_> = detection
            .events
            .iter()
            .map(|e| (e.kind, e.name.as_str(), e.source))
            .collect();
        assert_eq!(
            removed,
            vec![
                (ChangeKind::Removed, "fs", SourceKind::InternalState),
                (ChangeKind::Removed, "gh", SourceKind::GatewayExpanded),
            ]
        );

        apply_all(&mut catalog, &detection.events);
        assert_eq!(catalog.len(), 4);
        assert!(catalog["fs"].is_orphaned());
        assert!(catalog["gh"].is_orphaned());
        assert_eq!(catalog["mine"].status, EntryStatus::Active);
    }

    #[test]
    fn precedence_resolves_conflicts() {
        let now = Utc::now();
        let mut internal = rec("github", SourceKind::InternalState, &["internal"]);
        internal.enabled = false;
        let container = rec("github", SourceKind::ContainerRuntime, &["container"]);
        let snaps = [
            Snapshot::valid(SourceKind::ContainerRuntime, now, vec![container]),
            Snapshot::valid(SourceKind::InternalState, now, vec![internal]),
        ];

        let merged = ChangeDetector::default().merge(snaps.iter());
        assert_eq!(merged["github"].args, vec!["internal"]);
        assert!(!merged["github"].enabled);

        let any = ChangeDetector::new(MergePolicy {
            enabled_tie_break: EnabledTieBreak::AnyEnabled,
            ..MergePolicy::default()
        });
        let merged = any.merge(snaps.iter());
        assert_eq!(merged["github"].source, SourceKind::InternalState);
        assert!(merged["github"].enabled);
    }

    #[test]
    fn events_are_grouped_and_sorted() {
        let now = Utc::now();
        let mut catalog = Entries::new();
        for (name, args) in [("b-mod", "old"), ("a-gone", "x"), ("c-mod", "old")] {
            catalog.insert(
                name.to_string(),
                CatalogEntry::from_record(&rec(name, SourceKind::InternalState, &[args])),
            );
        }
        let snaps = snapshots(vec![Snapshot::valid(
            SourceKind::InternalState,
            now,
            vec![
                rec("z-new", SourceKind::InternalState, &[]),
                rec("c-mod", SourceKind::InternalState, &["new"]),
                rec("b-mod", SourceKind::InternalState, &["new"]),
                rec("y-new", SourceKind::InternalState, &[]),
            ],
        )]);
        let events = ChangeDetector::default().detect(&snaps, &catalog, now).events;
        let order: Vec<_> = events.iter().map(|e| e.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "ADDED y-new (internal-state)",
                "ADDED z-new (internal-state)",
                "MODIFIED b-mod (internal-state)",
                "MODIFIED c-mod (internal-state)",
                "REMOVED a-gone (internal-state)",
            ]
        );
        assert!(events.iter().all(|e| e.detected_at == now));
    }

    #[test]
    fn stale_events_are_rejected() {
        let now = Utc::now();
        let mut entries = Entries::new();
        let removed = ChangeEvent {
            kind: ChangeKind::Removed,
            name: "ghost".to_string(),
            source: SourceKind::InternalState,
            before: None,
            after: None,
            detected_at: now,
        };
        assert!(matches!(
            apply_event(&mut entries, &removed),
            Err(SyncError::StaleEvent { .. })
        ));
        entries.insert(
            "mine".to_string(),
            CatalogEntry::catalog_only("mine", "npx", vec![], BTreeMap::new(), None, now),
        );
        let orphan_mine = ChangeEvent {
            name: "mine".to_string(),
            ..removed
        };
        assert!(apply_event(&mut entries, &orphan_mine).is_err());
        assert!(!entries["mine"].is_orphaned());
    }

    fn arb_record(source: SourceKind) -> impl Strategy<Value = ServerRecord> {
        ("[a-e]", "[a-c]", any::<bool>()).prop_map(move |(name, arg, enabled)| ServerRecord {
            name,
            command: "docker".to_string(),
            args: vec![arg],
            env: BTreeMap::new(),
            source,
            scope: None,
            enabled,
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    fn arb_catalog() -> impl Strategy<Value = Entries> {
        let source = prop_oneof![
            Just(SourceKind::InternalState),
            Just(SourceKind::ContainerRuntime),
            Just(SourceKind::GatewayExpanded),
        ];
        let flags = (source, any::<bool>(), any::<bool>());
        proptest::collection::vec(flags, 0..6).prop_flat_map(|flags| {
            let recs: Vec<_> = flags
                .into_iter()
                .map(|(source, orphaned, held)| (arb_record(source), Just((orphaned, held))))
                .collect();
            recs.prop_map(|pairs| {
                let mut entries = Entries::new();
                for (record, (orphaned, held)) in pairs {
                    let mut entry = CatalogEntry::from_record(&record);
                    if held {
                        entry.disable_locally();
                    }
                    if orphaned {
                        entry.status = EntryStatus::Orphaned;
                    }
                    entries.insert(entry.name.clone(), entry);
                }
                entries
            })
        })
    }

    proptest! {
        #[test]
        fn applying_detected_events_converges(
            internal in proptest::collection::vec(arb_record(SourceKind::InternalState), 0..5),
            container in proptest::collection::vec(arb_record(SourceKind::ContainerRuntime), 0..5),
            catalog in arb_catalog(),
        ) {
            let now = DateTime::<Utc>::UNIX_EPOCH;
            let snaps = snapshots(vec![
                Snapshot::valid(SourceKind::InternalState, now, internal),
                Snapshot::valid(SourceKind::ContainerRuntime, now, container),
            ]);
            let detector = ChangeDetector::default();
            let mut entries = catalog;
            let first = detector.detect(&snaps, &entries, now).events;
            apply_all(&mut entries, &first);
            let again = detector.detect(&snaps, &entries, now).events;
            prop_assert!(again.is_empty(), "second pass produced {:?}", again);
        }

        #[test]
        fn invalid_snapshots_never_orphan_their_entries(
            internal in proptest::collection::vec(arb_record(SourceKind::InternalState), 0..5),
            container in proptest::collection::vec(arb_record(SourceKind::ContainerRuntime), 0..5),
            internal_down in any::<bool>(),
            catalog in arb_catalog(),
        ) {
            let now = DateTime::<Utc>::UNIX_EPOCH;
            let (down, snaps) = if internal_down {
                (SourceKind::InternalState, snapshots(vec![
                    Snapshot::unavailable(SourceKind::InternalState, now, "timed out"),
                    Snapshot::valid(SourceKind::ContainerRuntime, now, container),
                ]))
            } else {
                (SourceKind::ContainerRuntime, snapshots(vec![
                    Snapshot::valid(SourceKind::InternalState, now, internal),
                    Snapshot::unavailable(SourceKind::ContainerRuntime, now, "down"),
                ]))
            };
            let events = ChangeDetector::default().detect(&snaps, &catalog, now).events;
            for event in events.iter().filter(|e| e.kind == ChangeKind::Removed) {
                prop_assert_ne!(event.source.snapshot_source(), Some(down));
            }
        }
    }
}
