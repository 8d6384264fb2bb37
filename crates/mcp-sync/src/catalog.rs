//! Persistent catalog of every server the manager knows about.
//!
//! Stored as one JSON document (`{version, revision, entries}`) replaced
//! atomically on every write. `revision` increases with each write so a
//! read-modify-write can tell when another writer got there first.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::CatalogError;
use crate::model::CatalogEntry;

pub const CATALOG_VERSION: u32 = 1;
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Retries of a conflicting `update` before giving up.
const UPDATE_ATTEMPTS: u32 = 2;

pub type Entries = BTreeMap<String, CatalogEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    revision: u64,
    #[serde(default)]
    entries: Entries,
}

impl CatalogFile {
    fn empty() -> Self {
        Self {
            version: CATALOG_VERSION,
            revision: 0,
            entries: Entries::new(),
        }
    }
}

enum Stored {
    Written,
    Conflict { found: u64 },
}

pub struct Catalog {
    path: PathBuf,
    io_timeout: Duration,
    lock: Mutex<()>,
}

impl Catalog {
    pub fn new(path: impl Into<PathBuf>, io_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            io_timeout,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current entries. A missing file is an empty catalog; a damaged one is
    /// an error, never an empty catalog.
    pub async fn read(&self) -> Result<Entries, CatalogError> {
        let _held = self.lock.lock().await;
        Ok(self.load().await?.entries)
    }

    /// Replace all entries unconditionally.
    pub async fn write(&self, entries: Entries) -> Result<(), CatalogError> {
        let _held = self.lock.lock().await;
        let current = self.load().await?;
        match self
            .store(current.revision, entries, CancellationToken::new())
            .await?
        {
            Stored::Written => Ok(()),
            Stored::Conflict { .. } => Err(CatalogError::WriteConflict { attempts: 1 }),
        }
    }

    /// Transactional read-modify-write. `f` may run more than once when the
    /// file changes underneath; after the retry is exhausted the conflict is
    /// returned. Nothing is written if `f` leaves the entries unchanged.
    pub async fn update<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnMut(&mut Entries) -> T + Send,
        T: Send,
    {
        self.update_unless(&CancellationToken::new(), f).await
    }

    /// [`Catalog::update`] that gives up with [`CatalogError::Abandoned`]
    /// once `abandon` is cancelled. The token is checked on the blocking
    /// writer right before the rename, so a caller that stopped waiting
    /// never has its write land afterwards.
    pub async fn update_unless<T, F>(
        &self,
        abandon: &CancellationToken,
        mut f: F,
    ) -> Result<T, CatalogError>
    where
        F: FnMut(&mut Entries) -> T + Send,
        T: Send,
    {
        let _held = self.lock.lock().await;
        for attempt in 1..=UPDATE_ATTEMPTS {
            let loaded = self.load().await?;
            let mut entries = loaded.entries.clone();
            let out = f(&mut entries);
            if entries == loaded.entries {
                return Ok(out);
            }
            match self.store(loaded.revision, entries, abandon.clone()).await? {
                Stored::Written => return Ok(out),
                Stored::Conflict { found } => {
                    tracing::warn!(
                        attempt,
                        expected = loaded.revision,
                        found,
                        "catalog changed during update"
                    );
                }
            }
        }
        Err(CatalogError::WriteConflict {
            attempts: UPDATE_ATTEMPTS,
        })
    }

    /// Delete orphaned entries. Returns the removed names.
    pub async fn compact(&self) -> Result<Vec<String>, CatalogError> {
        let removed = self
            .update(|entries| {
                let orphans: Vec<String> = entries
                    .values()
                    .filter(|e| e.is_orphaned())
                    .map(|e| e.name.clone())
                    .collect();
                for name in &orphans {
                    entries.remove(name);
                }
                orphans
            })
            .await?;
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "compacted catalog");
        }
        Ok(removed)
    }

    async fn load(&self) -> Result<CatalogFile, CatalogError> {
        let path = self.path.clone();
        self.blocking(move || read_file(&path)).await
    }

    async fn store(
        &self,
        expected: u64,
        entries: Entries,
        abandon: CancellationToken,
    ) -> Result<Stored, CatalogError> {
        let path = self.path.clone();
        self.blocking(move || {
            let found = read_file(&path)?.revision;
            if found != expected {
                return Ok(Stored::Conflict { found });
            }
            let file = CatalogFile {
                version: CATALOG_VERSION,
                revision: expected + 1,
                entries,
            };
            let io = |source| CatalogError::Io {
                path: path.clone(),
                source,
            };
            let staged = stage_json(&path, &file).map_err(io)?;
            if abandon.is_cancelled() {
                return Err(CatalogError::Abandoned);
            }
            staged.persist(&path).map_err(|e| io(e.error))?;
            Ok(Stored::Written)
        })
        .await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce() -> Result<T, CatalogError> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::time::timeout(self.io_timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(CatalogError::Worker(join.to_string())),
            Err(_) => Err(CatalogError::TimedOut(self.io_timeout)),
        }
    }
}

fn read_file(path: &Path) -> Result<CatalogFile, CatalogError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(CatalogFile::empty()),
        Err(source) => {
            return Err(CatalogError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let file: CatalogFile =
        serde_json::from_str(&content).map_err(|source| CatalogError::Format {
            path: path.to_path_buf(),
            source,
        })?;
    if file.version > CATALOG_VERSION {
        return Err(CatalogError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: file.version,
        });
    }
    Ok(file)
}

/// Serialize `value` to a temp file next to `path`, then rename over it.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    stage_json(path, value)?.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Synced temp file in `path`'s directory, ready to be persisted over it.
fn stage_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::model::{EntryStatus, ServerRecord, SourceKind};

    fn entry(name: &str) -> CatalogEntry {
        CatalogEntry::from_record(&ServerRecord {
            name: name.to_string(),
            command: "npx".to_string(),
            args: vec![name.to_string()],
            env: BTreeMap::new(),
            source: SourceKind::InternalState,
            scope: None,
            enabled: true,
            last_seen: Utc::now(),
        })
    }

    fn catalog(dir: &tempfile::TempDir) -> Catalog {
        Catalog::new(dir.path().join("catalog.json"), DEFAULT_IO_TIMEOUT)
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(catalog(&dir).read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_then_read_bumps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        let mut entries = Entries::new();
        entries.insert("fs".to_string(), entry("fs"));
        cat.write(entries.clone()).await.unwrap();
        cat.write(entries.clone()).await.unwrap();
        assert_eq!(cat.read().await.unwrap(), entries);

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(cat.path()).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["revision"], 2);
        assert_eq!(raw["entries"]["fs"]["origin_source"], "internal-state");
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error_not_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        std::fs::write(cat.path(), "{ not json").unwrap();
        assert!(matches!(
            cat.read().await,
            Err(CatalogError::Format { .. })
        ));
        std::fs::write(cat.path(), r#"{"version": 9, "entries": {}}"#).unwrap();
        assert!(matches!(
            cat.read().await,
            Err(CatalogError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[tokio::test]
    async fn update_retries_once_on_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        let path = cat.path().to_path_buf();
        let mut calls = 0;
        cat.update(|entries| {
            calls += 1;
            if calls == 1 {
                // Another writer lands between our read and our write.
                let mut other = Entries::new();
                other.insert("other".to_string(), entry("other"));
                let file = CatalogFile {
                    version: CATALOG_VERSION,
                    revision: 7,
                    entries: other,
                };
                write_json_atomic(&path, &file).unwrap();
            }
            entries.insert("fs".to_string(), entry("fs"));
        })
        .await
        .unwrap();
        assert_eq!(calls, 2);
        let names: Vec<_> = cat.read().await.unwrap().into_keys().collect();
        assert_eq!(names, vec!["fs", "other"]);
    }

    #[tokio::test]
    async fn update_gives_up_after_second_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        let path = cat.path().to_path_buf();
        let mut revision = 10;
        let err = cat
            .update(|entries| {
                revision += 1;
                let file = CatalogFile {
                    version: CATALOG_VERSION,
                    revision,
                    entries: Entries::new(),
                };
                write_json_atomic(&path, &file).unwrap();
                entries.insert("fs".to_string(), entry("fs"));
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::WriteConflict { attempts: 2 }));
    }

    #[tokio::test]
    async fn abandoned_update_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        let mut entries = Entries::new();
        entries.insert("fs".to_string(), entry("fs"));
        cat.write(entries.clone()).await.unwrap();

        let abandon = CancellationToken::new();
        abandon.cancel();
        let err = cat
            .update_unless(&abandon, |entries| {
                entries.insert("late".to_string(), entry("late"));
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Abandoned));
        assert_eq!(cat.read().await.unwrap(), entries);

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn compact_removes_only_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let cat = catalog(&dir);
        let mut gone = entry("gone");
        gone.status = EntryStatus::Orphaned;
        let mut entries = Entries::new();
        entries.insert("gone".to_string(), gone);
        entries.insert("kept".to_string(), entry("kept"));
        cat.write(entries).await.unwrap();

        assert_eq!(cat.compact().await.unwrap(), vec!["gone"]);
        let names: Vec<_> = cat.read().await.unwrap().into_keys().collect();
        assert_eq!(names, vec!["kept"]);
        assert!(cat.compact().await.unwrap().is_empty());
    }
}
