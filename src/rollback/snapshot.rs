use super::SnapshotError;
use crate::execution::operations::summary_path_for;
use crate::shared::fs_atomic::{atomic_write_file, copy_file_atomic};
use crate::shared::ids::random_suffix;
use crate::shared::vault_access::resolve_in_vault;
use crate::task::{Operation, Task};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";
pub const TASK_COPY_NAME: &str = "task.md";
const FILES_DIR: &str = "files";
const DIR_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const CREATE_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Vault-relative path the bytes were captured from.
    pub original: String,
    /// Path inside the snapshot directory.
    pub stored: String,
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub task_ref: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    /// Vault-relative step targets that did not exist at capture time.
    #[serde(default)]
    pub absent: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: SnapshotManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreStats {
    pub restored: usize,
    pub removed: usize,
}

/// Timestamp-prefixed archive of pre-execution state under the vault's
/// rollback directory. Snapshots are immutable once written.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    vault_root: PathBuf,
    archive_root: PathBuf,
}

impl SnapshotStore {
    pub fn new(vault_root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            vault_root: vault_root.into(),
            archive_root: archive_root.into(),
        }
    }

    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    /// Confirms the archive directory exists and accepts writes.
    pub fn check_writable(&self) -> Result<(), SnapshotError> {
        if !self.archive_root.is_dir() {
            return Err(SnapshotError::ArchiveUnavailable {
                path: self.archive_root.display().to_string(),
                reason: "directory does not exist".to_string(),
            });
        }
        let marker = self
            .archive_root
            .join(format!(".write-check-{}", std::process::id()));
        fs::write(&marker, b"check").map_err(|err| SnapshotError::ArchiveUnavailable {
            path: self.archive_root.display().to_string(),
            reason: err.to_string(),
        })?;
        let _ = fs::remove_file(&marker);
        Ok(())
    }

    pub fn create(&self, task: &Task, now: DateTime<Utc>) -> Result<Snapshot, SnapshotError> {
        fs::create_dir_all(&self.archive_root).map_err(|e| io_error(&self.archive_root, e))?;
        let (id, dir) = self.allocate_dir(task, now)?;

        let mut entries = Vec::new();
        let task_bytes =
            fs::read(&task.source_path).map_err(|e| io_error(&task.source_path, e))?;
        let task_copy = dir.join(TASK_COPY_NAME);
        atomic_write_file(&task_copy, &task_bytes).map_err(|e| io_error(&task_copy, e))?;
        entries.push(ManifestEntry {
            original: self.relative(&task.source_path),
            stored: TASK_COPY_NAME.to_string(),
            sha256: sha256_hex(&task_bytes),
            size: task_bytes.len() as u64,
        });

        let mut captured = BTreeSet::new();
        captured.insert(self.relative(&task.source_path));
        let mut absent = BTreeSet::new();
        for target in self.step_targets(task) {
            let relative = self.relative(&target);
            if captured.contains(&relative) {
                continue;
            }
            if target.is_file() {
                let stored = format!("{FILES_DIR}/{relative}");
                let stored_path = dir.join(&stored);
                let size =
                    copy_file_atomic(&target, &stored_path).map_err(|e| io_error(&target, e))?;
                let bytes = fs::read(&stored_path).map_err(|e| io_error(&stored_path, e))?;
                entries.push(ManifestEntry {
                    original: relative.clone(),
                    stored,
                    sha256: sha256_hex(&bytes),
                    size,
                });
                captured.insert(relative);
            } else if !target.exists() {
                absent.insert(relative);
            }
        }

        let manifest = SnapshotManifest {
            task_ref: task.id.to_string(),
            created_at: now,
            entries,
            absent: absent.into_iter().collect(),
        };
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let encoded = serde_json::to_vec_pretty(&manifest)
            .map_err(|source| json_error(&manifest_path, source))?;
        atomic_write_file(&manifest_path, &encoded).map_err(|e| io_error(&manifest_path, e))?;

        let snapshot = Snapshot { id, dir, manifest };
        self.verify(&snapshot)?;
        Ok(snapshot)
    }

    fn allocate_dir(&self, task: &Task, now: DateTime<Utc>) -> Result<(String, PathBuf), SnapshotError> {
        let prefix = now.format(DIR_TIMESTAMP_FORMAT);
        for _ in 0..CREATE_ATTEMPTS {
            let suffix = random_suffix().map_err(SnapshotError::Randomness)?;
            let id = format!("{prefix}-{}-{suffix}", task.id.stem());
            let dir = self.archive_root.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok((id, dir)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(io_error(&dir, err)),
            }
        }
        Err(SnapshotError::Randomness(
            "could not allocate a unique snapshot directory".to_string(),
        ))
    }

    /// Re-reads every captured file and compares its digest with the manifest.
    pub fn verify(&self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        for entry in &snapshot.manifest.entries {
            let stored = snapshot.dir.join(&entry.stored);
            let bytes = fs::read(&stored).map_err(|e| io_error(&stored, e))?;
            if sha256_hex(&bytes) != entry.sha256 {
                return Err(SnapshotError::Verification {
                    path: stored.display().to_string(),
                    reason: "digest mismatch".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn load(&self, snapshot_ref: &str) -> Result<Snapshot, SnapshotError> {
        if snapshot_ref.contains('/') || snapshot_ref.contains('\\') || snapshot_ref.starts_with('.') {
            return Err(SnapshotError::NotFound {
                snapshot_ref: snapshot_ref.to_string(),
            });
        }
        let dir = self.archive_root.join(snapshot_ref);
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        let raw = match fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound {
                    snapshot_ref: snapshot_ref.to_string(),
                })
            }
            Err(err) => return Err(io_error(&manifest_path, err)),
        };
        let manifest: SnapshotManifest =
            serde_json::from_str(&raw).map_err(|source| json_error(&manifest_path, source))?;
        Ok(Snapshot {
            id: snapshot_ref.to_string(),
            dir,
            manifest,
        })
    }

    /// Writes captured bytes back to their original locations and removes
    /// targets that did not exist when the snapshot was taken.
    pub fn restore_files(&self, snapshot: &Snapshot) -> Result<RestoreStats, SnapshotError> {
        self.verify(snapshot)?;
        let mut stats = RestoreStats::default();

        let mut absent: Vec<PathBuf> = snapshot
            .manifest
            .absent
            .iter()
            .map(|relative| self.vault_root.join(relative))
            .collect();
        // Deepest first so created files go before the folders holding them.
        absent.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
        for path in &absent {
            if path.is_file() {
                fs::remove_file(path).map_err(|e| io_error(path, e))?;
                stats.removed += 1;
            } else if path.is_dir() && fs::remove_dir(path).is_ok() {
                stats.removed += 1;
            }
        }

        for entry in &snapshot.manifest.entries {
            let stored = snapshot.dir.join(&entry.stored);
            let original = resolve_in_vault(&self.vault_root, &entry.original).map_err(|err| {
                SnapshotError::Verification {
                    path: entry.original.clone(),
                    reason: err.to_string(),
                }
            })?;
            copy_file_atomic(&stored, &original).map_err(|e| io_error(&original, e))?;
            stats.restored += 1;
        }
        Ok(stats)
    }

    pub fn list(&self) -> Result<Vec<String>, SnapshotError> {
        let entries = match fs::read_dir(&self.archive_root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.archive_root, err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.archive_root, e))?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Removes snapshots older than `retention_days`; returns the removed ids.
    pub fn purge_expired(
        &self,
        now: DateTime<Utc>,
        retention_days: u32,
    ) -> Result<Vec<String>, SnapshotError> {
        let cutoff = now - Duration::days(i64::from(retention_days));
        let mut removed = Vec::new();
        for id in self.list()? {
            let created = match self.load(&id) {
                Ok(snapshot) => Some(snapshot.manifest.created_at),
                Err(_) => created_from_dir_name(&id),
            };
            let Some(created) = created else {
                continue;
            };
            if created < cutoff {
                let dir = self.archive_root.join(&id);
                fs::remove_dir_all(&dir).map_err(|e| io_error(&dir, e))?;
                removed.push(id);
            }
        }
        Ok(removed)
    }

    /// Every file location a task's steps may write or consume.
    fn step_targets(&self, task: &Task) -> Vec<PathBuf> {
        let mut targets = Vec::new();
        for step in &task.steps {
            let source = step
                .path
                .as_deref()
                .and_then(|raw| resolve_in_vault(&self.vault_root, raw).ok());
            if let Some(source) = &source {
                targets.push(source.clone());
            }
            match (&step.op, step.to.as_deref()) {
                (Operation::RenameFile, Some(name)) => {
                    if let Some(parent) = source.as_ref().and_then(|s| s.parent()) {
                        if let Ok(target) =
                            resolve_in_vault(&self.vault_root, &parent.join(name).display().to_string())
                        {
                            targets.push(target);
                        }
                    }
                }
                (_, Some(raw)) => {
                    if let Ok(target) = resolve_in_vault(&self.vault_root, raw) {
                        targets.push(target);
                    }
                }
                (Operation::SummarizeContent, None) => {
                    let base = source.clone().unwrap_or_else(|| task.source_path.clone());
                    targets.push(summary_path_for(&base));
                }
                (_, None) => {}
            }
        }
        targets
    }

    fn relative(&self, path: &Path) -> String {
        let canonical_root =
            fs::canonicalize(&self.vault_root).unwrap_or_else(|_| self.vault_root.clone());
        let relative = path
            .strip_prefix(&canonical_root)
            .or_else(|_| path.strip_prefix(&self.vault_root))
            .unwrap_or(path);
        relative.display().to_string()
    }
}

fn created_from_dir_name(id: &str) -> Option<DateTime<Utc>> {
    let prefix = id.get(..15)?;
    NaiveDateTime::parse_from_str(prefix, DIR_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

fn io_error(path: &Path, source: std::io::Error) -> SnapshotError {
    SnapshotError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> SnapshotError {
    SnapshotError::Json {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::ids::{StepId, TaskId};
    use crate::task::Step;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fixture(vault: &Path) -> Task {
        fs::create_dir_all(vault.join("Needs_Action")).expect("mkdir");
        fs::create_dir_all(vault.join("Done")).expect("mkdir");
        fs::write(vault.join("Needs_Action/T-1.md"), "---\ntype: x\n---\nbody\n").expect("task");
        fs::write(vault.join("Done/existing.md"), "original").expect("existing");
        let mut task = Task::new(
            TaskId::parse("T-1.md").expect("id"),
            vault.join("Needs_Action/T-1.md"),
        );
        let mut overwrite = Step::new(StepId::parse("s1").expect("id"), Operation::CopyFile);
        overwrite.path = Some("Done/existing.md".to_string());
        overwrite.to = Some("Done/new/created.md".to_string());
        task.steps = vec![overwrite];
        task
    }

    #[test]
    fn directory_name_is_timestamp_prefixed() {
        let dir = tempdir().expect("tempdir");
        let task = fixture(dir.path());
        let store = SnapshotStore::new(dir.path(), dir.path().join("Rollback_Archive"));
        let now = Utc
            .with_ymd_and_hms(2026, 4, 1, 12, 30, 45)
            .single()
            .expect("timestamp");
        let snapshot = store.create(&task, now).expect("snapshot");
        assert!(snapshot.id.starts_with("20260401-123045-T-1-"));
        assert!(snapshot.dir.join(MANIFEST_FILE_NAME).is_file());
        assert!(snapshot.dir.join(TASK_COPY_NAME).is_file());
        assert_eq!(snapshot.manifest.entries.len(), 2);
        assert_eq!(snapshot.manifest.absent, vec!["Done/new/created.md".to_string()]);
        assert_eq!(created_from_dir_name(&snapshot.id), Some(now));
    }

    #[test]
    fn restore_is_byte_identical_and_removes_new_files() {
        let dir = tempdir().expect("tempdir");
        let task = fixture(dir.path());
        let store = SnapshotStore::new(dir.path(), dir.path().join("Rollback_Archive"));
        let before_task = fs::read(&task.source_path).expect("read task");
        let snapshot = store.create(&task, Utc::now()).expect("snapshot");

        fs::write(&task.source_path, "mutated").expect("mutate task");
        fs::write(dir.path().join("Done/existing.md"), "changed").expect("mutate file");
        fs::create_dir_all(dir.path().join("Done/new")).expect("mkdir");
        fs::write(dir.path().join("Done/new/created.md"), "new").expect("create");

        let stats = store.restore_files(&snapshot).expect("restore");
        assert_eq!(stats.restored, 2);
        assert_eq!(fs::read(&task.source_path).expect("read"), before_task);
        assert_eq!(
            fs::read_to_string(dir.path().join("Done/existing.md")).expect("read"),
            "original"
        );
        assert!(!dir.path().join("Done/new/created.md").exists());
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let dir = tempdir().expect("tempdir");
        let task = fixture(dir.path());
        let store = SnapshotStore::new(dir.path(), dir.path().join("Rollback_Archive"));
        let snapshot = store.create(&task, Utc::now()).expect("snapshot");
        fs::write(snapshot.dir.join(TASK_COPY_NAME), "tampered").expect("tamper");
        let err = store.restore_files(&snapshot).expect_err("verification");
        assert!(matches!(err, SnapshotError::Verification { .. }));
    }

    #[test]
    fn purge_removes_only_expired_snapshots() {
        let dir = tempdir().expect("tempdir");
        let task = fixture(dir.path());
        let store = SnapshotStore::new(dir.path(), dir.path().join("Rollback_Archive"));
        let now = Utc::now();
        let old = store
            .create(&task, now - Duration::days(10))
            .expect("old snapshot");
        let fresh = store.create(&task, now).expect("fresh snapshot");
        fs::create_dir_all(store.archive_root().join("not-a-snapshot")).expect("stray dir");

        let removed = store.purge_expired(now, 7).expect("purge");
        assert_eq!(removed, vec![old.id.clone()]);
        assert!(!old.dir.exists());
        assert!(fresh.dir.exists());
        assert!(store.archive_root().join("not-a-snapshot").exists());
    }

    #[test]
    fn archive_write_check_reports_missing_directory() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), dir.path().join("Rollback_Archive"));
        assert!(matches!(
            store.check_writable(),
            Err(SnapshotError::ArchiveUnavailable { .. })
        ));
        fs::create_dir_all(store.archive_root()).expect("mkdir");
        store.check_writable().expect("writable");
    }
}
