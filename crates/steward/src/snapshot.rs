// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of Steward.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Point-in-time backups of the managed file set
//!
//! Snapshots are written to a temp directory and renamed into place, so a
//! partially written snapshot is never visible. Retention keeps the most
//! recent K snapshots, and pruning only removes snapshots older than the
//! newest one that has been confirmed good - the only safe rollback target
//! is never deleted while an update's stability is still unverified.

use crate::error::{Result, StewardError};
use crate::manifest::{ManagedFileSet, Manifest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const SNAPSHOT_META: &str = "snapshot.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub manifest: Manifest,
}

#[derive(Debug)]
pub struct Snapshotter {
    snapshots_dir: PathBuf,
    managed: ManagedFileSet,
    retain: usize,
}

impl Snapshotter {
    pub fn new(snapshots_dir: impl Into<PathBuf>, managed: ManagedFileSet, retain: usize) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
            managed,
            retain: retain.max(1),
        }
    }

    fn snapshot_dir(&self, id: &str) -> PathBuf {
        self.snapshots_dir.join(id)
    }

    /// Copy every managed file into a new snapshot directory.
    /// Fails before copying anything if free space is insufficient.
    pub fn create_snapshot(&self) -> Result<Snapshot> {
        std::fs::create_dir_all(&self.snapshots_dir)?;

        let manifest = self.managed.capture_manifest()?;
        let required: u64 = manifest.files.iter().map(|f| f.size).sum();
        let available = free_space(&self.snapshots_dir)?;
        if available < required {
            return Err(StewardError::Io(std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                format!("snapshot needs {required} bytes, only {available} free"),
            )));
        }

        let created_at = Utc::now();
        let snapshot_id = created_at.format("%Y%m%dT%H%M%S%3fZ").to_string();
        let final_dir = self.snapshot_dir(&snapshot_id);
        let tmp_dir = self.snapshots_dir.join(format!("{snapshot_id}.tmp"));
        if tmp_dir.exists() {
            std::fs::remove_dir_all(&tmp_dir)?;
        }
        std::fs::create_dir_all(tmp_dir.join(FILES_DIR))?;

        for entry in &manifest.files {
            let rel = Path::new(&entry.path);
            self.managed.ensure_allowed(rel)?;

            let src = self.managed.root().join(rel);
            let dst = tmp_dir.join(FILES_DIR).join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(&src, &dst)?;
        }

        let snapshot = Snapshot {
            snapshot_id: snapshot_id.clone(),
            created_at,
            manifest,
        };
        let meta = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(tmp_dir.join(SNAPSHOT_META), meta)?;

        // Visible only once complete
        std::fs::rename(&tmp_dir, &final_dir)?;

        tracing::info!("Created snapshot {snapshot_id} ({} files)", snapshot.manifest.files.len());
        Ok(snapshot)
    }

    pub fn load_snapshot(&self, id: &str) -> Result<Snapshot> {
        let meta_path = self.snapshot_dir(id).join(SNAPSHOT_META);
        if !meta_path.exists() {
            return Err(StewardError::Snapshot(format!("snapshot {id} not found")));
        }
        let content = std::fs::read_to_string(meta_path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Copy the snapshot's files back over the managed set, path by path.
    /// Fails fast on the first unrecoverable error: the caller is told the
    /// restore is incomplete instead of the error being papered over.
    pub fn restore_snapshot(&self, id: &str) -> Result<()> {
        let snapshot = self.load_snapshot(id)?;
        let files_dir = self.snapshot_dir(id).join(FILES_DIR);

        for entry in &snapshot.manifest.files {
            let rel = Path::new(&entry.path);
            self.managed.ensure_allowed(rel)?;

            let src = files_dir.join(rel);
            let dst = self.managed.root().join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StewardError::Restore(format!(
                        "stopped at {}: {e} (managed set partially restored)",
                        entry.path
                    ))
                })?;
            }
            std::fs::copy(&src, &dst).map_err(|e| {
                StewardError::Restore(format!(
                    "stopped at {}: {e} (managed set partially restored)",
                    entry.path
                ))
            })?;
        }

        // Managed files that did not exist at snapshot time are removed, so
        // the restored tree matches the manifest exactly
        let snapshot_paths = snapshot.manifest.paths();
        for rel in self.managed.walk()? {
            let key = rel.to_string_lossy().replace('\\', "/");
            if snapshot_paths.contains(key.as_str()) {
                continue;
            }
            self.managed.ensure_allowed(&rel)?;
            std::fs::remove_file(self.managed.root().join(&rel)).map_err(|e| {
                StewardError::Restore(format!(
                    "stopped removing {key}: {e} (managed set partially restored)"
                ))
            })?;
        }

        tracing::info!("Restored snapshot {id}");
        Ok(())
    }

    /// Snapshot ids, oldest first. Timestamped ids sort chronologically.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.snapshots_dir.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.snapshots_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() && !name.ends_with(".tmp") {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete snapshots beyond the retention count, but only those older
    /// than the newest confirmed-good snapshot. With nothing confirmed yet,
    /// nothing is deleted.
    pub fn prune(&self, newest_confirmed: Option<&str>) -> Result<()> {
        let Some(confirmed) = newest_confirmed else {
            return Ok(());
        };

        let ids = self.list()?;
        if ids.len() <= self.retain {
            return Ok(());
        }

        let excess = ids.len() - self.retain;
        for id in ids.iter().take(excess) {
            if id.as_str() >= confirmed {
                break;
            }
            tracing::info!("Pruning snapshot {id}");
            std::fs::remove_dir_all(self.snapshot_dir(id))?;
        }
        Ok(())
    }
}

fn free_space(path: &Path) -> Result<u64> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| StewardError::Snapshot(format!("statvfs failed: {e}")))?;
    Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::hash_file;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Snapshotter) {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("live");
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::write(root.join("app/main.py"), b"v1 main").unwrap();
        std::fs::write(root.join("config.json"), b"{\"a\":1}").unwrap();

        let managed = ManagedFileSet::new(
            &root,
            vec!["py".to_string(), "json".to_string()],
            vec!["data".to_string()],
        );
        let snapshotter = Snapshotter::new(dir.path().join("snapshots"), managed, 2);
        (dir, snapshotter)
    }

    #[test]
    fn test_create_and_load() {
        let (_dir, snapshotter) = setup();
        let snapshot = snapshotter.create_snapshot().unwrap();
        assert_eq!(snapshot.manifest.files.len(), 2);

        let loaded = snapshotter.load_snapshot(&snapshot.snapshot_id).unwrap();
        assert_eq!(loaded.manifest, snapshot.manifest);
    }

    #[test]
    fn test_no_partial_snapshot_left_behind() {
        let (dir, snapshotter) = setup();
        snapshotter.create_snapshot().unwrap();

        for entry in std::fs::read_dir(dir.path().join("snapshots")).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.ends_with(".tmp"), "stray temp dir: {name}");
        }
    }

    #[test]
    fn test_restore_roundtrip_identity() {
        let (dir, snapshotter) = setup();
        let root = dir.path().join("live");

        let before_main = hash_file(&root.join("app/main.py")).unwrap();
        let snapshot = snapshotter.create_snapshot().unwrap();

        // Corrupt the live tree, add a stray managed file, then restore
        std::fs::write(root.join("app/main.py"), b"broken upgrade").unwrap();
        std::fs::write(root.join("config.json"), b"garbage").unwrap();
        std::fs::write(root.join("app/stray.py"), b"not in snapshot").unwrap();
        snapshotter.restore_snapshot(&snapshot.snapshot_id).unwrap();

        assert_eq!(hash_file(&root.join("app/main.py")).unwrap(), before_main);
        assert!(!root.join("app/stray.py").exists());
        let restored = snapshotter
            .load_snapshot(&snapshot.snapshot_id)
            .unwrap()
            .manifest;
        let live = ManagedFileSet::new(
            &root,
            vec!["py".to_string(), "json".to_string()],
            vec!["data".to_string()],
        )
        .capture_manifest()
        .unwrap();
        assert_eq!(live, restored);
    }

    #[test]
    fn test_restore_missing_snapshot_fails() {
        let (_dir, snapshotter) = setup();
        let result = snapshotter.restore_snapshot("20200101T000000000Z");
        assert!(matches!(result, Err(StewardError::Snapshot(_))));
    }

    #[test]
    fn test_prune_requires_confirmed_snapshot() {
        let (_dir, snapshotter) = setup();
        let s1 = snapshotter.create_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let s2 = snapshotter.create_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let s3 = snapshotter.create_snapshot().unwrap();

        // Nothing confirmed: nothing pruned, even beyond the retain count
        snapshotter.prune(None).unwrap();
        assert_eq!(snapshotter.list().unwrap().len(), 3);

        // Newest confirmed good: oldest goes, retain=2 kept
        snapshotter.prune(Some(&s3.snapshot_id)).unwrap();
        let remaining = snapshotter.list().unwrap();
        assert_eq!(remaining, vec![s2.snapshot_id.clone(), s3.snapshot_id.clone()]);
        assert!(!remaining.contains(&s1.snapshot_id));
    }

    #[test]
    fn test_prune_never_removes_the_confirmed_target() {
        let (_dir, snapshotter) = setup();
        let s1 = snapshotter.create_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _s2 = snapshotter.create_snapshot().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _s3 = snapshotter.create_snapshot().unwrap();

        // Only the oldest is confirmed: it is the rollback target, so the
        // excess entry cannot be pruned past it
        snapshotter.prune(Some(&s1.snapshot_id)).unwrap();
        assert_eq!(snapshotter.list().unwrap().len(), 3);
    }
}
