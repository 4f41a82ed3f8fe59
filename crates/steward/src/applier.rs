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

//! Applies a staged revision to the live tree
//!
//! The apply always overwrites the whole tracked set, not a diff-based
//! patch: staged files are copied in (temp-file-then-rename, so a running
//! worker never observes a partial write) and managed files absent from
//! the new manifest are deleted. A pre-apply snapshot is taken first and
//! restored on any failure; a failed restore is the one fatal,
//! non-recoverable condition in the subsystem.

use crate::error::{Result, StewardError};
use crate::fetcher::StagingHandle;
use crate::manifest::ManagedFileSet;
use crate::snapshot::{Snapshot, Snapshotter};
use std::path::Path;

#[derive(Debug)]
pub struct UpdateApplier {
    managed: ManagedFileSet,
}

impl UpdateApplier {
    pub fn new(managed: ManagedFileSet) -> Self {
        Self { managed }
    }

    /// Swap the staged files over the live installation.
    ///
    /// Returns the pre-apply snapshot on success so the caller can confirm
    /// it good once the new revision has proven stable.
    pub fn apply(&self, staging: &StagingHandle, snapshotter: &Snapshotter) -> Result<Snapshot> {
        // Fail closed: no live file is touched unless the rollback target
        // exists first
        let snapshot = snapshotter.create_snapshot()?;

        match self.apply_files(staging, &snapshot) {
            Ok(()) => {
                tracing::info!(
                    "Applied revision {} over the live tree",
                    staging.revision
                );
                Ok(snapshot)
            }
            Err(e) => {
                tracing::error!("Apply of {} failed: {e}; rolling back", staging.revision);
                match snapshotter.restore_snapshot(&snapshot.snapshot_id) {
                    Ok(()) => Err(StewardError::Apply {
                        rolled_back: true,
                        reason: e.to_string(),
                    }),
                    Err(restore_err) => {
                        tracing::error!(
                            "ROLLBACK FAILED, installation is in an unknown state: {restore_err}"
                        );
                        Err(StewardError::Apply {
                            rolled_back: false,
                            reason: format!("{e}; rollback failed: {restore_err}"),
                        })
                    }
                }
            }
        }
    }

    fn apply_files(&self, staging: &StagingHandle, previous: &Snapshot) -> Result<()> {
        for entry in &staging.manifest.files {
            let rel = Path::new(&entry.path);
            if !self.managed.is_managed(rel) {
                return Err(StewardError::Integrity(format!(
                    "staged file outside the managed set: {}",
                    entry.path
                )));
            }

            let src = staging.dir.join(rel);
            let dst = self.managed.root().join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }

            // Write next to the target, then rename over it; a failed
            // swap must not leave the temp file in the live tree
            let tmp = dst.with_extension("steward-tmp");
            if let Err(e) = std::fs::copy(&src, &tmp).and_then(|_| std::fs::rename(&tmp, &dst)) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        }

        // Managed files dropped by the new revision are deleted
        let staged_paths = staging.manifest.paths();
        for entry in &previous.manifest.files {
            if staged_paths.contains(entry.path.as_str()) {
                continue;
            }
            let rel = Path::new(&entry.path);
            self.managed.ensure_allowed(rel)?;
            let dst = self.managed.root().join(rel);
            if dst.exists() {
                std::fs::remove_file(&dst)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileEntry, Manifest};
    use sha2::{Digest, Sha256};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn managed_set(root: &Path) -> ManagedFileSet {
        ManagedFileSet::new(
            root,
            vec!["py".to_string(), "json".to_string()],
            vec!["data".to_string()],
        )
    }

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        staging: PathBuf,
        applier: UpdateApplier,
        snapshotter: Snapshotter,
    }

    fn setup() -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("live");
        let staging = dir.path().join("staging/r2");
        std::fs::create_dir_all(root.join("app")).unwrap();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(root.join("app/main.py"), b"v1 main").unwrap();
        std::fs::write(root.join("app/old.py"), b"v1 old").unwrap();

        let applier = UpdateApplier::new(managed_set(&root));
        let snapshotter = Snapshotter::new(dir.path().join("snapshots"), managed_set(&root), 3);
        Fixture {
            _dir: dir,
            root,
            staging,
            applier,
            snapshotter,
        }
    }

    fn stage(fixture: &Fixture, files: &[(&str, &[u8])]) -> StagingHandle {
        let mut entries = Vec::new();
        for (path, body) in files {
            let dst = fixture.staging.join(path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&dst, body).unwrap();
            entries.push(FileEntry {
                path: (*path).to_string(),
                sha256: sha(body),
                size: body.len() as u64,
            });
        }
        StagingHandle {
            revision: "r2".to_string(),
            dir: fixture.staging.clone(),
            manifest: Manifest { files: entries },
        }
    }

    #[test]
    fn test_apply_overwrites_and_deletes() {
        let fixture = setup();
        let staging = stage(
            &fixture,
            &[("app/main.py", b"v2 main"), ("app/new.py", b"v2 new")],
        );

        fixture.applier.apply(&staging, &fixture.snapshotter).unwrap();

        assert_eq!(
            std::fs::read(fixture.root.join("app/main.py")).unwrap(),
            b"v2 main"
        );
        assert_eq!(
            std::fs::read(fixture.root.join("app/new.py")).unwrap(),
            b"v2 new"
        );
        // Dropped from the new manifest, so deleted from the live tree
        assert!(!fixture.root.join("app/old.py").exists());
    }

    #[test]
    fn test_apply_returns_pre_apply_snapshot() {
        let fixture = setup();
        let staging = stage(&fixture, &[("app/main.py", b"v2 main")]);

        let snapshot = fixture.applier.apply(&staging, &fixture.snapshotter).unwrap();
        let paths = snapshot.manifest.paths();
        assert!(paths.contains("app/main.py"));
        assert!(paths.contains("app/old.py"));
    }

    #[test]
    fn test_partial_failure_rolls_back() {
        let fixture = setup();
        // "app/main.py" is a file, so staging a child under it makes the
        // copy step fail after earlier files were already written
        let staging = stage(
            &fixture,
            &[
                ("app/aaa.py", b"first"),
                ("app/main.py/child.py", b"cannot land"),
            ],
        );

        let before = managed_set(&fixture.root).capture_manifest().unwrap();
        let result = fixture.applier.apply(&staging, &fixture.snapshotter);

        assert!(matches!(
            result,
            Err(StewardError::Apply { rolled_back: true, .. })
        ));
        // Rollback restored the pre-apply tree exactly, including removing
        // the file the failed apply had already landed
        let after = managed_set(&fixture.root).capture_manifest().unwrap();
        assert_eq!(before, after);
        assert!(!fixture.root.join("app/aaa.py").exists());
        assert_eq!(
            std::fs::read(fixture.root.join("app/main.py")).unwrap(),
            b"v1 main"
        );
    }

    #[test]
    fn test_failed_swap_leaves_no_temp_file() {
        let fixture = setup();
        // A non-empty directory squatting on the destination lets the
        // temp copy land but makes the rename over it fail
        std::fs::create_dir_all(fixture.root.join("app/sub.py")).unwrap();
        std::fs::write(fixture.root.join("app/sub.py/keep.txt"), b"x").unwrap();
        let staging = stage(&fixture, &[("app/sub.py", b"new module")]);

        let result = fixture.applier.apply(&staging, &fixture.snapshotter);

        assert!(matches!(
            result,
            Err(StewardError::Apply { rolled_back: true, .. })
        ));
        assert!(!fixture.root.join("app/sub.steward-tmp").exists());
    }

    #[test]
    fn test_apply_rejects_unmanaged_staged_file() {
        let fixture = setup();
        let staging = stage(&fixture, &[("data/chats.json", b"user data")]);

        let result = fixture.applier.apply(&staging, &fixture.snapshotter);
        assert!(matches!(
            result,
            Err(StewardError::Apply { rolled_back: true, .. })
        ));
        assert!(!fixture.root.join("data/chats.json").exists());
    }
}
