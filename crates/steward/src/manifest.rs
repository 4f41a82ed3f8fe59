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

//! Managed file set and content-hash manifests
//!
//! The managed set is the only part of the installation the updater may
//! read, write, or delete. Membership is policy, not accident: a closed
//! extension allow-list plus an explicit deny-list of user-data
//! directories, checked before every file operation.

use crate::error::{Result, StewardError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// One managed file: relative path, content hash, size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub sha256: String,
    pub size: u64,
}

/// Ordered list of every managed file at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<FileEntry>,
}

impl Manifest {
    pub fn paths(&self) -> BTreeSet<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// The authoritative definition of what is update-managed
#[derive(Debug, Clone)]
pub struct ManagedFileSet {
    root: PathBuf,
    extensions: Vec<String>,
    deny: Vec<String>,
}

impl ManagedFileSet {
    pub fn new(root: impl Into<PathBuf>, extensions: Vec<String>, deny: Vec<String>) -> Self {
        Self {
            root: root.into(),
            extensions,
            deny,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject anything that escapes the root or touches a denied directory.
    /// Called before every read, write, or delete on the live tree.
    pub fn ensure_allowed(&self, rel: &Path) -> Result<()> {
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                Component::ParentDir
                | Component::RootDir
                | Component::Prefix(_)
                | Component::CurDir => {
                    return Err(StewardError::Integrity(format!(
                        "path escapes the managed root: {}",
                        rel.display()
                    )));
                }
            }
        }

        if let Some(first) = rel.components().next()
            && let Component::Normal(name) = first
            && self.deny.iter().any(|d| name == d.as_str())
        {
            return Err(StewardError::Integrity(format!(
                "path is in a protected directory: {}",
                rel.display()
            )));
        }

        Ok(())
    }

    /// Whether a relative path belongs to the managed set
    pub fn is_managed(&self, rel: &Path) -> bool {
        if self.ensure_allowed(rel).is_err() {
            return false;
        }
        match rel.extension().and_then(|e| e.to_str()) {
            Some(ext) => self.extensions.iter().any(|allowed| allowed == ext),
            None => false,
        }
    }

    /// Walk the live tree, returning sorted relative paths of managed files
    pub fn walk(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        if !self.root.exists() {
            return Ok(paths);
        }

        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                StewardError::Io(std::io::Error::other(format!(
                    "walk failed under {}: {e}",
                    self.root.display()
                )))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| StewardError::Integrity(format!("walk escaped root: {e}")))?
                .to_path_buf();
            if self.is_managed(&rel) {
                paths.push(rel);
            }
        }

        paths.sort();
        Ok(paths)
    }

    /// Hash every managed file into an ordered manifest
    pub fn capture_manifest(&self) -> Result<Manifest> {
        let mut files = Vec::new();
        for rel in self.walk()? {
            let abs = self.root.join(&rel);
            let (sha256, size) = hash_file(&abs)?;
            files.push(FileEntry {
                path: rel.to_string_lossy().replace('\\', "/"),
                sha256,
                size,
            });
        }
        Ok(Manifest { files })
    }
}

/// SHA-256 of a file's contents, plus its size
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((format!("{:x}", hasher.finalize()), size))
}
