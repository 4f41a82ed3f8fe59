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

//! Staged download of a remote revision
//!
//! Downloads the revision's manifest and every file it declares into an
//! isolated staging directory, then verifies structural completeness
//! (declared size and SHA-256 per file). A half-downloaded update is never
//! visible to the applier: any mismatch deletes the staging directory
//! before returning.
//!
//! Verification is self-consistency only - the manifest travels with the
//! revision and nothing is checked against a trusted signing key.

use crate::config::RemoteConfig;
use crate::error::{Result, StewardError};
use crate::manifest::{Manifest, hash_file};
use crate::revision::RevisionPointer;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const USER_AGENT: &str = "steward/0.3";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
const MANIFEST_NAME: &str = "manifest.json";

/// A fully downloaded and verified revision, ready for the applier
#[derive(Debug, Clone)]
pub struct StagingHandle {
    pub revision: String,
    pub dir: PathBuf,
    pub manifest: Manifest,
}

#[derive(Debug)]
pub struct UpdateFetcher {
    remote: RemoteConfig,
    staging_dir: PathBuf,
    client: reqwest::Client,
}

impl UpdateFetcher {
    pub fn new(remote: RemoteConfig, staging_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| StewardError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            remote,
            staging_dir: staging_dir.into(),
            client,
        })
    }

    fn content_url(&self, revision: &str, path: &str) -> String {
        let base = self
            .remote
            .content_base_url
            .as_deref()
            .unwrap_or("https://raw.githubusercontent.com");
        format!("{base}/{}/{revision}/{path}", self.remote.repo)
    }

    /// Download the revision into `staging/<revision>/` and verify it.
    pub async fn fetch(&self, revision: &RevisionPointer) -> Result<StagingHandle> {
        let dir = self.staging_dir.join(&revision.id);

        // Staging is ephemeral: wiped per fetch
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let result = self.fetch_into(revision, &dir).await;
        if result.is_err() && dir.exists() {
            let _ = std::fs::remove_dir_all(&dir);
        }
        let manifest = result?;

        Ok(StagingHandle {
            revision: revision.id.clone(),
            dir,
            manifest,
        })
    }

    async fn fetch_into(&self, revision: &RevisionPointer, dir: &Path) -> Result<Manifest> {
        let manifest_url = self.content_url(&revision.id, MANIFEST_NAME);
        let manifest_body = self.download(&manifest_url).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_body).map_err(|e| {
            StewardError::Integrity(format!("malformed remote manifest: {e}"))
        })?;

        for entry in &manifest.files {
            validate_rel_path(&entry.path)?;

            let body = self.download(&self.content_url(&revision.id, &entry.path)).await?;
            let dst = dir.join(&entry.path);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&dst, &body)?;
        }

        verify_staging(dir, &manifest)?;
        tracing::info!(
            "Staged revision {} ({} files)",
            revision.id,
            manifest.files.len()
        );
        Ok(manifest)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(url);
        if let Some(ref token) = self.remote.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StewardError::Network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(StewardError::Network(format!(
                "Download of {url} failed with status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| StewardError::Network(format!("Failed to read body: {e}")))?;
        Ok(bytes.to_vec())
    }
}

/// Every declared path must exist with the declared size and hash
fn verify_staging(dir: &Path, manifest: &Manifest) -> Result<()> {
    for entry in &manifest.files {
        let path = dir.join(&entry.path);
        if !path.exists() {
            return Err(StewardError::Integrity(format!(
                "declared file missing from staging: {}",
                entry.path
            )));
        }
        let (sha256, size) = hash_file(&path)?;
        if size != entry.size {
            return Err(StewardError::Integrity(format!(
                "{}: declared {} bytes, staged {size}",
                entry.path, entry.size
            )));
        }
        if sha256 != entry.sha256 {
            return Err(StewardError::Integrity(format!(
                "{}: checksum mismatch",
                entry.path
            )));
        }
    }
    Ok(())
}

fn validate_rel_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let safe = !path.is_empty()
        && p.components().all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(StewardError::Integrity(format!(
            "unsafe path in remote manifest: {path}"
        )))
    }
}
