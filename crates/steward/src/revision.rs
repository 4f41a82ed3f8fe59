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

//! Remote revision source
//!
//! Queries the default-branch head of the remote repository. Every call is
//! a fresh query with its own timeout; retry policy belongs to the
//! controller's poll loop, never to this module.

use crate::config::RemoteConfig;
use crate::error::{Result, StewardError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const USER_AGENT: &str = "steward/0.3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// An immutable pointer to one revision of the remote tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPointer {
    /// Opaque revision identifier (content hash of the branch head)
    pub id: String,
    /// Short commit message
    pub message: String,
    /// When this pointer was observed locally
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct BranchHead {
    sha: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize, Serialize)]
struct CommitDetail {
    message: String,
}

#[derive(Debug, Clone)]
pub struct RevisionSource {
    remote: RemoteConfig,
    client: reqwest::Client,
}

impl RevisionSource {
    pub fn new(remote: RemoteConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StewardError::Network(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { remote, client })
    }

    /// Fetch the current branch head. Pure query, no side effects.
    pub async fn get_latest(&self) -> Result<RevisionPointer> {
        let base_url = self
            .remote
            .api_base_url
            .as_deref()
            .unwrap_or("https://api.github.com");
        let url = format!(
            "{base_url}/repos/{}/commits/{}",
            self.remote.repo, self.remote.branch
        );

        let mut request = self.client.get(&url);
        if let Some(ref token) = self.remote.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StewardError::Network(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(StewardError::Network(format!(
                "Revision query failed with {status}: {body}"
            )));
        }

        let head: BranchHead = response
            .json()
            .await
            .map_err(|e| StewardError::Network(format!("Malformed head metadata: {e}")))?;

        if head.sha.is_empty() {
            return Err(StewardError::Network(
                "Branch head has an empty revision id".to_string(),
            ));
        }

        // First line of the commit message is enough for job records
        let message = head
            .commit
            .message
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();

        Ok(RevisionPointer {
            id: head.sha,
            message,
            observed_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn remote_for(server: &mockito::ServerGuard) -> RemoteConfig {
        RemoteConfig {
            repo: "acme/worker".to_string(),
            branch: "main".to_string(),
            token: None,
            api_base_url: Some(server.url()),
            content_base_url: None,
        }
    }

    #[tokio::test]
    async fn test_get_latest_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/worker/commits/main")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"sha":"9f2c1aa0","commit":{"message":"fix prompt cache\n\nlong body"}}"#,
            )
            .create_async()
            .await;

        let source = RevisionSource::new(remote_for(&server)).unwrap();
        let head = source.get_latest().await.unwrap();

        assert_eq!(head.id, "9f2c1aa0");
        assert_eq!(head.message, "fix prompt cache");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_latest_server_error() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/worker/commits/main")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let source = RevisionSource::new(remote_for(&server)).unwrap();
        let result = source.get_latest().await;

        assert!(matches!(result, Err(StewardError::Network(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_latest_malformed_body() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/worker/commits/main")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"unexpected":true}"#)
            .create_async()
            .await;

        let source = RevisionSource::new(remote_for(&server)).unwrap();
        let result = source.get_latest().await;

        assert!(matches!(result, Err(StewardError::Network(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_latest_private_repo_sends_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/repos/acme/worker/commits/main")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sha":"abc","commit":{"message":"m"}}"#)
            .create_async()
            .await;

        let mut remote = remote_for(&server);
        remote.token = Some("test-token".to_string());
        let source = RevisionSource::new(remote).unwrap();
        assert!(source.get_latest().await.is_ok());

        mock.assert_async().await;
    }
}
