use std::{
    fs::{self, File},
    io::{self, Cursor},
    path::Path,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use carryover_core::{config::GitHubConfig, models::UnpackedArtifact};
use http::StatusCode;
use octocrab::{GitHubError, Octocrab, models::ArtifactId, params::actions::ArchiveFormat};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

/// The two commit hashes the pipeline cares about, fetched once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestSnapshot {
    pub base_sha: String,
    pub head_sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    pub run_number: u64,
    pub status: String,
    pub conclusion: Option<String>,
    pub head_sha: String,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool { self.status == "completed" }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub id: u64,
    pub name: String,
    pub size_in_bytes: u64,
    #[serde(default)]
    pub expired: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

#[derive(Deserialize)]
struct PullRequestResponse {
    base: CommitRef,
    head: CommitRef,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Deserialize)]
struct WorkflowRunList {
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct ArtifactList {
    total_count: u64,
    artifacts: Vec<Artifact>,
}

#[derive(Serialize)]
struct PageParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    per_page: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page: Option<u32>,
}

#[derive(Serialize)]
struct RunListParams<'a> {
    head_sha: &'a str,
    per_page: u8,
}

impl GitHub {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let mut builder = Octocrab::builder().personal_token(config.token.clone());
        if let Some(api_url) = &config.api_url {
            builder = builder
                .base_uri(api_url.clone())
                .with_context(|| format!("Invalid API base URL '{api_url}'"))?;
        }
        let client = builder.build().context("Failed to create GitHub client")?;
        Ok(Self { client })
    }

    pub async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        number: u64,
    ) -> Result<PullRequestSnapshot> {
        let pull: PullRequestResponse = self
            .client
            .get(format!("/repos/{owner}/{repo}/pulls/{number}"), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch pull request #{number}"))?;
        Ok(PullRequestSnapshot { base_sha: pull.base.sha, head_sha: pull.head.sha })
    }

    /// The most recent run of `workflow_id` for `head_sha`, if any. Only the
    /// first entry of the first page is requested; if multiple runs share the
    /// head commit, the API's default ordering decides.
    pub async fn latest_workflow_run(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: &str,
        head_sha: &str,
    ) -> Result<Option<WorkflowRun>> {
        let response: WorkflowRunList = self
            .client
            .get(
                format!("/repos/{owner}/{repo}/actions/workflows/{workflow_id}/runs"),
                Some(&RunListParams { head_sha, per_page: 1 }),
            )
            .await
            .with_context(|| format!("Failed to fetch runs for workflow {workflow_id}"))?;
        Ok(response.workflow_runs.into_iter().next())
    }

    /// All artifacts attached to a run, in listing order.
    pub async fn list_run_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<Artifact>> {
        let mut page = 1;
        let mut artifacts = Vec::new();
        loop {
            let response: ArtifactList = self
                .client
                .get(
                    format!("/repos/{owner}/{repo}/actions/runs/{run_id}/artifacts"),
                    Some(&PageParams { per_page: Some(100), page: Some(page) }),
                )
                .await
                .with_context(|| format!("Failed to fetch artifacts for run {run_id}"))?;
            let fetched = response.artifacts.len();
            artifacts.extend(response.artifacts);
            if fetched == 0 || artifacts.len() >= response.total_count as usize {
                break;
            }
            page += 1;
        }
        tracing::debug!("Run {} (artifacts {})", run_id, artifacts.len());
        Ok(artifacts)
    }

    /// Download an artifact's zip payload. Returns `None` when the artifact
    /// expired between listing and download (410 Gone); any other failure is
    /// an error.
    pub async fn download_artifact(
        &self,
        owner: &str,
        repo: &str,
        artifact_id: u64,
    ) -> Result<Option<Bytes>> {
        match self
            .client
            .actions()
            .download_artifact(owner, repo, ArtifactId::from(artifact_id), ArchiveFormat::Zip)
            .await
        {
            Ok(bytes) => Ok(Some(bytes)),
            Err(octocrab::Error::GitHub { source, .. })
                if matches!(*source, GitHubError { status_code: StatusCode::GONE, .. }) =>
            {
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to download artifact {artifact_id}")),
        }
    }
}

/// Extract an artifact's zip payload under `output_path/<name>`.
/// Only regular file entries are written; entry paths that escape the
/// extraction root are skipped. The returned file list is relative to the
/// extraction root, in archive order.
pub fn unpack_artifact(name: &str, bytes: &[u8], output_path: &Path) -> Result<UnpackedArtifact> {
    let root = output_path.join(name);
    fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create directory {}", root.display()))?;
    let mut archive =
        zip::ZipArchive::new(Cursor::new(bytes)).context("Failed to open artifact archive")?;
    let mut files = Vec::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        if file.is_dir() {
            continue;
        }
        let Some(path) = file.enclosed_name() else {
            tracing::warn!("Skipping unsafe archive entry: {}", file.name());
            continue;
        };
        let dest = root.join(&path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let mut out = File::create(&dest)
            .with_context(|| format!("Failed to create file {}", dest.display()))?;
        io::copy(&mut file, &mut out)
            .with_context(|| format!("Failed to extract {}", path.display()))?;
        tracing::debug!("  {}", path.display());
        files.push(path);
    }
    Ok(UnpackedArtifact { name: name.to_string(), root, files })
}
