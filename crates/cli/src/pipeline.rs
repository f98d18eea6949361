use std::fmt;

use anyhow::{Context, Result};
use carryover_core::{
    config::{Config, MERGE_GROUP_EVENT},
    models::RefDescriptor,
};
use carryover_github::GitHub;
use carryover_upload::{ArtifactClient, UploadOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reused { run_id: u64, artifacts: usize },
    Skipped(Skip),
}

/// Expected divergences: nothing to reuse today, not a malfunction. Each
/// ends the pipeline with output `false` and a successful exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    EventMismatch { event: String },
    BaseMoved { expected: String, actual: String },
    NoMatchingRun,
    RunIncomplete { status: String },
    ArtifactExpired { name: String },
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventMismatch { event } => {
                write!(f, "not a merge queue run (event '{event}')")
            }
            Self::BaseMoved { expected, actual } => {
                write!(f, "pull request base moved from {expected} to {actual}")
            }
            Self::NoMatchingRun => f.write_str("no matching workflow run"),
            Self::RunIncomplete { status } => write!(f, "workflow run is {status}"),
            Self::ArtifactExpired { name } => write!(f, "artifact {name} has expired"),
        }
    }
}

pub async fn run(config: &Config) -> Result<Outcome> {
    if config.context.event_name != MERGE_GROUP_EVENT {
        tracing::warn!(
            "Triggered by '{}' instead of '{}', nothing to do",
            config.context.event_name,
            MERGE_GROUP_EVENT
        );
        return Ok(Outcome::Skipped(Skip::EventMismatch {
            event: config.context.event_name.clone(),
        }));
    }

    let descriptor = RefDescriptor::parse(&config.context.git_ref)?;
    tracing::info!("Base SHA: {}", descriptor.base_sha);
    tracing::info!("Pull Request Number: {}", descriptor.pull_number);

    let github = GitHub::new(&config.github)?;
    let owner = &config.context.owner;
    let repo = &config.context.repo;

    let pull = github.get_pull_request(owner, repo, descriptor.pull_number).await?;
    tracing::info!("Pull Request Base SHA: {}", pull.base_sha);
    tracing::info!("Pull Request Head SHA: {}", pull.head_sha);
    if pull.base_sha != descriptor.base_sha {
        tracing::info!("Base SHA does not match pull request base SHA, skipping artifact download");
        return Ok(Outcome::Skipped(Skip::BaseMoved {
            expected: descriptor.base_sha,
            actual: pull.base_sha,
        }));
    }

    let Some(run) = github
        .latest_workflow_run(owner, repo, &config.workflow_id, &pull.head_sha)
        .await?
    else {
        tracing::info!("No {} run found for {}", config.workflow_id, pull.head_sha);
        return Ok(Outcome::Skipped(Skip::NoMatchingRun));
    };
    // Conclusion is logged but not gated on: artifacts from a failed run are
    // still eligible for copy-forward.
    tracing::info!(
        "Workflow run {} #{} ({} {})",
        run.id,
        run.run_number,
        run.status,
        run.conclusion.as_deref().unwrap_or("-")
    );
    if !run.is_completed() {
        return Ok(Outcome::Skipped(Skip::RunIncomplete { status: run.status }));
    }

    let artifacts = github.list_run_artifacts(owner, repo, run.id).await?;
    // All-or-nothing expiry guard, checked before any transfer begins
    if let Some(expired) = artifacts.iter().find(|artifact| artifact.expired) {
        tracing::info!("Artifact {} has expired, skipping artifact download", expired.name);
        return Ok(Outcome::Skipped(Skip::ArtifactExpired { name: expired.name.clone() }));
    }

    let uploader = ArtifactClient::new(config.artifact_store.as_ref().context(
        "Artifact service is not available (ACTIONS_RESULTS_URL / ACTIONS_RUNTIME_TOKEN)",
    )?)?;

    for artifact in &artifacts {
        tracing::info!(
            "=> Downloading artifact: {} ({} bytes)",
            artifact.name,
            artifact.size_in_bytes
        );
        let Some(bytes) = github.download_artifact(owner, repo, artifact.id).await? else {
            // Listed as live but expired before the download started
            tracing::info!("Artifact {} expired before download, skipping", artifact.name);
            return Ok(Outcome::Skipped(Skip::ArtifactExpired { name: artifact.name.clone() }));
        };
        tracing::debug!("=> Extracting: {}.zip", artifact.name);
        let unpacked =
            carryover_github::unpack_artifact(&artifact.name, &bytes, &config.output_path)?;
        let retention_days = config.retention.resolve(artifact.created_at, artifact.expires_at);
        tracing::info!("=> Uploading artifact: {} ({} files)", artifact.name, unpacked.files.len());
        uploader
            .upload(&unpacked, &UploadOptions {
                retention_days,
                compression_level: config.compression_level,
            })
            .await?;
    }

    Ok(Outcome::Reused { run_id: run.id, artifacts: artifacts.len() })
}
