use std::{env, path::PathBuf};

use anyhow::{Context, Result, bail};

use crate::models::RetentionPolicy;

/// Event name the merge queue dispatches. Any other trigger makes the
/// action a no-op.
pub const MERGE_GROUP_EVENT: &str = "merge_group";

#[derive(Debug, Clone)]
pub struct Config {
    pub github: GitHubConfig,
    /// Present when the runner exposes the artifact service. Required only
    /// once an upload is attempted.
    pub artifact_store: Option<ArtifactStoreConfig>,
    pub context: ActionContext,
    /// Name or numeric id of the workflow whose artifacts are copied forward.
    pub workflow_id: String,
    /// Destination root for extraction; artifacts land in per-name
    /// subdirectories beneath it.
    pub output_path: PathBuf,
    pub retention: RetentionPolicy,
    pub compression_level: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub token: String,
    pub api_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub results_url: String,
    pub runtime_token: String,
}

#[derive(Debug, Clone)]
pub struct ActionContext {
    pub owner: String,
    pub repo: String,
    pub git_ref: String,
    pub event_name: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let token = required_input("github-token")?;
        let workflow_id = required_input("workflow-id")?;
        let output_path =
            input("path").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        let retention = match input("retention-days") {
            Some(value) => value.parse()?,
            None => RetentionPolicy::Default,
        };
        let compression_level = input("compression-level")
            .map(|value| {
                value
                    .parse::<i64>()
                    .with_context(|| format!("Invalid compression-level '{value}'"))
            })
            .transpose()?;

        let repository =
            env::var("GITHUB_REPOSITORY").context("GITHUB_REPOSITORY is not set")?;
        let (owner, repo) = split_repository(&repository)?;
        let context = ActionContext {
            owner,
            repo,
            git_ref: env::var("GITHUB_REF").unwrap_or_default(),
            event_name: env::var("GITHUB_EVENT_NAME").unwrap_or_default(),
        };

        let artifact_store = match (
            env::var("ACTIONS_RESULTS_URL").ok(),
            env::var("ACTIONS_RUNTIME_TOKEN").ok(),
        ) {
            (Some(results_url), Some(runtime_token)) => {
                Some(ArtifactStoreConfig { results_url, runtime_token })
            }
            _ => None,
        };

        Ok(Self {
            github: GitHubConfig { token, api_url: env::var("GITHUB_API_URL").ok() },
            artifact_store,
            context,
            workflow_id,
            output_path,
            retention,
            compression_level,
        })
    }
}

/// Look up an action input the way the runner exposes it: `INPUT_` plus the
/// uppercased name with spaces mapped to underscores. Empty values count as
/// unset.
fn input(name: &str) -> Option<String> {
    let key = format!("INPUT_{}", name.replace(' ', "_").to_uppercase());
    env::var(key).ok().filter(|value| !value.is_empty())
}

fn required_input(name: &str) -> Result<String> {
    input(name).with_context(|| format!("Input required and not supplied: {name}"))
}

fn split_repository(repository: &str) -> Result<(String, String)> {
    match repository.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => bail!("Malformed GITHUB_REPOSITORY '{repository}', expected 'owner/repo'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_lookup() {
        temp_env::with_vars(
            [
                ("INPUT_GITHUB-TOKEN", Some("ghs_token")),
                ("INPUT_PATH", Some("")),
                ("INPUT_WORKFLOW-ID", None),
            ],
            || {
                assert_eq!(input("github-token").as_deref(), Some("ghs_token"));
                // Empty values count as unset
                assert_eq!(input("path"), None);
                assert_eq!(input("workflow-id"), None);
            },
        );
    }

    #[test]
    fn test_config_from_env() {
        temp_env::with_vars(
            [
                ("INPUT_GITHUB-TOKEN", Some("ghs_token")),
                ("INPUT_WORKFLOW-ID", Some("ci.yml")),
                ("INPUT_PATH", Some("out")),
                ("INPUT_RETENTION-DAYS", Some("match")),
                ("INPUT_COMPRESSION-LEVEL", Some("9")),
                ("GITHUB_REPOSITORY", Some("octo/widgets")),
                ("GITHUB_REF", Some("refs/heads/gh-readonly-queue/main/pr-42-abc123")),
                ("GITHUB_EVENT_NAME", Some(MERGE_GROUP_EVENT)),
                ("GITHUB_API_URL", Some("https://api.github.example")),
                ("ACTIONS_RESULTS_URL", Some("https://results.example/")),
                ("ACTIONS_RUNTIME_TOKEN", Some("jwt")),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.github.token, "ghs_token");
                assert_eq!(config.github.api_url.as_deref(), Some("https://api.github.example"));
                assert_eq!(config.workflow_id, "ci.yml");
                assert_eq!(config.output_path, PathBuf::from("out"));
                assert_eq!(config.retention, RetentionPolicy::Match);
                assert_eq!(config.compression_level, Some(9));
                assert_eq!(config.context.owner, "octo");
                assert_eq!(config.context.repo, "widgets");
                assert_eq!(config.context.event_name, MERGE_GROUP_EVENT);
                let store = config.artifact_store.unwrap();
                assert_eq!(store.results_url, "https://results.example/");
                assert_eq!(store.runtime_token, "jwt");
            },
        );
    }

    #[test]
    fn test_required_input_missing() {
        temp_env::with_var_unset("INPUT_WORKFLOW-ID", || {
            let err = required_input("workflow-id").unwrap_err();
            assert!(err.to_string().contains("workflow-id"));
        });
    }

    #[test]
    fn test_split_repository() {
        let cases: &[(&str, Option<(&str, &str)>)] = &[
            ("octo/repo", Some(("octo", "repo"))),
            ("octo/repo/extra", Some(("octo", "repo/extra"))),
            ("no-slash", None),
            ("/repo", None),
            ("owner/", None),
        ];
        for &(repository, expected) in cases {
            let result = split_repository(repository).ok();
            assert_eq!(
                result,
                expected.map(|(o, r)| (o.to_string(), r.to_string())),
                "case: {repository}"
            );
        }
    }
}
