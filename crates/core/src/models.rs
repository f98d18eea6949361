use std::{path::PathBuf, str::FromStr, sync::OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use time::OffsetDateTime;

/// Pull request number and expected base commit extracted from a merge queue
/// ref (`.../pr-<number>-<sha>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefDescriptor {
    pub pull_number: u64,
    pub base_sha: String,
}

impl RefDescriptor {
    pub fn parse(git_ref: &str) -> Result<Self> {
        static REGEX: OnceLock<Regex> = OnceLock::new();
        let regex = REGEX.get_or_init(|| Regex::new(r"pr-(\d+)-(.+)$").unwrap());
        let caps = regex
            .captures(git_ref)
            .with_context(|| format!("Ref '{git_ref}' is not a merge queue ref"))?;
        let pull_number = caps[1]
            .parse()
            .with_context(|| format!("Invalid pull request number in ref '{git_ref}'"))?;
        Ok(Self { pull_number, base_sha: caps[2].to_string() })
    }
}

/// How long the re-uploaded artifact should be retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Let the backend pick.
    #[default]
    Default,
    /// Mirror the source artifact's remaining window.
    Match,
    Days(u32),
}

impl FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "match" => Ok(Self::Match),
            _ => s
                .parse::<u32>()
                .map(Self::Days)
                .with_context(|| format!("Invalid retention-days value '{s}'")),
        }
    }
}

impl RetentionPolicy {
    /// Resolve to a concrete day count, or `None` for the backend default.
    /// `Match` derives the window from the source artifact's timestamps and
    /// falls back to the default when they are missing or degenerate.
    pub fn resolve(
        &self,
        created_at: Option<OffsetDateTime>,
        expires_at: Option<OffsetDateTime>,
    ) -> Option<u32> {
        match self {
            Self::Default => None,
            Self::Days(days) => Some(*days),
            Self::Match => {
                let (Some(created), Some(expires)) = (created_at, expires_at) else {
                    tracing::warn!(
                        "Artifact timestamps unavailable, using backend default retention"
                    );
                    return None;
                };
                let days = ((expires - created).whole_seconds() as f64 / 86_400.0).round();
                if days >= 1.0 {
                    Some(days as u32)
                } else {
                    tracing::warn!(
                        "Artifact retention window resolves to {} days, using backend default",
                        days
                    );
                    None
                }
            }
        }
    }
}

/// An artifact extracted to disk, ready for re-upload. `files` are relative
/// to `root`, in archive order.
#[derive(Debug, Clone)]
pub struct UnpackedArtifact {
    pub name: String,
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;

    #[test]
    fn test_parse_ref() {
        let cases: &[(&str, Option<(u64, &str)>)] = &[
            ("pr-42-abc123", Some((42, "abc123"))),
            ("refs/heads/gh-readonly-queue/main/pr-17-2840e207", Some((17, "2840e207"))),
            ("pr-0-deadbeef", Some((0, "deadbeef"))),
            ("pr-7-abc-def", Some((7, "abc-def"))),
            ("refs/heads/main", None),
            ("pr--abc", None),
            ("pr-42-", None),
            ("", None),
        ];
        for &(git_ref, expected) in cases {
            let result = RefDescriptor::parse(git_ref).ok();
            assert_eq!(
                result,
                expected.map(|(pull_number, base_sha)| RefDescriptor {
                    pull_number,
                    base_sha: base_sha.to_string(),
                }),
                "case: {git_ref}"
            );
        }
    }

    #[test]
    fn test_parse_ref_error_names_ref() {
        let err = RefDescriptor::parse("refs/heads/main").unwrap_err();
        assert!(err.to_string().contains("refs/heads/main"));
    }

    #[test]
    fn test_retention_from_str() {
        assert_eq!("default".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Default);
        assert_eq!("match".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Match);
        assert_eq!("7".parse::<RetentionPolicy>().unwrap(), RetentionPolicy::Days(7));
        assert!("sometimes".parse::<RetentionPolicy>().is_err());
        assert!("-3".parse::<RetentionPolicy>().is_err());
    }

    #[test]
    fn test_retention_resolve() {
        let created = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let expires = created + Duration::days(5);
        assert_eq!(RetentionPolicy::Default.resolve(Some(created), Some(expires)), None);
        assert_eq!(RetentionPolicy::Days(7).resolve(None, None), Some(7));
        assert_eq!(RetentionPolicy::Match.resolve(Some(created), Some(expires)), Some(5));
        // Partial days round to the nearest whole day
        let expires = created + Duration::days(2) + Duration::hours(13);
        assert_eq!(RetentionPolicy::Match.resolve(Some(created), Some(expires)), Some(3));
        // Missing timestamps fall back to the backend default
        assert_eq!(RetentionPolicy::Match.resolve(None, Some(expires)), None);
        assert_eq!(RetentionPolicy::Match.resolve(Some(created), None), None);
        // As does a degenerate window
        assert_eq!(RetentionPolicy::Match.resolve(Some(expires), Some(created)), None);
    }
}
