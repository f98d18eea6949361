//! Client for the GitHub Actions artifact service (v4 protocol): the upload
//! half the REST API does not offer. Artifacts are created and finalized via
//! Twirp calls against `ACTIONS_RESULTS_URL`, with the zipped content PUT to
//! a signed blob URL in between.

use std::{
    fs::File,
    io::{self, Cursor},
};

use anyhow::{Context, Result, bail, ensure};
use base64::Engine;
use carryover_core::{config::ArtifactStoreConfig, models::UnpackedArtifact};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use url::Url;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub struct ArtifactClient {
    http: reqwest::Client,
    service_url: Url,
    token: String,
    workflow_run_backend_id: String,
    workflow_job_run_backend_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub retention_days: Option<u32>,
    pub compression_level: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct UploadedArtifact {
    pub id: Option<u64>,
    pub size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateArtifactRequest<'a> {
    workflow_run_backend_id: &'a str,
    workflow_job_run_backend_id: &'a str,
    name: &'a str,
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateArtifactResponse {
    ok: bool,
    signed_upload_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeArtifactRequest<'a> {
    workflow_run_backend_id: &'a str,
    workflow_job_run_backend_id: &'a str,
    name: &'a str,
    /// int64 fields travel as decimal strings in Twirp JSON.
    size: String,
    hash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeArtifactResponse {
    ok: bool,
    #[serde(default)]
    artifact_id: Option<String>,
}

impl ArtifactClient {
    pub fn new(config: &ArtifactStoreConfig) -> Result<Self> {
        let (workflow_run_backend_id, workflow_job_run_backend_id) =
            backend_ids_from_token(&config.runtime_token)?;
        let mut results_url = config.results_url.clone();
        if !results_url.ends_with('/') {
            results_url.push('/');
        }
        let service_url = Url::parse(&results_url)
            .with_context(|| format!("Invalid results service URL '{}'", config.results_url))?
            .join("twirp/github.actions.results.api.v1.ArtifactService/")?;
        Ok(Self {
            http: reqwest::Client::new(),
            service_url,
            token: config.runtime_token.clone(),
            workflow_run_backend_id,
            workflow_job_run_backend_id,
        })
    }

    /// Pack the unpacked artifact's file list into a zip and upload it under
    /// `artifact.name`.
    pub async fn upload(
        &self,
        artifact: &UnpackedArtifact,
        options: &UploadOptions,
    ) -> Result<UploadedArtifact> {
        let payload = write_zip(artifact, options.compression_level)?;
        let size = payload.len() as u64;
        let digest = Sha256::digest(&payload);

        let expires_at = options
            .retention_days
            .map(|days| {
                (OffsetDateTime::now_utc() + Duration::days(i64::from(days))).format(&Rfc3339)
            })
            .transpose()
            .context("Failed to format artifact expiry")?;
        let created: CreateArtifactResponse = self
            .call("CreateArtifact", &CreateArtifactRequest {
                workflow_run_backend_id: &self.workflow_run_backend_id,
                workflow_job_run_backend_id: &self.workflow_job_run_backend_id,
                name: &artifact.name,
                version: 4,
                expires_at,
            })
            .await?;
        ensure!(created.ok, "Artifact service refused to create '{}'", artifact.name);

        let upload_url = Url::parse(&created.signed_upload_url)
            .context("Artifact service returned an invalid upload URL")?;
        self.http
            .put(upload_url)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-blob-content-type", "application/zip")
            .body(payload)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("Failed to upload content for '{}'", artifact.name))?;

        let finalized: FinalizeArtifactResponse = self
            .call("FinalizeArtifact", &FinalizeArtifactRequest {
                workflow_run_backend_id: &self.workflow_run_backend_id,
                workflow_job_run_backend_id: &self.workflow_job_run_backend_id,
                name: &artifact.name,
                size: size.to_string(),
                hash: format!("sha256:{}", hex::encode(digest)),
            })
            .await?;
        ensure!(finalized.ok, "Artifact service refused to finalize '{}'", artifact.name);

        let id = finalized.artifact_id.and_then(|id| id.parse().ok());
        tracing::debug!("Finalized artifact {} ({} bytes, id {:?})", artifact.name, size, id);
        Ok(UploadedArtifact { id, size })
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.service_url.join(method)?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to call {method}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{method} failed with status {status}: {body}");
        }
        response.json().await.with_context(|| format!("Failed to parse {method} response"))
    }
}

/// The runner scopes the runtime token to the current run and job; the two
/// backend ids ride in the `scp` claim as `Actions.Results:<run>:<job>`.
/// The token is decoded, not verified.
fn backend_ids_from_token(token: &str) -> Result<(String, String)> {
    let payload = token.split('.').nth(1).context("Runtime token is not a JWT")?;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .context("Failed to decode runtime token payload")?;
    #[derive(Deserialize)]
    struct Claims {
        scp: String,
    }
    let claims: Claims =
        serde_json::from_slice(&decoded).context("Failed to parse runtime token claims")?;
    for scope in claims.scp.split(' ') {
        let mut parts = scope.split(':');
        if parts.next() == Some("Actions.Results")
            && let (Some(run), Some(job)) = (parts.next(), parts.next())
            && parts.next().is_none()
            && !run.is_empty()
            && !job.is_empty()
        {
            return Ok((run.to_string(), job.to_string()));
        }
    }
    bail!("Runtime token is missing the Actions.Results scope")
}

fn write_zip(artifact: &UnpackedArtifact, compression_level: Option<i64>) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(compression_level);
    for file in &artifact.files {
        let path = artifact.root.join(file);
        let entry_name = file.to_string_lossy().replace('\\', "/");
        writer
            .start_file(entry_name, options)
            .with_context(|| format!("Failed to add archive entry {}", file.display()))?;
        let mut input =
            File::open(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        io::copy(&mut input, &mut writer)
            .with_context(|| format!("Failed to compress {}", path.display()))?;
    }
    Ok(writer.finish().context("Failed to finish artifact archive")?.into_inner())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf};

    use super::*;

    fn token_with_scp(scp: &str) -> String {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(format!(r#"{{"scp":"{scp}"}}"#));
        format!("eyJhbGciOiJSUzI1NiJ9.{payload}.sig")
    }

    #[test]
    fn test_backend_ids_from_token() {
        let token = token_with_scp("Actions.Example:x Actions.Results:run-1:job-2");
        let (run, job) = backend_ids_from_token(&token).unwrap();
        assert_eq!(run, "run-1");
        assert_eq!(job, "job-2");
    }

    #[test]
    fn test_backend_ids_missing_scope() {
        let token = token_with_scp("Actions.Example:x");
        assert!(backend_ids_from_token(&token).is_err());
        assert!(backend_ids_from_token("not-a-jwt").is_err());
        // Scope with too many segments is not ours
        let token = token_with_scp("Actions.Results:a:b:c");
        assert!(backend_ids_from_token(&token).is_err());
    }

    #[test]
    fn test_write_zip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        fs::write(dir.path().join("nested/b.txt"), b"beta").unwrap();
        let artifact = UnpackedArtifact {
            name: "build-output".to_string(),
            root: dir.path().to_path_buf(),
            files: vec![PathBuf::from("a.txt"), PathBuf::from("nested/b.txt")],
        };
        let bytes = write_zip(&artifact, Some(6)).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "a.txt");
        assert_eq!(archive.by_index(1).unwrap().name(), "nested/b.txt");
        let mut contents = String::new();
        io::Read::read_to_string(&mut archive.by_name("nested/b.txt").unwrap(), &mut contents)
            .unwrap();
        assert_eq!(contents, "beta");
    }

    #[test]
    fn test_write_zip_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = UnpackedArtifact {
            name: "broken".to_string(),
            root: dir.path().to_path_buf(),
            files: vec![PathBuf::from("gone.txt")],
        };
        assert!(write_zip(&artifact, None).is_err());
    }
}
