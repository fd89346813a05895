//! Installer payload download with ordered fallback sources and optional
//! SHA-256 verification.

use crate::errors::StepError;
use crate::transcript::Transcript;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use futures::StreamExt;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const CHUNK_SIZE: usize = 64 * 1024;

/// Where to fetch an installer from and how to check it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    /// URLs or local paths, tried in order until one succeeds.
    pub sources: Vec<String>,
    /// Expected lowercase hex SHA-256 of the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// File name to save as; defaults to the last segment of the first source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl DownloadDescriptor {
    /// Target file name inside the download directory.
    pub fn target_name(&self) -> String {
        if let Some(ref name) = self.file_name {
            return name.clone();
        }
        self.sources
            .first()
            .and_then(|s| {
                s.trim_end_matches('/')
                    .rsplit(|c: char| c == '/' || c == '\\')
                    .next()
                    .map(|seg| seg.split('?').next().unwrap_or(seg).to_string())
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "payload.bin".to_string())
    }

    /// Fetch the payload into `dest_dir`, returning the saved path.
    ///
    /// An existing file whose checksum already matches is reused without
    /// touching the network.
    pub async fn fetch(
        &self,
        dest_dir: &Path,
        transcript: Option<&Transcript>,
    ) -> Result<PathBuf, StepError> {
        if self.sources.is_empty() {
            return Err(StepError::permanent("Download descriptor has no sources"));
        }
        std::fs::create_dir_all(dest_dir).map_err(|e| {
            StepError::transient(format!(
                "Failed to create download directory {}: {}",
                dest_dir.display(),
                e
            ))
        })?;
        let target = dest_dir.join(self.target_name());

        if let Some(ref expected) = self.sha256
            && target.exists()
            && let Ok(existing) = sha256_file(&target)
            && existing.eq_ignore_ascii_case(expected.trim())
        {
            tracing::debug!(path = %target.display(), "reusing verified download");
            return Ok(target);
        }

        let mut failures = Vec::new();
        for source in &self.sources {
            if let Some(t) = transcript {
                t.append_line(&format!("fetching {}", source));
            }
            let payload = match fetch_source(source, dest_dir).await {
                Ok(payload) => payload,
                Err(reason) => {
                    tracing::warn!(source = %source, "download failed: {}", reason);
                    failures.push(format!("{}: {}", source, reason));
                    continue;
                }
            };
            if let Some(ref expected) = self.sha256
                && !payload.digest.eq_ignore_ascii_case(expected.trim())
            {
                let reason = format!(
                    "checksum mismatch (expected {}, got {})",
                    expected, payload.digest
                );
                tracing::warn!(source = %source, "{}", reason);
                failures.push(format!("{}: {}", source, reason));
                continue;
            }
            let len = payload.len;
            payload.persist(&target)?;
            if let Some(t) = transcript {
                t.append_line(&format!("saved {} bytes to {}", len, target.display()));
            }
            return Ok(target);
        }

        Err(StepError::transient(format!(
            "All download sources failed: {}",
            failures.join("; ")
        )))
    }
}

/// Payload being written to a temp file beside its target, hashed as it
/// arrives.
struct Payload {
    file: NamedTempFile,
    hasher: Sha256,
    digest: String,
    len: u64,
}

impl Payload {
    fn create(dir: &Path) -> Result<Self, String> {
        Ok(Self {
            file: NamedTempFile::new_in(dir).map_err(|e| e.to_string())?,
            hasher: Sha256::new(),
            digest: String::new(),
            len: 0,
        })
    }

    fn write(&mut self, chunk: &[u8]) -> Result<(), String> {
        self.hasher.update(chunk);
        self.len += chunk.len() as u64;
        self.file.write_all(chunk).map_err(|e| e.to_string())
    }

    fn finish(mut self) -> Result<Self, String> {
        self.file.flush().map_err(|e| e.to_string())?;
        self.file.as_file().sync_all().map_err(|e| e.to_string())?;
        self.digest = format!("{:x}", std::mem::take(&mut self.hasher).finalize());
        Ok(self)
    }

    fn persist(self, target: &Path) -> Result<(), StepError> {
        self.file.persist(target).map_err(|e| {
            StepError::transient(format!("Failed to write {}: {}", target.display(), e.error))
        })?;
        Ok(())
    }
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

async fn fetch_source(source: &str, dest_dir: &Path) -> Result<Payload, String> {
    let mut payload = Payload::create(dest_dir)?;
    if is_remote(source) {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let response = client
            .get(source)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| format!("Failed to read chunk: {}", e))?;
            payload.write(&chunk)?;
        }
    } else {
        let path = source.strip_prefix("file://").unwrap_or(source);
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| e.to_string())?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(|e| e.to_string())?;
            if n == 0 {
                break;
            }
            payload.write(&buf[..n])?;
        }
    }
    payload.finish()
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sha256_hex(bytes: &[u8]) -> String {
        format!("{:x}", Sha256::digest(bytes))
    }

    fn local(sources: Vec<String>, sha256: Option<String>) -> DownloadDescriptor {
        DownloadDescriptor {
            sources,
            sha256,
            file_name: Some("agent.msi".into()),
        }
    }

    #[test]
    fn test_target_name_from_url() {
        let d = DownloadDescriptor {
            sources: vec!["https://example.com/pkg/amazon-ssm-agent.msi?sig=abc".into()],
            sha256: None,
            file_name: None,
        };
        assert_eq!(d.target_name(), "amazon-ssm-agent.msi");
    }

    #[test]
    fn test_target_name_from_windows_path() {
        let d = DownloadDescriptor {
            sources: vec![r"C:\payloads\docker.zip".into()],
            sha256: None,
            file_name: None,
        };
        assert_eq!(d.target_name(), "docker.zip");
    }

    #[test]
    fn test_sha256_file_known_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_payload_larger_than_one_chunk_is_streamed_intact() {
        let dir = tempdir().unwrap();
        let bytes: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let payload = dir.path().join("layout.iso");
        std::fs::write(&payload, &bytes).unwrap();

        let d = local(
            vec![payload.to_string_lossy().into_owned()],
            Some(sha256_hex(&bytes)),
        );
        let saved = d.fetch(&dir.path().join("downloads"), None).await.unwrap();
        assert_eq!(std::fs::read(&saved).unwrap(), bytes);
        assert_eq!(sha256_file(&saved).unwrap(), sha256_hex(&bytes));
    }

    #[tokio::test]
    async fn test_failed_source_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("payload.msi");
        std::fs::write(&payload, b"tampered").unwrap();
        let downloads = dir.path().join("downloads");

        let d = local(
            vec![payload.to_string_lossy().into_owned()],
            Some(sha256_hex(b"original")),
        );
        d.fetch(&downloads, None).await.unwrap_err();
        assert_eq!(std::fs::read_dir(&downloads).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_second_source() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("payload.msi");
        std::fs::write(&payload, b"installer-bytes").unwrap();

        let d = local(
            vec![
                dir.path().join("missing.msi").to_string_lossy().into_owned(),
                payload.to_string_lossy().into_owned(),
            ],
            Some(sha256_hex(b"installer-bytes")),
        );
        let saved = d.fetch(&dir.path().join("downloads"), None).await.unwrap();
        assert_eq!(std::fs::read(&saved).unwrap(), b"installer-bytes");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_transient_failure() {
        let dir = tempdir().unwrap();
        let payload = dir.path().join("payload.msi");
        std::fs::write(&payload, b"tampered").unwrap();

        let d = local(
            vec![payload.to_string_lossy().into_owned()],
            Some(sha256_hex(b"original")),
        );
        let err = d.fetch(&dir.path().join("downloads"), None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_reuses_verified_existing_file() {
        let dir = tempdir().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        std::fs::write(downloads.join("agent.msi"), b"cached").unwrap();

        // The only source is unreachable; the cached copy must be used.
        let d = local(
            vec![dir.path().join("gone.msi").to_string_lossy().into_owned()],
            Some(sha256_hex(b"cached")),
        );
        let saved = d.fetch(&downloads, None).await.unwrap();
        assert_eq!(saved, downloads.join("agent.msi"));
    }

    #[tokio::test]
    async fn test_no_sources_is_permanent() {
        let dir = tempdir().unwrap();
        let d = local(vec![], None);
        let err = d.fetch(dir.path(), None).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
