//! Artifact cache storage + HTTP fetch utilities for CCX.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ccx-storage";

/// Directory name used under the system temp dir when the configured cache dir is unusable.
pub const FALLBACK_CACHE_DIR: &str = "ccx-cache";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The file already held identical bytes, so nothing was rewritten.
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactBytes {
    pub content_hash: String,
    pub bytes: Vec<u8>,
}

/// Best-effort writable cache of named artifacts (the rendered summary, mostly).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create `preferred`, or fall back to `<tmp>/ccx-cache` on read-only filesystems.
    pub async fn open_writable(preferred: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let preferred = preferred.into();
        match fs::create_dir_all(&preferred).await {
            Ok(()) => Ok(Self::new(preferred)),
            Err(err) => {
                let fallback = std::env::temp_dir().join(FALLBACK_CACHE_DIR);
                warn!(
                    preferred = %preferred.display(),
                    fallback = %fallback.display(),
                    error = %err,
                    "cache directory not writable; using fallback"
                );
                fs::create_dir_all(&fallback)
                    .await
                    .with_context(|| format!("creating fallback cache dir {}", fallback.display()))?;
                Ok(Self::new(fallback))
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Replace `name` with `bytes` through a temp file + rename so readers never see a torn file.
    pub async fn store_bytes(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let absolute_path = self.artifact_path(name);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        if let Some(existing) = self.read_artifact(name).await? {
            if existing.content_hash == content_hash {
                return Ok(StoredArtifact {
                    content_hash,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let committed = match write_temp_file(&temp_path, bytes).await {
            Ok(()) => fs::rename(&temp_path, &absolute_path).await.with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = committed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        Ok(StoredArtifact {
            content_hash,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    pub async fn read_artifact(&self, name: &str) -> anyhow::Result<Option<ArtifactBytes>> {
        let path = self.artifact_path(name);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(ArtifactBytes {
                content_hash: Self::sha256_hex(&bytes),
                bytes,
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading artifact {}", path.display())),
        }
    }
}

async fn write_temp_file(temp_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(%status, attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn rewriting_identical_bytes_is_a_no_op() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let first = store
            .store_bytes("summary.svg", b"<svg>same</svg>")
            .await
            .expect("first store");
        let second = store
            .store_bytes("summary.svg", b"<svg>same</svg>")
            .await
            .expect("second store");

        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.content_hash, second.content_hash);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn new_bytes_replace_the_artifact_without_leftover_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        store.store_bytes("summary.svg", b"<svg>one</svg>").await.expect("first");
        let second = store.store_bytes("summary.svg", b"<svg>two</svg>").await.expect("second");
        assert!(!second.unchanged);

        let read = store
            .read_artifact("summary.svg")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(read.bytes, b"<svg>two</svg>");
        assert_eq!(read.content_hash, second.content_hash);

        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_write_leaves_no_temp_file_behind() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());

        let err = store
            .store_bytes("missing-subdir/summary.svg", b"<svg/>")
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("renaming temp artifact"));

        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn missing_artifact_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(store.read_artifact("summary.svg").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn open_writable_creates_preferred_directory() {
        let dir = tempdir().expect("tempdir");
        let preferred = dir.path().join("nested/cache");
        let store = ArtifactStore::open_writable(&preferred).await.expect("open");
        assert_eq!(store.root(), preferred.as_path());
        assert!(preferred.is_dir());
    }

    #[tokio::test]
    async fn open_writable_falls_back_when_preferred_is_unusable() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").expect("write blocker");
        let store = ArtifactStore::open_writable(blocker.join("cache"))
            .await
            .expect("open");
        assert_eq!(store.root(), std::env::temp_dir().join(FALLBACK_CACHE_DIR).as_path());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
