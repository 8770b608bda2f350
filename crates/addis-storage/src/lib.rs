//! Content-addressed asset storage + HTTP fetch utilities for the dataset pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use md5::{Digest, Md5};
pub use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "addis-storage";

/// Every localized asset is stored with this extension whatever its real encoding.
pub const ASSET_EXTENSION: &str = "jpg";

#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub key: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Result of [`AssetStore::get_or_fetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalizedAsset {
    pub key: String,
    pub public_path: String,
    pub absolute_path: PathBuf,
    /// True when the file was already on disk and no fetch happened.
    pub reused: bool,
}

#[derive(Debug, Error)]
pub enum LocalizeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Anything that can hand back the bytes behind a media URL.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

/// Flat directory of assets named `<md5(url)>.jpg`.
///
/// The key is derived from the URL string, not the downloaded bytes, so a URL
/// is fetched at most once for as long as its file survives on disk.
#[derive(Debug)]
pub struct AssetStore {
    root: PathBuf,
    public_mount: String,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>, public_mount: impl Into<String>) -> Self {
        let public_mount = public_mount.into().trim_end_matches('/').to_string();
        Self {
            root: root.into(),
            public_mount,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_mount(&self) -> &str {
        &self.public_mount
    }

    pub fn url_digest(url: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn file_name_for_key(key: &str) -> String {
        format!("{key}.{ASSET_EXTENSION}")
    }

    pub fn absolute_path_for_key(&self, key: &str) -> PathBuf {
        self.root.join(Self::file_name_for_key(key))
    }

    pub fn public_path_for_key(&self, key: &str) -> String {
        format!("{}/{}", self.public_mount, Self::file_name_for_key(key))
    }

    /// Site-relative path a URL localizes to, without touching the disk.
    pub fn public_path_for_url(&self, url: &str) -> String {
        self.public_path_for_key(&Self::url_digest(url))
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating asset directory {}", self.root.display()))
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut map = self.key_locks.lock().await;
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Clones are only handed out under the map lock, so a count of 2 (map +
    // caller) means no other task is waiting on this key.
    async fn release_key_lock(&self, key: &str, lock: Arc<Mutex<()>>) {
        let mut map = self.key_locks.lock().await;
        if Arc::strong_count(&lock) == 2 {
            map.remove(key);
        }
    }

    #[cfg(test)]
    async fn held_key_locks(&self) -> usize {
        self.key_locks.lock().await.len()
    }

    /// Return the local asset for `url`, fetching it through `source` only
    /// when no file exists yet. Calls for the same URL are serialized.
    pub async fn get_or_fetch(
        &self,
        url: &str,
        source: &dyn AssetSource,
    ) -> Result<LocalizedAsset, LocalizeError> {
        let key = Self::url_digest(url);
        let lock = self.key_lock(&key).await;
        let result = {
            let _held = lock.lock().await;
            self.localize_locked(url, key.clone(), source).await
        };
        self.release_key_lock(&key, lock).await;
        result
    }

    async fn localize_locked(
        &self,
        url: &str,
        key: String,
        source: &dyn AssetSource,
    ) -> Result<LocalizedAsset, LocalizeError> {
        let absolute_path = self.absolute_path_for_key(&key);
        let exists = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking asset path {}", absolute_path.display()))?;
        if exists {
            debug!(%key, "asset already present");
            return Ok(LocalizedAsset {
                public_path: self.public_path_for_key(&key),
                key,
                absolute_path,
                reused: true,
            });
        }

        let fetched = source.fetch_bytes(url).await?;
        if fetched.body.is_empty() {
            return Err(FetchError::EmptyBody {
                url: fetched.final_url,
            }
            .into());
        }
        let stored = self.store_bytes(&key, &fetched.body).await?;
        info!(file = %Self::file_name_for_key(&key), bytes = stored.byte_size, "downloaded asset");

        Ok(LocalizedAsset {
            public_path: self.public_path_for_key(&key),
            key,
            absolute_path: stored.absolute_path,
            reused: stored.deduplicated,
        })
    }

    /// Write bytes under `key` using a temp file in the same directory and an
    /// atomic rename, so an interrupted run never leaves a truncated asset.
    pub async fn store_bytes(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredAsset> {
        let absolute_path = self.absolute_path_for_key(key);
        self.ensure_root().await?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking asset path {}", absolute_path.display()))?
        {
            return Ok(StoredAsset {
                key: key.to_string(),
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp asset file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp asset file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp asset file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredAsset {
                key: key.to_string(),
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp asset {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
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
    if err.is_timeout() || err.is_connect() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
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
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("empty body from {url}")]
    EmptyBody { url: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("transport error fetching {url}: {message}")]
    Transport {
        url: String,
        message: String,
        disposition: RetryDisposition,
    },
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: url.to_string(),
            };
        }
        Self::Transport {
            url: url.to_string(),
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::EmptyBody { .. } => RetryDisposition::NonRetryable,
            Self::Timeout { .. } => RetryDisposition::Retryable,
            Self::Transport { disposition, .. } => *disposition,
        }
    }
}

/// reqwest-backed [`AssetSource`]. Only `200 OK` counts as a download.
/// Redirects are not followed: a 3xx is a failed response like any other,
/// so a trusted URL cannot bounce the download to an unchecked host.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::none())
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

    pub async fn fetch(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = tracing::info_span!("asset_fetch", url);
        async move {
            let mut attempt = 0usize;
            loop {
                match self.fetch_once(url).await {
                    Ok(resp) => return Ok(resp),
                    Err(err)
                        if err.disposition() == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries =>
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        debug!(attempt, ?delay, error = %err, "retrying asset fetch");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?;

        let status = resp.status();
        let final_url = resp.url().to_string();
        if status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(url, err))?
            .to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl AssetSource for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch(url).await
    }
}
