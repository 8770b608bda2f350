//! Scrape-to-site dataset normalizer: raw posts in, localized clean posts out.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use addis_core::{
    is_trusted_host, NormalizedMediaItem, NormalizedPost, RawMediaItem, RawPost,
    DEFAULT_PUBLIC_MOUNT, DEFAULT_TRUSTED_HOST_FRAGMENT, UNAVAILABLE_MARKER_FIELD,
};
use addis_storage::{
    AssetSource, AssetStore, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher,
    LocalizeError, LocalizedAsset,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "addis-normalizer";

pub const DEFAULT_INPUT_PATH: &str = "public/live-addis-facebook-scrap.json";
pub const DEFAULT_OUTPUT_PATH: &str = "src/data/clean_data.json";
pub const DEFAULT_ASSETS_DIR: &str = "public/images/posts";

/// How output ids are assigned.
///
/// `Sparse` numbers every raw post by its 1-based position before filtering,
/// so rejected posts leave gaps and `/blog/<id>` links stay stable across
/// scrapes that only add posts at the end. `Dense` renumbers the accepted
/// posts `1..=n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdPolicy {
    #[default]
    Sparse,
    Dense,
}

impl FromStr for IdPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sparse" => Ok(Self::Sparse),
            "dense" => Ok(Self::Dense),
            other => Err(format!("unknown id policy `{other}` (expected sparse|dense)")),
        }
    }
}

impl fmt::Display for IdPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sparse => f.write_str("sparse"),
            Self::Dense => f.write_str("dense"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub assets_dir: PathBuf,
    pub public_mount: String,
    pub trusted_host_fragment: String,
    pub id_policy: IdPolicy,
    /// 1 keeps downloads strictly sequential.
    pub fetch_concurrency: usize,
    pub http_timeout_secs: u64,
    pub max_retries: usize,
    pub user_agent: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            input_path: PathBuf::from(DEFAULT_INPUT_PATH),
            output_path: PathBuf::from(DEFAULT_OUTPUT_PATH),
            assets_dir: PathBuf::from(DEFAULT_ASSETS_DIR),
            public_mount: DEFAULT_PUBLIC_MOUNT.to_string(),
            trusted_host_fragment: DEFAULT_TRUSTED_HOST_FRAGMENT.to_string(),
            id_policy: IdPolicy::Sparse,
            fetch_concurrency: 1,
            http_timeout_secs: 30,
            max_retries: 2,
            user_agent: "addis-normalizer/0.1".to_string(),
        }
    }
}

impl NormalizerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            input_path: std::env::var("ADDIS_INPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.input_path),
            output_path: std::env::var("ADDIS_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            assets_dir: std::env::var("ADDIS_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.assets_dir),
            public_mount: std::env::var("ADDIS_PUBLIC_MOUNT").unwrap_or(defaults.public_mount),
            trusted_host_fragment: std::env::var("ADDIS_TRUSTED_HOST")
                .unwrap_or(defaults.trusted_host_fragment),
            id_policy: std::env::var("ADDIS_ID_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.id_policy),
            fetch_concurrency: std::env::var("ADDIS_FETCH_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.fetch_concurrency),
            http_timeout_secs: std::env::var("ADDIS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            max_retries: std::env::var("ADDIS_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            user_agent: std::env::var("ADDIS_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
        }
    }
}

/// Why a media item did not make it into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDrop {
    MissingUrl,
    UntrustedHost,
    HttpStatus(u16),
    EmptyBody,
    Timeout,
    Transport,
    Storage,
}

impl MediaDrop {
    pub fn label(&self) -> String {
        match self {
            Self::MissingUrl => "missing_url".to_string(),
            Self::UntrustedHost => "untrusted_host".to_string(),
            Self::HttpStatus(status) => format!("http_{status}"),
            Self::EmptyBody => "empty_body".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::Transport => "transport".to_string(),
            Self::Storage => "storage".to_string(),
        }
    }
}

impl From<&LocalizeError> for MediaDrop {
    fn from(err: &LocalizeError) -> Self {
        match err {
            LocalizeError::Fetch(FetchError::HttpStatus { status, .. }) => Self::HttpStatus(*status),
            LocalizeError::Fetch(FetchError::EmptyBody { .. }) => Self::EmptyBody,
            LocalizeError::Fetch(FetchError::Timeout { .. }) => Self::Timeout,
            LocalizeError::Fetch(FetchError::Transport { .. }) => Self::Transport,
            LocalizeError::Storage(_) => Self::Storage,
        }
    }
}

/// Why a whole post was left out of the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostRejection {
    /// No text and no `media` field at all.
    EmptyContent,
    /// First media item carries the takedown marker.
    ContentUnavailable,
    /// No text and every media item was dropped.
    NoSurvivingContent,
}

impl PostRejection {
    pub fn label(&self) -> &'static str {
        match self {
            Self::EmptyContent => "empty_content",
            Self::ContentUnavailable => "content_unavailable",
            Self::NoSurvivingContent => "no_surviving_content",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunTally {
    pub posts_read: usize,
    pub posts_written: usize,
    pub posts_rejected: BTreeMap<String, usize>,
    pub media_seen: usize,
    pub media_downloaded: usize,
    pub media_reused: usize,
    pub media_dropped: BTreeMap<String, usize>,
}

impl RunTally {
    fn record_media(&mut self, outcome: &Result<LocalizedAsset, MediaDrop>) {
        self.media_seen += 1;
        match outcome {
            Ok(asset) if asset.reused => self.media_reused += 1,
            Ok(_) => self.media_downloaded += 1,
            Err(reason) => *self.media_dropped.entry(reason.label()).or_default() += 1,
        }
    }

    fn record_rejection(&mut self, rejection: PostRejection) {
        *self
            .posts_rejected
            .entry(rejection.label().to_string())
            .or_default() += 1;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_path: String,
    pub output_path: String,
    pub assets_dir: String,
    pub id_policy: IdPolicy,
    pub tally: RunTally,
}

/// Resolve, gate and localize one media item. Failures come back as a
/// [`MediaDrop`]; nothing here aborts the run.
pub async fn localize_media(
    store: &AssetStore,
    source: &dyn AssetSource,
    trusted_host_fragment: &str,
    item: &RawMediaItem,
) -> Result<LocalizedAsset, MediaDrop> {
    let Some(url) = item.resolve_url() else {
        debug!(media_id = item.id.as_deref().unwrap_or_default(), "media has no usable url");
        return Err(MediaDrop::MissingUrl);
    };
    if !is_trusted_host(url, trusted_host_fragment) {
        debug!(url, "skipping media from untrusted host");
        return Err(MediaDrop::UntrustedHost);
    }

    store.get_or_fetch(url, source).await.map_err(|err| {
        warn!(url = %truncate_for_log(url), error = %err, "media download failed");
        MediaDrop::from(&err)
    })
}

/// Steps that can reject a post before any media is touched.
fn screen_post(raw: &RawPost) -> Result<(), PostRejection> {
    if raw.text_or_empty().is_empty() && !raw.has_media_field() {
        return Err(PostRejection::EmptyContent);
    }
    if raw.is_content_unavailable() {
        debug!(marker = UNAVAILABLE_MARKER_FIELD, "first media item flags content unavailable");
        return Err(PostRejection::ContentUnavailable);
    }
    Ok(())
}

fn base_post(raw: &RawPost, id: u64) -> NormalizedPost {
    NormalizedPost {
        id,
        text: raw.text.clone().unwrap_or_default(),
        url: raw.url.clone().unwrap_or_default(),
        likes: raw.likes.unwrap_or_default(),
        comments: raw.comments.unwrap_or_default(),
        shares: raw.shares.unwrap_or_default(),
        media: Vec::new(),
    }
}

fn finish_post(post: NormalizedPost) -> Result<NormalizedPost, PostRejection> {
    if post.has_content() {
        Ok(post)
    } else {
        Err(PostRejection::NoSurvivingContent)
    }
}

pub struct DatasetNormalizer {
    config: NormalizerConfig,
    store: Arc<AssetStore>,
    source: Arc<dyn AssetSource>,
}

impl DatasetNormalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::with_source(config, Arc::new(fetcher)))
    }

    pub fn with_source(config: NormalizerConfig, source: Arc<dyn AssetSource>) -> Self {
        let store = Arc::new(AssetStore::new(
            config.assets_dir.clone(),
            config.public_mount.clone(),
        ));
        Self {
            config,
            store,
            source,
        }
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    /// Normalize one raw post, downloading its media one item at a time.
    pub async fn normalize_post(
        &self,
        raw: &RawPost,
        sequence_index: u64,
    ) -> Result<NormalizedPost, PostRejection> {
        self.normalize_post_tallied(raw, sequence_index, &mut RunTally::default())
            .await
    }

    async fn normalize_post_tallied(
        &self,
        raw: &RawPost,
        sequence_index: u64,
        tally: &mut RunTally,
    ) -> Result<NormalizedPost, PostRejection> {
        screen_post(raw)?;
        let mut post = base_post(raw, sequence_index);
        for item in raw.media_items() {
            let outcome = localize_media(
                &self.store,
                self.source.as_ref(),
                &self.config.trusted_host_fragment,
                item,
            )
            .await;
            tally.record_media(&outcome);
            if let Ok(asset) = outcome {
                post.media
                    .push(NormalizedMediaItem::from_raw(asset.public_path, item));
            }
        }
        finish_post(post)
    }

    /// Read the scrape, normalize every post and replace the output file.
    pub async fn run_once(&self) -> Result<NormalizeRunSummary> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("normalize_run", %run_id);
        self.run_once_inner(run_id).instrument(span).await
    }

    async fn run_once_inner(&self, run_id: Uuid) -> Result<NormalizeRunSummary> {
        let started_at = Utc::now();
        let raw_posts = read_raw_posts(&self.config.input_path).await?;
        info!(
            posts = raw_posts.len(),
            input = %self.config.input_path.display(),
            "read raw scrape"
        );
        self.store.ensure_root().await?;

        let mut tally = RunTally {
            posts_read: raw_posts.len(),
            ..Default::default()
        };

        let outcomes = if self.config.fetch_concurrency <= 1 {
            let mut outcomes = Vec::with_capacity(raw_posts.len());
            for (index, raw) in raw_posts.iter().enumerate() {
                let outcome = self
                    .normalize_post_tallied(raw, index as u64 + 1, &mut tally)
                    .await;
                outcomes.push(outcome);
            }
            outcomes
        } else {
            self.normalize_concurrently(&raw_posts, &mut tally).await?
        };

        let mut posts = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(post) => posts.push(post),
                Err(rejection) => {
                    debug!(reason = rejection.label(), "post rejected");
                    tally.record_rejection(rejection);
                }
            }
        }
        if self.config.id_policy == IdPolicy::Dense {
            for (index, post) in posts.iter_mut().enumerate() {
                post.id = index as u64 + 1;
            }
        }
        tally.posts_written = posts.len();

        write_dataset(&self.config.output_path, &posts).await?;
        info!(
            posts = posts.len(),
            output = %self.config.output_path.display(),
            downloaded = tally.media_downloaded,
            reused = tally.media_reused,
            "wrote clean dataset"
        );

        Ok(NormalizeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_path: self.config.input_path.display().to_string(),
            output_path: self.config.output_path.display().to_string(),
            assets_dir: self.config.assets_dir.display().to_string(),
            id_policy: self.config.id_policy,
            tally,
        })
    }

    // Media of all posts fan out over a bounded set of workers; results are
    // keyed by (post, media) position and reassembled in input order.
    async fn normalize_concurrently(
        &self,
        raw_posts: &[RawPost],
        tally: &mut RunTally,
    ) -> Result<Vec<Result<NormalizedPost, PostRejection>>> {
        let screened = raw_posts.iter().map(screen_post).collect::<Vec<_>>();

        let limit = Arc::new(Semaphore::new(self.config.fetch_concurrency));
        let mut workers = JoinSet::new();
        for (post_index, raw) in raw_posts.iter().enumerate() {
            if screened[post_index].is_err() {
                continue;
            }
            for (media_index, item) in raw.media_items().iter().enumerate() {
                let permit = limit
                    .clone()
                    .acquire_owned()
                    .await
                    .context("acquiring media worker permit")?;
                let store = self.store.clone();
                let source = self.source.clone();
                let fragment = self.config.trusted_host_fragment.clone();
                let item = item.clone();
                workers.spawn(
                    async move {
                        let _permit = permit;
                        let outcome =
                            localize_media(&store, source.as_ref(), &fragment, &item).await;
                        (post_index, media_index, outcome)
                    }
                    .in_current_span(),
                );
            }
        }

        let mut results = HashMap::new();
        while let Some(joined) = workers.join_next().await {
            let (post_index, media_index, outcome) = joined.context("media worker panicked")?;
            results.insert((post_index, media_index), outcome);
        }

        let mut outcomes = Vec::with_capacity(raw_posts.len());
        for (post_index, (raw, screen)) in raw_posts.iter().zip(screened).enumerate() {
            if let Err(rejection) = screen {
                outcomes.push(Err(rejection));
                continue;
            }
            let mut post = base_post(raw, post_index as u64 + 1);
            for (media_index, item) in raw.media_items().iter().enumerate() {
                let outcome = results
                    .remove(&(post_index, media_index))
                    .context("missing media worker result")?;
                tally.record_media(&outcome);
                if let Ok(asset) = outcome {
                    post.media
                        .push(NormalizedMediaItem::from_raw(asset.public_path, item));
                }
            }
            outcomes.push(finish_post(post));
        }
        Ok(outcomes)
    }
}

pub async fn read_raw_posts(path: &Path) -> Result<Vec<RawPost>> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Pretty-print `posts` to a temp file next to `path` and rename it into place.
pub async fn write_dataset(path: &Path, posts: &[NormalizedPost]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating {}", parent.display()))?;

    let bytes = serde_json::to_vec_pretty(posts).context("serializing clean dataset")?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    fs::write(&temp_path, &bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("replacing {}", path.display()));
    }
    Ok(())
}

pub async fn run_normalize_once_from_env() -> Result<NormalizeRunSummary> {
    let normalizer = DatasetNormalizer::new(NormalizerConfig::from_env())?;
    normalizer.run_once().await
}

fn truncate_for_log(url: &str) -> String {
    const LIMIT: usize = 80;
    if url.chars().count() <= LIMIT {
        url.to_string()
    } else {
        format!("{}...", url.chars().take(LIMIT).collect::<String>())
    }
}
