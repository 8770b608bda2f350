//! Read-only JSON API over the clean dataset, applying the site's post selection rules.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addis_core::{NormalizedMediaItem, NormalizedPost};
use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "addis-web";

pub const DEFAULT_DATASET_PATH: &str = "src/data/clean_data.json";
pub const DEFAULT_BLOCKLIST_PATH: &str = "rules/blocked_images.yaml";

/// Assets known to render broken, used when no block list file exists.
pub const KNOWN_BROKEN_IMAGES: &[&str] = &[
    "/images/posts/d374cee7305200ad25c791ea44a95fb7.jpg",
    "/images/posts/f52ff913ef0012107148782b7d65de51.jpg",
];

const BLOG_MIN_TEXT: usize = 50;
const BLOG_TEXT_ONLY_MIN_TEXT: usize = 200;
const HIGHLIGHT_MIN_TEXT: usize = 100;
const HIGHLIGHT_LIMIT: usize = 5;
const RELATED_LIMIT: usize = 3;
const EXCERPT_CHARS: usize = 150;

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub dataset_path: PathBuf,
    pub blocklist_path: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("ADDIS_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            dataset_path: std::env::var("ADDIS_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATASET_PATH)),
            blocklist_path: std::env::var("ADDIS_BLOCKLIST_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_BLOCKLIST_PATH)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BlockListFile {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    paths: HashSet<String>,
}

impl BlockList {
    pub fn known_broken() -> Self {
        Self::from_paths(KNOWN_BROKEN_IMAGES.iter().copied())
    }

    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: BlockListFile = serde_yaml::from_str(text).context("parsing block list")?;
        Ok(Self::from_paths(file.paths))
    }

    /// Load the YAML block list, falling back to [`KNOWN_BROKEN_IMAGES`] when
    /// the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::known_broken());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn is_blocked(&self, local_path: &str) -> bool {
        self.paths.contains(local_path)
    }

    fn cover_is_blocked(&self, post: &NormalizedPost) -> bool {
        post.media
            .first()
            .map(|m| self.is_blocked(&m.local_path))
            .unwrap_or(false)
    }
}

/// Posts substantial enough for the blog index.
pub fn blog_posts<'a>(posts: &'a [NormalizedPost], blocked: &BlockList) -> Vec<&'a NormalizedPost> {
    posts
        .iter()
        .filter(|p| {
            let len = p.text_len();
            len > BLOG_MIN_TEXT
                && (!p.media.is_empty() || len > BLOG_TEXT_ONLY_MIN_TEXT)
                && !blocked.cover_is_blocked(p)
        })
        .collect()
}

/// Case-insensitive substring match over the post text; an empty query keeps everything.
/// The query is used as typed, surrounding whitespace included.
pub fn search_posts<'a>(posts: &[&'a NormalizedPost], query: &str) -> Vec<&'a NormalizedPost> {
    let needle = query.to_lowercase();
    posts
        .iter()
        .copied()
        .filter(|p| needle.is_empty() || p.text.to_lowercase().contains(&needle))
        .collect()
}

/// Highest engagement wins; on a tie the later post is kept.
pub fn featured_post<'a>(posts: &[&'a NormalizedPost]) -> Option<&'a NormalizedPost> {
    posts.iter().copied().reduce(|best, current| {
        if best.engagement() > current.engagement() {
            best
        } else {
            current
        }
    })
}

/// Posts shown in the listing grid. While a search is active the featured
/// post is left out, since it already heads the page.
pub fn listing_posts<'a>(
    blog: &[&'a NormalizedPost],
    query: &str,
    featured_id: Option<u64>,
) -> Vec<&'a NormalizedPost> {
    let matches = search_posts(blog, query);
    if query.is_empty() {
        return matches;
    }
    matches
        .into_iter()
        .filter(|p| featured_id.is_some_and(|id| p.id != id))
        .collect()
}

fn has_usable_cover(post: &NormalizedPost, blocked: &BlockList, min_text: usize) -> bool {
    !post.media.is_empty() && post.text_len() > min_text && !blocked.cover_is_blocked(post)
}

/// Home page carousel: the first posts with a usable cover image and real text.
pub fn highlights<'a>(posts: &'a [NormalizedPost], blocked: &BlockList) -> Vec<&'a NormalizedPost> {
    posts
        .iter()
        .filter(|p| has_usable_cover(p, blocked, HIGHLIGHT_MIN_TEXT))
        .take(HIGHLIGHT_LIMIT)
        .collect()
}

pub fn related_posts<'a>(
    posts: &'a [NormalizedPost],
    id: u64,
    blocked: &BlockList,
) -> Vec<&'a NormalizedPost> {
    posts
        .iter()
        .filter(|p| p.id != id && has_usable_cover(p, blocked, HIGHLIGHT_MIN_TEXT))
        .take(RELATED_LIMIT)
        .collect()
}

pub fn valid_media(post: &NormalizedPost, blocked: &BlockList) -> Vec<NormalizedMediaItem> {
    post.media
        .iter()
        .filter(|m| !blocked.is_blocked(&m.local_path))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: u64,
    pub title: String,
    pub excerpt: String,
    pub cover: Option<String>,
    pub likes: u64,
    pub comments: u64,
    pub shares: u64,
    pub media_count: usize,
}

impl PostSummary {
    pub fn from_post(post: &NormalizedPost) -> Self {
        Self {
            id: post.id,
            title: post.title().to_string(),
            excerpt: post.body().chars().take(EXCERPT_CHARS).collect(),
            cover: post.media.first().map(|m| m.local_path.clone()),
            likes: post.likes,
            comments: post.comments,
            shares: post.shares,
            media_count: post.media.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostListing {
    pub query: String,
    pub total: usize,
    pub featured_id: Option<u64>,
    pub posts: Vec<PostSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostDetail {
    pub post: NormalizedPost,
    pub title: String,
    pub body: String,
    pub valid_media: Vec<NormalizedMediaItem>,
    pub related: Vec<PostSummary>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingQuery {
    pub q: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub dataset_path: PathBuf,
    pub blocked: BlockList,
}

impl AppState {
    pub fn new(dataset_path: impl Into<PathBuf>, blocked: BlockList) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            blocked,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/posts", get(posts_handler))
        .route("/api/posts/featured", get(featured_handler))
        .route("/api/posts/{id}", get(post_detail_handler))
        .route("/api/highlights", get(highlights_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig) -> anyhow::Result<()> {
    let blocked = BlockList::load(&config.blocklist_path)?;
    let state = AppState::new(config.dataset_path.clone(), blocked);
    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, dataset = %config.dataset_path.display(), "serving dataset api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(WebConfig::from_env()).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn posts_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    match load_dataset(&state.dataset_path).await {
        Ok(posts) => {
            let blog = blog_posts(&posts, &state.blocked);
            let featured_id = featured_post(&blog).map(|p| p.id);
            let q = query.q.unwrap_or_default();
            let matches = listing_posts(&blog, &q, featured_id);
            Json(PostListing {
                query: q,
                total: matches.len(),
                featured_id,
                posts: matches.into_iter().map(PostSummary::from_post).collect(),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn featured_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state.dataset_path).await {
        Ok(posts) => {
            let blog = blog_posts(&posts, &state.blocked);
            match featured_post(&blog) {
                Some(post) => Json(PostSummary::from_post(post)).into_response(),
                None => json_error(StatusCode::NOT_FOUND, "no featured post".to_string()),
            }
        }
        Err(err) => server_error(err),
    }
}

async fn highlights_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state.dataset_path).await {
        Ok(posts) => Json(
            highlights(&posts, &state.blocked)
                .into_iter()
                .map(PostSummary::from_post)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn post_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    let Ok(id) = raw_id.parse::<u64>() else {
        return json_error(StatusCode::BAD_REQUEST, format!("invalid post id `{raw_id}`"));
    };
    match load_dataset(&state.dataset_path).await {
        Ok(posts) => {
            let Some(post) = posts.iter().find(|p| p.id == id) else {
                return json_error(StatusCode::NOT_FOUND, format!("post {id} not found"));
            };
            Json(PostDetail {
                title: post.title().to_string(),
                body: post.body(),
                valid_media: valid_media(post, &state.blocked),
                related: related_posts(&posts, id, &state.blocked)
                    .into_iter()
                    .map(PostSummary::from_post)
                    .collect(),
                post: post.clone(),
            })
            .into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn load_dataset(path: &Path) -> anyhow::Result<Vec<NormalizedPost>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn json_error(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %format!("{err:#}"), "dataset api request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BROKEN: &str = "/images/posts/d374cee7305200ad25c791ea44a95fb7.jpg";

    fn post(id: u64, text: &str, covers: &[&str], engagement: u64) -> NormalizedPost {
        NormalizedPost {
            id,
            text: text.to_string(),
            url: String::new(),
            likes: engagement,
            comments: 0,
            shares: 0,
            media: covers
                .iter()
                .map(|path| NormalizedMediaItem {
                    local_path: path.to_string(),
                    ocr_text: String::new(),
                    media_type: "Photo".into(),
                    original_id: String::new(),
                })
                .collect(),
        }
    }

    fn long(prefix: &str, len: usize) -> String {
        format!("{prefix}\n{}", "x".repeat(len))
    }

    fn sample_posts() -> Vec<NormalizedPost> {
        vec![
            post(1, &long("Youth workshop", 120), &["/images/posts/a.jpg"], 10),
            post(2, "too short", &["/images/posts/b.jpg"], 99),
            post(3, &long("Text only but long", 250), &[], 40),
            post(5, &long("Text only medium", 80), &[], 500),
            post(6, &long("Broken cover", 150), &[BROKEN, "/images/posts/c.jpg"], 700),
            post(8, &long("Gallery day", 150), &["/images/posts/d.jpg", BROKEN], 40),
        ]
    }

    #[test]
    fn blog_listing_applies_length_and_cover_rules() {
        let posts = sample_posts();
        let ids = blog_posts(&posts, &BlockList::known_broken())
            .iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 3, 8]);
    }

    #[test]
    fn featured_prefers_engagement_and_later_post_on_tie() {
        let posts = sample_posts();
        let blog = blog_posts(&posts, &BlockList::known_broken());
        assert_eq!(featured_post(&blog).map(|p| p.id), Some(8));
        assert_eq!(featured_post(&[]).map(|p| p.id), None);
    }

    #[test]
    fn search_is_case_insensitive() {
        let posts = sample_posts();
        let blog = blog_posts(&posts, &BlockList::known_broken());
        let ids = search_posts(&blog, "GALLERY")
            .iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![8]);
        assert!(search_posts(&blog, "  GALLERY ").is_empty());
        assert_eq!(search_posts(&blog, "").len(), 3);
    }

    #[test]
    fn active_search_leaves_out_the_featured_post() {
        let posts = sample_posts();
        let blog = blog_posts(&posts, &BlockList::known_broken());
        let featured = featured_post(&blog).map(|p| p.id);
        let ids = |query: &str| {
            listing_posts(&blog, query, featured)
                .iter()
                .map(|p| p.id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(""), vec![1, 3, 8]);
        assert_eq!(ids("x"), vec![1, 3]);
        assert!(ids("gallery").is_empty());
        assert!(listing_posts(&[], "x", None).is_empty());
    }

    #[test]
    fn highlights_and_related_skip_blocked_covers() {
        let posts = sample_posts();
        let blocked = BlockList::known_broken();
        let hl = highlights(&posts, &blocked)
            .iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(hl, vec![1, 8]);
        let related = related_posts(&posts, 1, &blocked)
            .iter()
            .map(|p| p.id)
            .collect::<Vec<_>>();
        assert_eq!(related, vec![8]);
        assert_eq!(valid_media(&posts[5], &blocked).len(), 1);
    }

    #[test]
    fn block_list_yaml_replaces_defaults() {
        let blocked = BlockList::from_yaml_str("version: 1\npaths:\n  - /images/posts/a.jpg\n")
            .expect("yaml");
        assert!(blocked.is_blocked("/images/posts/a.jpg"));
        assert!(!blocked.is_blocked(BROKEN));

        let dir = tempfile::tempdir().unwrap();
        let missing = BlockList::load(&dir.path().join("nope.yaml")).expect("fallback");
        assert_eq!(missing, BlockList::known_broken());
    }

    #[test]
    fn repository_block_list_matches_known_broken_images() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/blocked_images.yaml");
        assert_eq!(BlockList::load(&path).expect("rules"), BlockList::known_broken());
    }

    fn test_app(posts: &[NormalizedPost]) -> (TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clean_data.json");
        std::fs::write(&path, serde_json::to_vec_pretty(posts).unwrap()).unwrap();
        let router = app(AppState::new(path, BlockList::known_broken()));
        (dir, router)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn handler_lists_posts_with_search() {
        let (_dir, router) = test_app(&sample_posts());
        let (status, body) = get_json(router.clone(), "/api/posts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        assert_eq!(body["featured_id"], 8);
        assert_eq!(body["posts"][0]["title"], "Youth workshop");
        assert_eq!(body["posts"][0]["cover"], "/images/posts/a.jpg");

        let (_, body) = get_json(router.clone(), "/api/posts?q=workshop").await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["query"], "workshop");

        let (_, body) = get_json(router, "/api/posts?q=gallery").await;
        assert_eq!(body["total"], 0);
        assert_eq!(body["featured_id"], 8);
    }

    #[tokio::test]
    async fn handler_returns_detail_with_related_and_valid_media() {
        let (_dir, router) = test_app(&sample_posts());
        let (status, body) = get_json(router, "/api/posts/8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Gallery day");
        assert_eq!(body["post"]["media"].as_array().unwrap().len(), 2);
        assert_eq!(body["valid_media"].as_array().unwrap().len(), 1);
        assert_eq!(body["related"][0]["id"], 1);
    }

    #[tokio::test]
    async fn handler_detail_error_paths() {
        let (_dir, router) = test_app(&sample_posts());
        let (status, body) = get_json(router.clone(), "/api/posts/4").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "post 4 not found");

        let (status, _) = get_json(router, "/api/posts/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_featured_and_highlights() {
        let (_dir, router) = test_app(&sample_posts());
        let (status, body) = get_json(router.clone(), "/api/posts/featured").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 8);

        let (_, body) = get_json(router, "/api/highlights").await;
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (_dir, empty) = test_app(&[]);
        let (status, _) = get_json(empty, "/api/posts/featured").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn handler_reports_missing_dataset() {
        let router = app(AppState::new("/definitely/missing.json", BlockList::default()));
        let (status, body) = get_json(router, "/api/posts").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("reading"));
    }
}
