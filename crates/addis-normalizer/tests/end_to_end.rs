// Runs the normalizer against a local image host over real HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use addis_normalizer::{DatasetNormalizer, NormalizerConfig};
use addis_storage::AssetStore;
use axum::{http::StatusCode, routing::get, Router};
use serde_json::{json, Value};

async fn spawn_image_host(hits: Arc<AtomicUsize>) -> String {
    let app = Router::new()
        .route(
            "/photos/{name}",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    vec![0xffu8, 0xd8, 0xff, 0xe0]
                }
            }),
        )
        .route("/gone.jpg", get(|| async { StatusCode::GONE }))
        .route("/blank.jpg", get(|| async { StatusCode::NO_CONTENT }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn scrape_is_localized_over_http_and_rerun_is_free() {
    let hits = Arc::new(AtomicUsize::new(0));
    let base = spawn_image_host(hits.clone()).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let photo = format!("{base}/photos/one.jpg");
    let input = json!([
        {"text": "Workshop recap\nTwenty youth joined.", "likes": 12, "media": [
            {"thumbnail": photo.as_str(), "__typename": "Photo", "id": "111"},
            {"thumbnail": format!("{base}/gone.jpg")},
            {"image": {"uri": "https://elsewhere.example/p.jpg"}}
        ]},
        {"text": "", "media": [{"thumbnail": format!("{base}/gone.jpg")}]},
        {"text": "Same photo again", "media": [{"fallback_image": {"uri": photo.as_str()}}]},
        {"text": "", "media": [{"thumbnail": format!("{base}/blank.jpg")}]}
    ]);
    let input_path = dir.path().join("scrape.json");
    std::fs::write(&input_path, serde_json::to_vec(&input).unwrap()).unwrap();

    let config = NormalizerConfig {
        input_path,
        output_path: dir.path().join("out/clean_data.json"),
        assets_dir: dir.path().join("assets"),
        trusted_host_fragment: "127.0.0.1".to_string(),
        max_retries: 0,
        http_timeout_secs: 5,
        ..Default::default()
    };

    let summary = DatasetNormalizer::new(config.clone())
        .expect("normalizer")
        .run_once()
        .await
        .expect("first run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(summary.tally.posts_written, 2);
    assert_eq!(summary.tally.media_dropped["http_410"], 2);
    assert_eq!(summary.tally.media_dropped["untrusted_host"], 1);
    assert_eq!(summary.tally.media_dropped["http_204"], 1);
    assert_eq!(summary.tally.posts_rejected["no_surviving_content"], 2);
    assert_eq!(std::fs::read_dir(&config.assets_dir).unwrap().count(), 1);

    let expected_path = format!("/images/posts/{}.jpg", AssetStore::url_digest(&photo));
    let output: Value =
        serde_json::from_str(&std::fs::read_to_string(&config.output_path).unwrap()).unwrap();
    assert_eq!(output[0]["id"], 1);
    assert_eq!(output[0]["likes"], 12);
    assert_eq!(output[0]["media"].as_array().unwrap().len(), 1);
    assert_eq!(output[0]["media"][0]["local_path"], expected_path.as_str());
    assert_eq!(output[0]["media"][0]["original_id"], "111");
    assert_eq!(output[1]["id"], 3);
    assert_eq!(output[1]["media"][0]["local_path"], expected_path.as_str());

    let first_bytes = std::fs::read(&config.output_path).unwrap();
    DatasetNormalizer::new(config.clone())
        .expect("normalizer")
        .run_once()
        .await
        .expect("second run");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&config.output_path).unwrap(), first_bytes);
}
