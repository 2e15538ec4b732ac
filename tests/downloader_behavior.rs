use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use tokio::sync::Semaphore;

use music_metadata_processor::downloader::client::RetryingClient;
use music_metadata_processor::downloader::{Downloader, DEFAULT_CHUNK_COUNT};

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let raw = value.strip_prefix("bytes=")?;
    let (start, end) = raw.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

#[derive(Clone, Copy, PartialEq)]
enum RangeMode {
    /// Honors Range requests with 206 responses.
    Supported,
    /// Answers every ranged request with 500; plain requests succeed.
    Broken,
}

async fn spawn_origin(payload: Vec<u8>, mode: RangeMode) -> (String, Arc<AtomicUsize>) {
    let ranged_hits = Arc::new(AtomicUsize::new(0));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handler_hits = ranged_hits.clone();
    let app = Router::new().route(
        "/data.bin",
        get(move |headers: HeaderMap| {
            let payload = payload.clone();
            let hits = handler_hits.clone();
            async move {
                let range = headers
                    .get(header::RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_range);

                if let Some((start, end)) = range {
                    hits.fetch_add(1, Ordering::SeqCst);
                    if mode == RangeMode::Broken {
                        return Response::builder()
                            .status(StatusCode::INTERNAL_SERVER_ERROR)
                            .body(Body::empty())
                            .unwrap();
                    }
                    let end = end.min(payload.len() as u64 - 1);
                    let slice = payload[start as usize..=end as usize].to_vec();
                    return Response::builder()
                        .status(StatusCode::PARTIAL_CONTENT)
                        .header(
                            header::CONTENT_RANGE,
                            format!("bytes {start}-{end}/{}", payload.len()),
                        )
                        .body(Body::from(slice))
                        .unwrap();
                }

                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from(payload.to_vec()))
                    .unwrap()
            }
        }),
    );

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}/data.bin"), ranged_hits)
}

fn downloader() -> Downloader {
    let client = Arc::new(RetryingClient::new(16).unwrap());
    Downloader::new(client, Arc::new(Semaphore::new(10)))
}

fn residue_files(dir: &std::path::Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains(".part"))
        .collect()
}

#[tokio::test]
async fn chunked_download_matches_reference_bytes() {
    let payload = test_payload(100_003);
    let (url, ranged_hits) = spawn_origin(payload.clone(), RangeMode::Supported).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("data.bin");
    let task = downloader().download(&url, &dest).await.unwrap();

    assert_eq!(task.length, Some(payload.len() as u64));
    assert_eq!(task.chunks.len(), DEFAULT_CHUNK_COUNT as usize);
    assert_eq!(
        ranged_hits.load(Ordering::SeqCst),
        DEFAULT_CHUNK_COUNT as usize
    );

    let downloaded = std::fs::read(&dest).unwrap();
    assert_eq!(downloaded.len(), payload.len());
    assert_eq!(downloaded, payload, "reassembly must be byte-exact");
    assert!(residue_files(dir.path()).is_empty());
}

#[tokio::test]
async fn chunk_failure_falls_back_to_single_stream() {
    let payload = test_payload(50_000);
    let (url, ranged_hits) = spawn_origin(payload.clone(), RangeMode::Broken).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("data.bin");
    let task = downloader().download(&url, &dest).await.unwrap();

    // The ranged path was attempted and abandoned.
    assert!(ranged_hits.load(Ordering::SeqCst) > 0);
    assert!(task.chunks.is_empty(), "fallback reports single-stream mode");

    let downloaded = std::fs::read(&dest).unwrap();
    assert_eq!(downloaded, payload);
    assert!(
        residue_files(dir.path()).is_empty(),
        "no chunk residue may survive the fallback"
    );
}

#[tokio::test]
async fn unreachable_origin_fails_after_both_paths() {
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("data.bin");

    // Reserve a port, then close it so every connection is refused.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = downloader()
        .download(&format!("http://{addr}/data.bin"), &dest)
        .await;
    assert!(result.is_err());
    assert!(!dest.exists());
    assert!(residue_files(dir.path()).is_empty());
}

#[tokio::test]
async fn not_found_origin_fails_cleanly() {
    let (url, _hits) = spawn_origin(test_payload(1024), RangeMode::Supported).await;
    let missing = url.replace("data.bin", "missing.bin");

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("missing.bin");
    let result = downloader().download(&missing, &dest).await;

    assert!(result.is_err());
    assert!(!dest.exists());
}

#[tokio::test]
async fn small_resources_shrink_the_chunk_plan() {
    let payload = test_payload(5);
    let (url, _hits) = spawn_origin(payload.clone(), RangeMode::Supported).await;

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("data.bin");
    let task = downloader().download(&url, &dest).await.unwrap();

    assert_eq!(task.chunks.len(), 5);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}
