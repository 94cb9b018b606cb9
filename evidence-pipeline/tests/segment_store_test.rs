mod common;

use common::{fast_store_config, init_tracing, Failure, MemoryBackend};
use evidence_pipeline::{LocalBackend, ObjectBackend, PipelineError, SegmentStore};
use std::sync::Arc;

fn store(backend: Arc<MemoryBackend>) -> SegmentStore {
    SegmentStore::new(backend, fast_store_config())
}

#[tokio::test]
async fn test_download_recovers_from_transient_errors() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let key = backend.insert_segment(7, 42, 0, 100);
    backend.fail_get(&key, Failure::Transient, 2);

    let dir = tempfile::tempdir().unwrap();
    let path = store(backend.clone()).download(&key, dir.path()).await.unwrap();

    assert_eq!(path, dir.path().join("webcam_0_100.webm"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "duration=100\n");
    assert_eq!(backend.get_calls(&key), 3);
}

#[tokio::test]
async fn test_exhausted_retries_are_store_unavailable() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let key = backend.insert_segment(7, 42, 0, 100);
    backend.fail_get(&key, Failure::Transient, u32::MAX);

    let dir = tempfile::tempdir().unwrap();
    let err = store(backend.clone()).download(&key, dir.path()).await.unwrap_err();

    match err {
        PipelineError::StoreUnavailable { attempts, message } => {
            assert_eq!(attempts, 3);
            assert!(message.contains("connection reset"));
        }
        other => panic!("expected StoreUnavailable, got {:?}", other),
    }
    assert_eq!(backend.get_calls(&key), 3);

    // The interrupted transfer left nothing behind
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_missing_object_is_not_retried() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let dir = tempfile::tempdir().unwrap();

    let err = store(backend.clone())
        .download("7/42/webcam_0_100.webm", dir.path())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ObjectNotFound(_)));
    assert_eq!(backend.get_calls("7/42/webcam_0_100.webm"), 1);
}

#[tokio::test]
async fn test_list_is_sorted_and_scoped_to_prefix() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_segment(7, 42, 150, 260);
    backend.insert_segment(7, 42, 0, 100);
    backend.insert_segment(7, 43, 0, 100);
    backend.fail_list(1);

    let keys = store(backend).list("7/42/").await.unwrap();

    assert_eq!(keys, vec!["7/42/webcam_0_100.webm", "7/42/webcam_150_260.webm"]);
}

#[tokio::test]
async fn test_upload_segment_uses_the_naming_scheme() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    let store = store(backend.clone());

    let dir = tempfile::tempdir().unwrap();
    let recording = dir.path().join("chunk.webm");
    std::fs::write(&recording, "duration=60\n").unwrap();

    let key = store.upload_segment(&recording, 7, 42, 60, 120, "webm").await.unwrap();
    assert_eq!(key, "7/42/webcam_60_120.webm");
    assert_eq!(backend.object(&key).as_deref(), Some("duration=60\n"));

    let err = store.upload_segment(&recording, 7, 42, 120, 120, "webm").await.unwrap_err();
    assert!(matches!(err, PipelineError::MalformedSegment(_)));
    assert_eq!(backend.keys().len(), 1);
}

#[tokio::test]
async fn test_upload_retries_then_succeeds() {
    init_tracing();
    let backend = Arc::new(MemoryBackend::new());
    backend.fail_put(2);

    let dir = tempfile::tempdir().unwrap();
    let merged = dir.path().join("merged.webm");
    std::fs::write(&merged, "duration=10\n").unwrap();

    store(backend.clone()).upload(&merged, "7/42/merged.webm").await.unwrap();
    assert_eq!(backend.object("7/42/merged.webm").as_deref(), Some("duration=10\n"));
}

#[tokio::test]
async fn test_local_backend_round_trip() {
    init_tracing();
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(root.path()).with_public_base_url("https://media.example.com/");

    let src = scratch.path().join("chunk.webm");
    std::fs::write(&src, "segment").unwrap();
    backend.put_from_path(&src, "7/42/webcam_0_10.webm").await.unwrap();
    backend.put_from_path(&src, "7/43/webcam_0_10.webm").await.unwrap();

    let keys = backend.list_keys("7/42/").await.unwrap();
    assert_eq!(keys, vec!["7/42/webcam_0_10.webm"]);

    let dest = scratch.path().join("copy.webm");
    backend.get_to_path("7/42/webcam_0_10.webm", &dest).await.unwrap();
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "segment");

    let missing = backend.get_to_path("7/42/webcam_10_20.webm", &dest).await.unwrap_err();
    assert!(matches!(missing, PipelineError::ObjectNotFound(_)));

    assert_eq!(
        backend.public_url("7/42/merged.webm").unwrap(),
        "https://media.example.com/7/42/merged.webm"
    );
    assert!(backend.put_from_path(&src, "../escape.webm").await.is_err());
}

#[tokio::test]
async fn test_local_backend_file_urls() {
    let root = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(root.path());

    let url = backend.public_url("7/42/merged.webm").unwrap();
    assert!(url.starts_with("file://"));
    assert!(url.ends_with("/7/42/merged.webm"));
}
