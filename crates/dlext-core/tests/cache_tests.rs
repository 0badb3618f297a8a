//! Integration tests for the fetch/verify/extract cache.

mod common;

use common::{fixture, list_dir, pending_leftovers, FakeDownloader, FOO_CONTENT};
use dlext_core::{ArtifactCache, ContentDigest, DlextError, FetchRequest};
use std::sync::Arc;
use tempfile::TempDir;

fn hash_of(name: &str) -> String {
    ContentDigest::of_bytes(fixture(name)).to_string()
}

fn setup() -> (TempDir, Arc<FakeDownloader>, ArtifactCache) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let downloader = Arc::new(FakeDownloader::with_fixtures());
    let cache = ArtifactCache::new(downloader.clone());
    (temp_dir, downloader, cache)
}

#[tokio::test]
async fn test_downloads_file_with_correct_hash() {
    let (temp_dir, downloader, cache) = setup();
    let uri = "http://x/foo.txt";
    let hash = hash_of("foo.txt");

    let outcome = cache
        .fetch(&FetchRequest::new(uri, &hash).with_base_path(temp_dir.path()))
        .await
        .unwrap();

    let expected_name = format!("{}.{}.file", ContentDigest::of_bytes(uri), hash);
    assert_eq!(
        outcome.download_path.file_name().unwrap().to_string_lossy(),
        expected_name
    );
    assert_eq!(std::fs::read(&outcome.download_path).unwrap(), FOO_CONTENT);
    assert!(!outcome.extracted);
    assert!(outcome.extract_path.is_none());
    assert_eq!(downloader.calls(), 1);
    assert!(pending_leftovers(temp_dir.path()).is_empty());
    assert!(cache.pending().is_empty());
}

#[tokio::test]
async fn test_second_fetch_skips_download() {
    let (temp_dir, downloader, cache) = setup();
    let request = FetchRequest::new("http://x/foo.txt", hash_of("foo.txt"))
        .with_base_path(temp_dir.path());

    let first = cache.fetch(&request).await.unwrap();
    let second = cache.fetch(&request).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(downloader.calls(), 1);
}

#[tokio::test]
async fn test_stale_file_is_replaced() {
    let (temp_dir, downloader, cache) = setup();
    let request = FetchRequest::new("http://x/foo.txt", hash_of("foo.txt"))
        .with_base_path(temp_dir.path());

    let outcome = cache.fetch(&request).await.unwrap();
    std::fs::write(&outcome.download_path, b"corrupted").unwrap();

    let outcome = cache.fetch(&request).await.unwrap();

    assert_eq!(downloader.calls(), 2);
    assert_eq!(std::fs::read(&outcome.download_path).unwrap(), FOO_CONTENT);
}

#[tokio::test]
async fn test_hash_mismatch_commits_nothing() {
    let (temp_dir, downloader, cache) = setup();
    let request =
        FetchRequest::new("http://x/foo.txt", "not-a-real-hash").with_base_path(temp_dir.path());

    let result = cache.fetch(&request).await;

    match result {
        Err(DlextError::HashMismatch { expected, actual }) => {
            assert_eq!(expected, "not-a-real-hash");
            assert_eq!(actual, Some(hash_of("foo.txt")));
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
    assert_eq!(downloader.calls(), 1);
    assert!(list_dir(temp_dir.path()).is_empty());
    assert!(cache.pending().is_empty());
}

#[tokio::test]
async fn test_mismatch_is_not_retried_automatically() {
    let (temp_dir, downloader, cache) = setup();
    let request =
        FetchRequest::new("http://x/foo.txt", "not-a-real-hash").with_base_path(temp_dir.path());

    assert!(cache.fetch(&request).await.is_err());
    assert!(cache.fetch(&request).await.is_err());
    assert_eq!(downloader.calls(), 2);
}

#[tokio::test]
async fn test_downloader_error_propagates_and_cleans_up() {
    let (temp_dir, _downloader, cache) = setup();
    let request =
        FetchRequest::new("http://x/missing.bin", "whatever").with_base_path(temp_dir.path());

    let result = cache.fetch(&request).await;

    assert!(matches!(result, Err(DlextError::DownloadFailed { .. })));
    assert!(list_dir(temp_dir.path()).is_empty());
    assert!(cache.pending().is_empty());
}

#[tokio::test]
async fn test_fetch_extracts_tar() {
    let (temp_dir, _downloader, cache) = setup();
    let request = FetchRequest::new("http://x/foo.tar", hash_of("foo.tar"))
        .with_base_path(temp_dir.path());

    let outcome = cache.fetch(&request).await.unwrap();

    assert!(outcome.extracted);
    let extract_path = outcome.extract_path.unwrap();
    assert!(extract_path.to_string_lossy().ends_with(".dir"));
    assert_eq!(list_dir(&extract_path), vec!["foo.txt"]);
    assert_eq!(std::fs::read(extract_path.join("foo.txt")).unwrap(), FOO_CONTENT);
    assert!(pending_leftovers(temp_dir.path()).is_empty());
}

#[tokio::test]
async fn test_fetch_extracts_compressed_and_zip() {
    let (temp_dir, _downloader, cache) = setup();

    for name in ["foo.zip", "foo.tar.gz", "foo.tar.bz2", "foo.tar.xz"] {
        let request = FetchRequest::new(format!("http://x/{name}"), hash_of(name))
            .with_base_path(temp_dir.path());

        let outcome = cache.fetch(&request).await.unwrap();

        let extract_path = outcome.extract_path.expect(name);
        assert_eq!(list_dir(&extract_path), vec!["foo.txt"], "{name}");
    }
}

#[tokio::test]
async fn test_extract_disabled_then_enabled() {
    let (temp_dir, downloader, cache) = setup();
    let request = FetchRequest::new("http://x/foo.tar", hash_of("foo.tar"))
        .with_base_path(temp_dir.path())
        .with_extract(false);

    let outcome = cache.fetch(&request).await.unwrap();
    assert!(!outcome.extracted);
    assert_eq!(list_dir(temp_dir.path()).len(), 1);

    let outcome = cache.fetch(&request.with_extract(true)).await.unwrap();
    assert!(outcome.extracted);
    assert_eq!(downloader.calls(), 1);
}

#[tokio::test]
async fn test_existing_dir_counts_as_extracted() {
    let (temp_dir, _downloader, cache) = setup();
    let uri = "http://x/foo.txt";
    let hash = hash_of("foo.txt");

    // Contents of an existing directory are not re-validated.
    let entry = cache.entry(uri, &hash, temp_dir.path()).await.unwrap();
    std::fs::create_dir_all(&entry.dir_path).unwrap();

    let outcome = cache
        .fetch(&FetchRequest::new(uri, &hash).with_base_path(temp_dir.path()))
        .await
        .unwrap();

    assert!(outcome.extracted);
    assert_eq!(outcome.extract_path, Some(entry.dir_path.clone()));
    assert!(list_dir(&entry.dir_path).is_empty());
}

#[tokio::test]
async fn test_non_archive_leaves_no_directory() {
    let (temp_dir, _downloader, cache) = setup();
    let request = FetchRequest::new("http://x/foo.txt", hash_of("foo.txt"))
        .with_base_path(temp_dir.path());

    let outcome = cache.fetch(&request).await.unwrap();

    assert!(!outcome.extracted);
    let names = list_dir(temp_dir.path());
    assert_eq!(names.len(), 1);
    assert!(names[0].ends_with(".file"));
}

#[tokio::test]
async fn test_corrupt_archive_keeps_file_but_no_dir() {
    let (temp_dir, downloader, cache) = setup();
    // Zip signature, but no central directory.
    let body = b"PK\x03\x04 this is not really a zip".to_vec();
    downloader.serve("broken.zip", body.clone());

    let hash = ContentDigest::of_bytes(&body).to_string();
    let request =
        FetchRequest::new("http://x/broken.zip", &hash).with_base_path(temp_dir.path());

    let result = cache.fetch(&request).await;

    assert!(
        matches!(result, Err(DlextError::Archive { .. })),
        "broken zip should fail: {result:?}"
    );
    let names = list_dir(temp_dir.path());
    assert_eq!(names.len(), 1, "{names:?}");
    assert!(names[0].ends_with(".file"));
    assert!(cache.pending().is_empty());

    let entry = cache
        .entry("http://x/broken.zip", &hash, temp_dir.path())
        .await
        .unwrap();
    assert!(entry.file_present);
    assert!(!entry.dir_present);
}

#[tokio::test]
async fn test_standard_base64_hash_is_canonicalized() {
    let (temp_dir, downloader, cache) = setup();
    let canonical = hash_of("foo.txt");
    let standard: String = canonical
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .chain("=".chars())
        .collect();

    let outcome = cache
        .fetch(&FetchRequest::new("http://x/foo.txt", standard).with_base_path(temp_dir.path()))
        .await
        .unwrap();

    assert!(outcome
        .download_path
        .to_string_lossy()
        .contains(&format!(".{canonical}.file")));
    assert_eq!(downloader.calls(), 1);
}

#[tokio::test]
async fn test_base_path_is_created() {
    let (temp_dir, _downloader, cache) = setup();
    let base = temp_dir.path().join("nested").join("cache");

    let outcome = cache
        .fetch(&FetchRequest::new("http://x/foo.txt", hash_of("foo.txt")).with_base_path(&base))
        .await
        .unwrap();

    assert!(outcome.download_path.starts_with(&base));
}

#[tokio::test]
async fn test_shared_tracker_sees_no_leftovers() {
    let (temp_dir, downloader, _) = setup();
    let pending = dlext_core::PendingTracker::new();
    let cache = ArtifactCache::new(downloader).with_pending_tracker(pending.clone());

    cache
        .fetch(&FetchRequest::new("http://x/foo.tar.gz", hash_of("foo.tar.gz"))
            .with_base_path(temp_dir.path()))
        .await
        .unwrap();

    assert!(pending.is_empty());
    assert_eq!(pending.cleanup_remaining(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_fetches_of_one_key_both_succeed() {
    let downloader = Arc::new(FakeDownloader::with_fixtures());
    let cache = ArtifactCache::new(downloader);

    for name in ["foo.tar", "foo.tar.gz", "foo.txt"] {
        for _ in 0..20 {
            let temp_dir = TempDir::new().unwrap();
            let request = FetchRequest::new(format!("http://x/{name}"), hash_of(name))
                .with_base_path(temp_dir.path());

            let (first, second) = tokio::join!(cache.fetch(&request), cache.fetch(&request));
            let first = first.unwrap();
            let second = second.unwrap();

            assert_eq!(first, second, "{name}");
            assert_eq!(std::fs::read(&first.download_path).unwrap(), fixture(name));
            if let Some(extract_path) = &first.extract_path {
                assert_eq!(list_dir(extract_path), vec!["foo.txt"], "{name}");
            }
            assert!(pending_leftovers(temp_dir.path()).is_empty(), "{name}");
            assert!(cache.pending().is_empty(), "{name}");
        }
    }
}

#[tokio::test]
async fn test_cleanup_guard_removes_unsettled_pending_paths() {
    let (temp_dir, _, cache) = setup();
    let staged = {
        let pending = cache.pending().stage(temp_dir.path().join("slot.dir"));
        std::fs::create_dir(pending.path()).unwrap();
        pending.path().to_path_buf()
    };
    assert!(staged.exists());

    drop(cache.pending().cleanup_on_drop());

    assert!(!staged.exists());
    assert!(cache.pending().is_empty());
}
