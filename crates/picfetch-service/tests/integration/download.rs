use std::sync::Arc;

use picfetch_service::config::{CacheConfig, DownloadConfig};
use picfetch_service::manager::{ImageRequest, Options};
use picfetch_service::{
    CacheKey, DefaultCodec, HttpDownloader, ImageCache, ImageCodec, ImageError, RequestManager,
};
use picfetch_test as test;

use crate::utils::*;

fn setup_http_manager() -> (RequestManager, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = ImageCache::new(
        cache_dir.path(),
        CacheConfig::default(),
        Arc::new(DefaultCodec),
    )
    .unwrap();
    let downloader = HttpDownloader::from_config(&DownloadConfig::default()).unwrap();

    (RequestManager::new(cache, Arc::new(downloader)), cache_dir)
}

#[tokio::test]
async fn test_fetch_over_http() {
    run_local(async {
        let server = Server::new();
        let (manager, _cache_dir) = setup_http_manager();
        let url = server.url("png/5/cat.png");
        let a = RecordingSubscriber::new();
        let b = RecordingSubscriber::new();

        manager.request(&url, &subscriber(&a));
        manager.request(&url, &subscriber(&b));
        wait_until(|| a.count() == 1 && b.count() == 1).await;

        let expected = DefaultCodec.decode(&test::png_bytes(5)).unwrap();
        assert_eq!(a.images()[0].as_dynamic(), expected.as_dynamic());
        assert_eq!(server.accesses(), 1);

        // the original bytes end up on disk
        manager.cache().flush().await;
        let key = CacheKey::from_url(&url);
        let on_disk = std::fs::read(manager.cache().disk().file_path(&key)).unwrap();
        assert_eq!(on_disk, test::png_bytes(5));

        // and the next request does not hit the network
        let c = RecordingSubscriber::new();
        manager.request(&url, &subscriber(&c));
        wait_until(|| c.count() == 1).await;
        assert_eq!(server.accesses(), 0);
    })
    .await;
}

#[tokio::test]
async fn test_http_errors() {
    run_local(async {
        let server = Server::new();
        let (manager, _cache_dir) = setup_http_manager();
        let missing = server.url("respond_statuscode/404/cat.png");
        let garbage = server.url("garbage_data/cat.png");
        let a = RecordingSubscriber::new();

        manager.request(&missing, &subscriber(&a));
        manager.request(
            ImageRequest::from(&garbage).options(Options::LOW_PRIORITY),
            &subscriber(&a),
        );
        wait_until(|| a.count() == 2).await;

        for (url, error) in a.failures() {
            let url = url.unwrap();
            if url == missing {
                assert!(matches!(error, ImageError::NetworkFailed(_)));
            } else {
                assert_eq!(url, garbage);
                assert!(matches!(error, ImageError::DecodeFailed(_)));
            }
        }
        assert!(manager.is_failed(&missing));
        assert!(manager.is_failed(&garbage));
    })
    .await;
}
