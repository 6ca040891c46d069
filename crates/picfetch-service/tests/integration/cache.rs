use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use picfetch_service::config::{CacheConfig, Config};
use picfetch_service::{CacheKey, DefaultCodec, ImageCache, ImageCodec};
use picfetch_test as test;

use crate::utils::*;

fn setup_cache(config: CacheConfig) -> (ImageCache, TempDir) {
    test::setup();
    let cache_dir = test::tempdir();
    let config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        caches: config,
        ..Default::default()
    };
    let cache = ImageCache::from_config(&config, Arc::new(DefaultCodec)).unwrap();
    (cache, cache_dir)
}

#[tokio::test]
async fn test_roundtrip() {
    let (cache, cache_dir) = setup_cache(CacheConfig::default());
    let key = CacheKey::new("https://example.com/cat.jpg");
    let bytes = test::jpeg_bytes(42);
    let image = DefaultCodec.decode(&bytes).unwrap();

    cache.store(image.clone(), Some(bytes.clone()), &key, true);
    cache.flush().await;
    assert!(cache_dir.path().join("images").join(key.file_name()).is_file());

    cache.clear_memory();
    let loaded = cache.image_from_key(&key, true).unwrap();
    assert_eq!(loaded.as_dynamic(), image.as_dynamic());
    assert_eq!(cache.size(), bytes.len() as u64);
}

#[tokio::test]
async fn test_last_write_wins() {
    let (cache, _cache_dir) = setup_cache(CacheConfig::default());
    let key = CacheKey::new("https://example.com/cat.png");
    let first = test::png_bytes(1);
    let second = test::png_bytes(2);

    for bytes in [&first, &second] {
        let image = DefaultCodec.decode(bytes).unwrap();
        cache.store(image, Some(bytes.clone()), &key, true);
    }
    cache.flush().await;
    cache.clear_memory();

    let loaded = cache.query_disk(&key).await.unwrap();
    let expected = DefaultCodec.decode(&second).unwrap();
    assert_eq!(loaded.as_dynamic(), expected.as_dynamic());
}

#[tokio::test]
async fn test_query_delivers_exactly_once() {
    let (cache, _cache_dir) = setup_cache(CacheConfig::default());
    let keys: Vec<_> = (0..8)
        .map(|i| CacheKey::new(format!("https://example.com/{i}.png")))
        .collect();
    for key in keys.iter().step_by(2) {
        cache.store_image(DefaultCodec.decode(&test::png_bytes(1)).unwrap(), key);
    }
    cache.flush().await;
    cache.clear_memory();

    run_local(async {
        let results = Rc::new(RefCell::new(Vec::new()));
        // every key is queried three times, without any coalescing
        for _ in 0..3 {
            for (i, key) in keys.iter().enumerate() {
                let results = results.clone();
                cache.query_disk_with(key, i, move |image, _key, i| {
                    results.borrow_mut().push((i, image.is_some()));
                });
            }
        }

        wait_until(|| results.borrow().len() == 24).await;
        settle_cache(&cache).await;

        let mut results = results.borrow().clone();
        results.sort();
        let expected: Vec<_> = (0..8)
            .flat_map(|i| std::iter::repeat((i, i % 2 == 0)).take(3))
            .collect();
        assert_eq!(results, expected);
    })
    .await;
}

async fn settle_cache(cache: &ImageCache) {
    cache.flush().await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_sweep_by_age() {
    let (cache, _cache_dir) = setup_cache(CacheConfig {
        max_age: Duration::from_secs(1),
        ..Default::default()
    });
    let old = CacheKey::new("https://example.com/old.png");
    let fresh = CacheKey::new("https://example.com/fresh.png");
    let bytes = test::png_bytes(1);
    let image = DefaultCodec.decode(&bytes).unwrap();

    cache.store(image.clone(), Some(bytes.clone()), &old, true);
    cache.store(image, Some(bytes.clone()), &fresh, true);
    cache.flush().await;

    let two_seconds_ago = SystemTime::now() - Duration::from_secs(2);
    filetime::set_file_mtime(
        cache.disk().file_path(&old),
        FileTime::from_system_time(two_seconds_ago),
    )
    .unwrap();

    cache.sweep();
    cache.flush().await;
    cache.clear_memory();

    assert!(!cache.has_key(&old));
    assert!(cache.has_key(&fresh));
    assert!(cache.image_from_key(&old, true).is_none());
    assert!(cache.image_from_key(&fresh, true).is_some());
    assert_eq!(cache.size(), bytes.len() as u64);
}

#[tokio::test]
async fn test_clear_disk_then_store() {
    let (cache, _cache_dir) = setup_cache(CacheConfig::default());
    let key = CacheKey::new("https://example.com/cat.png");
    let image = DefaultCodec.decode(&test::png_bytes(1)).unwrap();

    cache.store_image(image.clone(), &key);
    cache.clear_disk();
    cache.store_image(image, &key);
    cache.flush().await;

    // both writes and the clear run on the same queue, in order
    cache.clear_memory();
    assert!(cache.image_from_key(&key, true).is_some());
}
