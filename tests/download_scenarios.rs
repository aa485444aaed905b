//! End-to-end scenarios for `Manager::download_image`, exercised with a
//! scripted downloader and a synchronous main executor so every
//! completion is observed deterministically before an assertion runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{DynamicImage, Rgba, RgbaImage};

use snapcache::codec::{self, DecodedImage};
use snapcache::config::CacheConfig;
use snapcache::downloader::test_double::{ScriptedDownloader, ScriptedEvent};
use snapcache::executor::{IoExecutor, SyncMainExecutor};
use snapcache::{CacheSourceTag, DownloaderError, ImageCache, Manager, ManagerError, ManagerOptions, UrlError};

fn solid_png(width: u32, height: u32) -> (DecodedImage, Vec<u8>) {
    let buffer = RgbaImage::from_pixel(width, height, Rgba([40, 80, 120, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(buffer)
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    let image = codec::decode_image(&bytes, "https://h/scenario.png").unwrap();
    (image, bytes)
}

fn manager_with_downloader(dir: &std::path::Path, downloader: Arc<ScriptedDownloader>) -> Arc<Manager> {
    let config = CacheConfig::builder().namespace("scenarios").root(dir).build();
    let cache = Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(SyncMainExecutor)));
    Manager::builder(cache, downloader, Arc::new(SyncMainExecutor)).build()
}

type Delivery = (bool, Option<ManagerError>, CacheSourceTag, bool, String);

fn record(slot: Arc<Mutex<Vec<Delivery>>>) -> snapcache::manager::ManagerCompletion {
    Box::new(move |image, error, source, finished, url| {
        slot.lock().unwrap().push((image.is_some(), error, source, finished, url));
    })
}

/// S1: a cold fetch populates both tiers and delivers exactly once.
#[tokio::test]
async fn s1_cold_fetch_populates_memory_and_disk() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    let (image, bytes) = solid_png(8, 8);
    downloader.script(
        "https://h/x.png",
        ScriptedEvent { image: Some(image), bytes: Some(bytes.clone()), error: None, finished: true },
    );
    let manager = manager_with_downloader(dir.path(), downloader);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    manager.download_image(
        Some("https://h/x.png".to_string()),
        ManagerOptions::empty(),
        None,
        record(Arc::clone(&deliveries)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (has_image, error, _source, finished, url) = &deliveries[0];
    assert!(has_image);
    assert!(error.is_none());
    assert!(finished);
    assert_eq!(url, "https://h/x.png");
    assert!(manager.cached_image_exists("https://h/x.png"));

    let on_disk = std::fs::read_dir(dir.path().join("com.snapcache.cache.scenarios"))
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    let content = std::fs::read(on_disk.path()).unwrap();
    assert_eq!(content, bytes);
}

/// S2: a warm memory hit delivers synchronously without invoking the
/// downloader a second time.
#[tokio::test]
async fn s2_warm_memory_hit_skips_the_downloader() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    let (image, bytes) = solid_png(4, 4);
    downloader.script(
        "https://h/x.png",
        ScriptedEvent { image: Some(image), bytes: Some(bytes), error: None, finished: true },
    );
    let manager = manager_with_downloader(dir.path(), downloader.clone());

    manager.download_image(
        Some("https://h/x.png".to_string()),
        ManagerOptions::empty(),
        None,
        Box::new(|_, _, _, _, _| {}),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(downloader.requested_urls.lock().unwrap().len(), 1);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    manager.download_image(
        Some("https://h/x.png".to_string()),
        ManagerOptions::empty(),
        None,
        record(Arc::clone(&deliveries)),
    );

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (has_image, _error, source, finished, _url) = &deliveries[0];
    assert!(has_image);
    assert_eq!(*source, CacheSourceTag::Memory);
    assert!(finished);
    assert_eq!(downloader.requested_urls.lock().unwrap().len(), 1);
}

/// S3: a disk-only hit delivers once and promotes into memory.
#[tokio::test]
async fn s3_disk_only_hit_promotes_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    let config = CacheConfig::builder().namespace("scenarios").root(dir.path()).build();
    let cache = ImageCache::new(&config, IoExecutor::new(), Arc::new(SyncMainExecutor));
    let (image, _bytes) = solid_png(4, 4);
    cache.store(
        image,
        "https://h/y".to_string(),
        snapcache::image_cache::StoreOptions { recalculate: false, data: None, to_disk: true },
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cache = Arc::new(cache);
    let manager = Manager::builder(Arc::clone(&cache), downloader, Arc::new(SyncMainExecutor)).build();

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    manager.download_image(
        Some("https://h/y".to_string()),
        ManagerOptions::empty(),
        None,
        record(Arc::clone(&deliveries)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    let (has_image, _error, source, finished, _url) = &deliveries[0];
    assert!(has_image);
    assert_eq!(*source, CacheSourceTag::Disk);
    assert!(finished);
    assert!(cache.image_from_memory(&"https://h/y".to_string()).is_some());
}

/// S4: a non-transient failure blacklists the url; `RetryFailed`
/// bypasses the blacklist.
#[tokio::test]
async fn s4_failed_url_is_blacklisted_until_retry_failed() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    downloader.script(
        "https://h/z",
        ScriptedEvent { image: None, bytes: None, error: Some(DownloaderError::Http { status: 500 }), finished: true },
    );
    let manager = manager_with_downloader(dir.path(), downloader.clone());

    manager.download_image(
        Some("https://h/z".to_string()),
        ManagerOptions::empty(),
        None,
        Box::new(|_, _, _, _, _| {}),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(downloader.requested_urls.lock().unwrap().len(), 1);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    manager.download_image(
        Some("https://h/z".to_string()),
        ManagerOptions::empty(),
        None,
        record(Arc::clone(&deliveries)),
    );
    assert_eq!(downloader.requested_urls.lock().unwrap().len(), 1, "blacklisted url must not reach the downloader");
    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(!deliveries[0].0);
    assert!(
        matches!(deliveries[0].1, Some(ManagerError::Url(UrlError::Blacklisted))),
        "blacklisted rejection must surface a url-domain error, per spec S4",
    );
    drop(deliveries);

    manager.download_image(
        Some("https://h/z".to_string()),
        ManagerOptions::RETRY_FAILED,
        None,
        Box::new(|_, _, _, _, _| {}),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(downloader.requested_urls.lock().unwrap().len(), 2, "RetryFailed must bypass the blacklist");
}

/// S5: cancelling immediately after dispatch delivers no success and
/// removes the operation from the running set.
#[tokio::test]
async fn s5_cancel_between_query_and_download_suppresses_success() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    let manager = manager_with_downloader(dir.path(), downloader);

    let delivered_success = Arc::new(Mutex::new(false));
    let delivered_success_clone = Arc::clone(&delivered_success);
    let operation = manager.download_image(
        Some("https://h/a".to_string()),
        ManagerOptions::empty(),
        None,
        Box::new(move |image, _error, _source, _finished, _url| {
            if image.is_some() {
                *delivered_success_clone.lock().unwrap() = true;
            }
        }),
    );
    operation.cancel();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!*delivered_success.lock().unwrap());
    assert!(!manager.is_running());
    assert!(operation.is_cancelled());
}

/// S6: `RefreshCached` against a memory hit delivers the cached image
/// first, then the freshly downloaded one, leaving memory holding the
/// new image.
#[tokio::test]
async fn s6_refresh_cached_delivers_twice_and_updates_memory() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = Arc::new(ScriptedDownloader::new());
    let config = CacheConfig::builder().namespace("scenarios").root(dir.path()).build();
    let cache = Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(SyncMainExecutor)));
    let (old_image, _) = solid_png(4, 4);
    cache.store(
        old_image,
        "https://h/b".to_string(),
        snapcache::image_cache::StoreOptions { recalculate: false, data: None, to_disk: false },
    );

    let (new_image, new_bytes) = solid_png(6, 6);
    downloader.script(
        "https://h/b",
        ScriptedEvent { image: Some(new_image), bytes: Some(new_bytes), error: None, finished: true },
    );

    let manager = Manager::builder(Arc::clone(&cache), downloader, Arc::new(SyncMainExecutor)).build();

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    manager.download_image(
        Some("https://h/b".to_string()),
        ManagerOptions::REFRESH_CACHED,
        None,
        record(Arc::clone(&deliveries)),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 2, "refresh-with-hit must deliver exactly twice");
    assert_eq!(deliveries[0].2, CacheSourceTag::Memory);
    assert_eq!(deliveries[1].2, CacheSourceTag::None);

    let current = cache.image_from_memory(&"https://h/b".to_string()).unwrap();
    assert_eq!(current.width(), 6);
}
