//! Manager (C6): combines the image cache facade (C4) and the
//! downloader (C5) behind one entry point, owning the failed-URL
//! blacklist and the table of in-flight combined operations.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::codec::DecodedImage;
use crate::downloader::{Downloader, DownloaderOptions, ProgressCallback};
use crate::error::{DownloaderError, ManagerError, UrlError};
use crate::executor::MainExecutor;
use crate::image_cache::{CacheSourceTag, ImageCache, StoreOptions};
use crate::key::{self, Key, KeyFilter};
use crate::operation::CombinedOperation;
use crate::transform::TransformDelegate;

bitflags! {
    /// Manager-level request options (spec §4.5). Each flag is
    /// independent; `DelayPlaceholder` is accepted but has no effect ---
    /// it names a view-layer concern out of scope for this crate.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ManagerOptions: u32 {
        const LOW_PRIORITY = 1 << 0;
        const PROGRESSIVE_DOWNLOAD = 1 << 1;
        const REFRESH_CACHED = 1 << 2;
        const CONTINUE_IN_BACKGROUND = 1 << 3;
        const HANDLE_COOKIES = 1 << 4;
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 5;
        const HIGH_PRIORITY = 1 << 6;
        const RETRY_FAILED = 1 << 7;
        const CACHE_MEMORY_ONLY = 1 << 8;
        const TRANSFORM_ANIMATED_IMAGE = 1 << 9;
        const AVOID_AUTO_SET_IMAGE = 1 << 10;
        const DELAY_PLACEHOLDER = 1 << 11;
    }
}

/// `(image?, error?, source, finished, url)` delivered to a
/// `download_image` caller, possibly more than once: twice for
/// `RefreshCached` against a cache hit (cached image, then the
/// re-fetched one), or repeatedly for `ProgressiveDownload` (a run of
/// `finished = false` chunks followed by a final `finished = true`).
pub type ManagerCompletion = Box<
    dyn FnMut(Option<DecodedImage>, Option<ManagerError>, CacheSourceTag, bool, String) + Send,
>;

/// `ManagerCompletion`, shared across the continuations of a single
/// `download_image` call so it can be invoked more than once without
/// ever being moved out of scope --- calling a boxed `FnMut` only needs
/// `&mut` access, so cloning this handle and locking it briefly at each
/// call site is enough to satisfy the borrow checker across the
/// cache-query and downloader continuations, which run on different
/// executors.
type SharedCompletion = Arc<Mutex<ManagerCompletion>>;

/// Locks `completion` for the duration of one delivery. Never held
/// across an `.await` or a nested call back into the manager.
fn deliver(
    completion: &SharedCompletion,
    image: Option<DecodedImage>,
    error: Option<ManagerError>,
    source: CacheSourceTag,
    finished: bool,
    url: String,
) {
    let mut completion = completion.lock().unwrap();
    (*completion)(image, error, source, finished, url);
}

/// Whether a downloader failure should blacklist its URL --- the
/// transient causes named in spec §4.5/§7 never do, since the same
/// request is expected to succeed unchanged on a later attempt.
fn should_blacklist(error: &DownloaderError) -> bool {
    !error.is_transient()
}

/// Process memory-pressure signal source (spec §4.2's "process memory
/// warning"). Injectable so tests can simulate a warning without an
/// actual OS-level low-memory condition.
pub trait MemoryPressureSource: Send + Sync {
    fn subscribe(&self, on_warning: Box<dyn Fn() + Send + Sync>);
}

/// Owns C4 and C5, the failed-URL blacklist, and the in-flight
/// operation table; exposes the single `download_image` entry point
/// plus the small existence/housekeeping surface spec §6 adds.
///
/// The entry point and its internal continuations take `self` as an
/// `Arc<Self>` so the manager's own lifetime can be captured by
/// 'static completion closures without resorting to the `Weak` cycle
/// [`CombinedOperation`] needs for its cancel hook --- the manager has
/// no back-reference from its sub-operations, only forward ownership.
pub struct Manager {
    cache: Arc<ImageCache>,
    downloader: Arc<dyn Downloader>,
    main: Arc<dyn MainExecutor>,
    transform: Option<Arc<dyn TransformDelegate>>,
    key_filter: Option<Arc<dyn KeyFilter>>,
    failed_urls: Mutex<HashSet<String>>,
    running: Mutex<Vec<CombinedOperation>>,
}

/// Builder for [`Manager`]; `build()` is the only place a `Manager` is
/// constructed, always behind an `Arc` since its async entry points
/// require `self: &Arc<Self>`.
pub struct ManagerBuilder {
    cache: Arc<ImageCache>,
    downloader: Arc<dyn Downloader>,
    main: Arc<dyn MainExecutor>,
    transform: Option<Arc<dyn TransformDelegate>>,
    key_filter: Option<Arc<dyn KeyFilter>>,
}

impl ManagerBuilder {
    pub fn transform_delegate(mut self, delegate: Arc<dyn TransformDelegate>) -> Self {
        self.transform = Some(delegate);
        self
    }

    pub fn key_filter(mut self, filter: Arc<dyn KeyFilter>) -> Self {
        self.key_filter = Some(filter);
        self
    }

    pub fn build(self) -> Arc<Manager> {
        Arc::new(Manager {
            cache: self.cache,
            downloader: self.downloader,
            main: self.main,
            transform: self.transform,
            key_filter: self.key_filter,
            failed_urls: Mutex::new(HashSet::new()),
            running: Mutex::new(Vec::new()),
        })
    }
}

impl Manager {
    pub fn builder(
        cache: Arc<ImageCache>,
        downloader: Arc<dyn Downloader>,
        main: Arc<dyn MainExecutor>,
    ) -> ManagerBuilder {
        ManagerBuilder { cache, downloader, main, transform: None, key_filter: None }
    }

    /// Entry point (spec §4.5). `completion` must be present; there is
    /// no overload that omits it. Returns the combined operation so
    /// callers can cancel it directly or bind it into a
    /// [`crate::operation_registry::OperationRegistry`].
    pub fn download_image(
        self: &Arc<Self>,
        url: Option<String>,
        options: ManagerOptions,
        progress: Option<ProgressCallback>,
        completion: ManagerCompletion,
    ) -> CombinedOperation {
        let url = url.filter(|u| !u.is_empty());

        let Some(url) = url else {
            return self.reject_immediately(completion, String::new(), UrlError::Empty);
        };

        if self.is_blacklisted(&url) && !options.contains(ManagerOptions::RETRY_FAILED) {
            return self.reject_immediately(completion, url, UrlError::Blacklisted);
        }

        let combined = CombinedOperation::new();
        self.running.lock().unwrap().push(combined.clone());

        let completion: SharedCompletion = Arc::new(Mutex::new(completion));
        let manager = Arc::clone(self);
        let key = key::key_for_url(&url, self.key_filter.as_deref());
        let combined_for_query = combined.clone();
        let url_for_query = url.clone();
        let key_for_query = key.clone();

        let cache_operation = self.cache.query(Some(key), move |image, source| {
            manager.on_query_result(
                image,
                source,
                combined_for_query,
                url_for_query,
                key_for_query,
                options,
                progress,
                completion,
            );
        });

        if let Some(cache_operation) = cache_operation {
            combined.set_cache_operation(cache_operation);
        }

        let manager = Arc::clone(self);
        let combined_for_hook = combined.clone();
        combined.set_cancel_hook(move || {
            manager.remove_running(&combined_for_hook);
        });

        combined
    }

    /// Delivers the spec §7 "file does not exist" URL-domain error
    /// without ever touching the cache or the downloader (empty URL, or
    /// a blacklisted URL requested without `RetryFailed`).
    fn reject_immediately(
        self: &Arc<Self>,
        mut completion: ManagerCompletion,
        url: String,
        error: UrlError,
    ) -> CombinedOperation {
        let main = Arc::clone(&self.main);
        main.spawn(Box::pin(async move {
            completion(None, Some(ManagerError::Url(error)), CacheSourceTag::None, true, url);
        }));
        CombinedOperation::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn on_query_result(
        self: Arc<Self>,
        image: Option<DecodedImage>,
        source: CacheSourceTag,
        combined: CombinedOperation,
        url: String,
        key: Key,
        options: ManagerOptions,
        progress: Option<ProgressCallback>,
        completion: SharedCompletion,
    ) {
        if combined.is_cancelled() {
            self.remove_running(&combined);
            return;
        }

        let refreshing = image.is_some() && options.contains(ManagerOptions::REFRESH_CACHED);

        if let Some(image) = image {
            deliver(&completion, Some(image), None, source, !refreshing, url.clone());
            if !refreshing {
                self.remove_running(&combined);
                return;
            }
            self.start_download(true, combined, url, key, options, progress, completion);
            return;
        }

        let should_download = self
            .transform
            .as_deref()
            .map(|delegate| delegate.should_download_for(&url))
            .unwrap_or(true);

        if !should_download {
            deliver(&completion, None, None, CacheSourceTag::None, true, url);
            self.remove_running(&combined);
            return;
        }

        self.start_download(false, combined, url, key, options, progress, completion);
    }

    #[allow(clippy::too_many_arguments)]
    fn start_download(
        self: Arc<Self>,
        had_hit: bool,
        combined: CombinedOperation,
        url: String,
        key: Key,
        options: ManagerOptions,
        progress: Option<ProgressCallback>,
        completion: SharedCompletion,
    ) {
        let mut downloader_options = downloader_options_for(options);
        if had_hit {
            downloader_options.remove(DownloaderOptions::PROGRESSIVE);
            downloader_options.insert(DownloaderOptions::IGNORE_CACHED_RESPONSE);
        }

        let manager = Arc::clone(&self);
        let combined_for_completion = combined.clone();
        let url_for_completion = url.clone();

        // `DownloaderOptions::PROGRESSIVE` may drive this callback more
        // than once, so every captured value it forwards is cloned
        // per-call rather than moved, leaving the closure itself
        // callable as `FnMut`.
        let download_operation = self.downloader.download(
            url,
            downloader_options,
            progress,
            Box::new(move |downloaded_image, data, error, finished| {
                Arc::clone(&manager).on_download_result(
                    downloaded_image,
                    data,
                    error,
                    finished,
                    combined_for_completion.clone(),
                    url_for_completion.clone(),
                    key.clone(),
                    options,
                    had_hit,
                    Arc::clone(&completion),
                );
            }),
        );

        combined.set_cache_operation(download_operation);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_download_result(
        self: Arc<Self>,
        downloaded_image: Option<DecodedImage>,
        data: Option<crate::codec::ImageBytes>,
        error: Option<DownloaderError>,
        finished: bool,
        combined: CombinedOperation,
        url: String,
        key: Key,
        options: ManagerOptions,
        had_hit: bool,
        completion: SharedCompletion,
    ) {
        if combined.is_cancelled() {
            return;
        }

        if let Some(error) = error {
            let blacklist = should_blacklist(&error);
            deliver(
                &completion,
                None,
                Some(ManagerError::Downloader(error)),
                CacheSourceTag::None,
                finished,
                url.clone(),
            );
            if blacklist {
                warn!(%url, "download_image: blacklisting url after non-transient error");
                self.blacklist(url);
            }
            if finished {
                self.remove_running(&combined);
            }
            return;
        }

        if options.contains(ManagerOptions::RETRY_FAILED) {
            self.unblacklist(&url);
        }

        let to_disk = !options.contains(ManagerOptions::CACHE_MEMORY_ONLY);
        let suppress = had_hit
            && options.contains(ManagerOptions::REFRESH_CACHED)
            && downloaded_image.is_none();

        if suppress {
            debug!(%url, "download_image: http cache hit, suppressing refresh completion");
            if finished {
                self.remove_running(&combined);
            }
            return;
        }

        let Some(downloaded_image) = downloaded_image else {
            deliver(&completion, None, None, CacheSourceTag::None, finished, url);
            if finished {
                self.remove_running(&combined);
            }
            return;
        };

        let animated_ok =
            !downloaded_image.is_animated() || options.contains(ManagerOptions::TRANSFORM_ANIMATED_IMAGE);

        if animated_ok {
            if let Some(transform) = self.transform.clone() {
                let manager = Arc::clone(&self);
                let main = Arc::clone(&self.main);
                let cache = Arc::clone(&self.cache);
                let key_for_store = key.clone();
                let url_for_store = url.clone();
                let original = downloaded_image.clone();
                let completion_for_store = Arc::clone(&completion);

                tokio::task::spawn_blocking(move || {
                    let transformed = transform.transform_downloaded(downloaded_image, &url_for_store);
                    let recalculate = !transformed.same_as(&original);
                    let store_data = if recalculate { None } else { data.as_deref() };
                    cache.store(
                        transformed.clone(),
                        key_for_store,
                        StoreOptions { recalculate, data: store_data, to_disk },
                    );
                    main.spawn(Box::pin(async move {
                        deliver(
                            &completion_for_store,
                            Some(transformed),
                            None,
                            CacheSourceTag::None,
                            finished,
                            url_for_store,
                        );
                        if finished {
                            manager.remove_running(&combined);
                        }
                    }));
                });
                return;
            }

            if finished {
                self.cache.store(
                    downloaded_image.clone(),
                    key,
                    StoreOptions { recalculate: false, data: data.as_deref(), to_disk },
                );
            }
        }

        deliver(&completion, Some(downloaded_image), None, CacheSourceTag::None, finished, url);
        if finished {
            self.remove_running(&combined);
        }
    }

    fn is_blacklisted(&self, url: &str) -> bool {
        self.failed_urls.lock().unwrap().contains(url)
    }

    fn blacklist(&self, url: String) {
        self.failed_urls.lock().unwrap().insert(url);
    }

    fn unblacklist(&self, url: &str) {
        self.failed_urls.lock().unwrap().remove(url);
    }

    fn remove_running(&self, combined: &CombinedOperation) {
        self.running.lock().unwrap().retain(|op| !op.is_same_as(combined));
    }

    /// Cancels every in-flight operation, under a snapshot taken under
    /// the lock (spec §5: "iteration in cancel_all uses a snapshot
    /// taken under the lock").
    pub fn cancel_all(&self) {
        let snapshot: Vec<CombinedOperation> = self.running.lock().unwrap().clone();
        for operation in snapshot {
            operation.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        !self.running.lock().unwrap().is_empty()
    }

    /// Synchronous existence probe against the memory tier and disk
    /// tier (spec §6 "Public manager surface beyond download_image").
    pub fn cached_image_exists(&self, url: &str) -> bool {
        let key = key::key_for_url(url, self.key_filter.as_deref());
        self.cache.exists_sync(&key)
    }

    /// Async disk-tier-only existence probe, delivered on the main
    /// executor.
    pub fn disk_image_exists(&self, url: &str, completion: impl FnOnce(bool) + Send + 'static) {
        let key = key::key_for_url(url, self.key_filter.as_deref());
        self.cache.disk_exists(key, completion);
    }

    /// Stores an already-decoded image directly into the cache under
    /// `url`'s derived key, bypassing the download path entirely.
    pub fn save_image_to_cache(&self, image: DecodedImage, url: &str) {
        let key = key::key_for_url(url, self.key_filter.as_deref());
        self.cache.store(image, key, StoreOptions { recalculate: true, data: None, to_disk: true });
    }
}

fn downloader_options_for(options: ManagerOptions) -> DownloaderOptions {
    let mut mapped = DownloaderOptions::empty();
    if options.contains(ManagerOptions::LOW_PRIORITY) {
        mapped.insert(DownloaderOptions::LOW_PRIORITY);
    }
    if options.contains(ManagerOptions::HIGH_PRIORITY) {
        mapped.insert(DownloaderOptions::HIGH_PRIORITY);
    }
    if options.contains(ManagerOptions::PROGRESSIVE_DOWNLOAD) {
        mapped.insert(DownloaderOptions::PROGRESSIVE);
    }
    if options.contains(ManagerOptions::CONTINUE_IN_BACKGROUND) {
        mapped.insert(DownloaderOptions::CONTINUE_IN_BACKGROUND);
    }
    if options.contains(ManagerOptions::HANDLE_COOKIES) {
        mapped.insert(DownloaderOptions::HANDLE_COOKIES);
    }
    if options.contains(ManagerOptions::ALLOW_INVALID_SSL_CERTIFICATES) {
        mapped.insert(DownloaderOptions::ALLOW_INVALID_CERTIFICATES);
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::downloader::test_double::{ScriptedDownloader, ScriptedEvent};
    use crate::executor::{IoExecutor, SyncMainExecutor};
    use crate::transform::test_double::InvertingDelegate;
    use image::{DynamicImage, RgbaImage};
    use std::sync::Mutex as StdMutex;

    fn solid_image(width: u32, height: u32) -> DecodedImage {
        let buffer = RgbaImage::from_pixel(width, height, image::Rgba([9, 9, 9, 255]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(buffer)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        crate::codec::decode_image(&bytes, "https://h/x.png").unwrap()
    }

    fn manager(dir: &std::path::Path, downloader: Arc<ScriptedDownloader>) -> Arc<Manager> {
        let config = CacheConfig::builder().root(dir).build();
        let cache = Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(SyncMainExecutor)));
        Manager::builder(cache, downloader, Arc::new(SyncMainExecutor)).build()
    }

    #[tokio::test]
    async fn empty_url_delivers_immediately_with_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), Arc::new(ScriptedDownloader::new()));
        let result = Arc::new(StdMutex::new(None));
        let result_clone = Arc::clone(&result);
        manager.download_image(
            Some(String::new()),
            ManagerOptions::empty(),
            None,
            Box::new(move |image, error, source, finished, url| {
                *result_clone.lock().unwrap() = Some((image.is_some(), error, source, finished, url));
            }),
        );
        let (has_image, error, source, finished, url) = result.lock().unwrap().take().unwrap();
        assert!(!has_image);
        assert!(matches!(error, Some(ManagerError::Url(UrlError::Empty))));
        assert_eq!(source, CacheSourceTag::None);
        assert!(finished);
        assert_eq!(url, "");
    }

    #[tokio::test]
    async fn successful_download_is_stored_and_delivered() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(ScriptedDownloader::new());
        let image = solid_image(4, 4);
        let bytes = crate::codec::encode_png(&image).unwrap();
        downloader.script(
            "https://h/a.png",
            ScriptedEvent { image: Some(image), bytes: Some(bytes), error: None, finished: true },
        );
        let manager = manager(dir.path(), downloader);

        let result = Arc::new(StdMutex::new(None));
        let result_clone = Arc::clone(&result);
        manager.download_image(
            Some("https://h/a.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(move |image, _error, _source, finished, _url| {
                *result_clone.lock().unwrap() = Some((image.is_some(), finished));
            }),
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let (has_image, finished) = result.lock().unwrap().take().unwrap();
        assert!(has_image);
        assert!(finished);
        assert!(manager.cached_image_exists("https://h/a.png"));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn non_transient_error_blacklists_the_url() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(ScriptedDownloader::new());
        downloader.script(
            "https://h/missing.png",
            ScriptedEvent { image: None, bytes: None, error: Some(DownloaderError::Http { status: 404 }), finished: true },
        );
        let manager = manager(dir.path(), downloader);

        manager.download_image(
            Some("https://h/missing.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(|_, _, _, _, _| {}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let blocked = Arc::new(StdMutex::new(None));
        let blocked_clone = Arc::clone(&blocked);
        manager.download_image(
            Some("https://h/missing.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(move |_image, error, _source, _finished, _url| {
                *blocked_clone.lock().unwrap() =
                    Some(matches!(error, Some(ManagerError::Url(UrlError::Blacklisted))));
            }),
        );
        assert_eq!(blocked.lock().unwrap().take(), Some(true));
    }

    #[tokio::test]
    async fn retry_failed_bypasses_the_blacklist() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(ScriptedDownloader::new());
        downloader.script(
            "https://h/gone.png",
            ScriptedEvent { image: None, bytes: None, error: Some(DownloaderError::Http { status: 500 }), finished: true },
        );
        let manager = manager(dir.path(), downloader.clone());
        manager.download_image(
            Some("https://h/gone.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(|_, _, _, _, _| {}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        manager.download_image(
            Some("https://h/gone.png".to_string()),
            ManagerOptions::RETRY_FAILED,
            None,
            Box::new(|_, _, _, _, _| {}),
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(downloader.requested_urls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn transform_delegate_runs_and_result_differs_from_original() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(ScriptedDownloader::new());
        let image = solid_image(3, 3);
        let bytes = crate::codec::encode_png(&image).unwrap();
        downloader.script(
            "https://h/t.png",
            ScriptedEvent { image: Some(image), bytes: Some(bytes), error: None, finished: true },
        );
        let config = CacheConfig::builder().root(dir.path()).build();
        let cache = Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(SyncMainExecutor)));
        let manager = Manager::builder(cache, downloader, Arc::new(SyncMainExecutor))
            .transform_delegate(Arc::new(InvertingDelegate { allow_downloads: true }))
            .build();

        let result = Arc::new(StdMutex::new(None));
        let result_clone = Arc::clone(&result);
        manager.download_image(
            Some("https://h/t.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(move |image, _error, _source, _finished, _url| {
                *result_clone.lock().unwrap() = image;
            }),
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(result.lock().unwrap().take().is_some());
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_running_operation() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Arc::new(ScriptedDownloader::new());
        let manager = manager(dir.path(), downloader);
        let op = manager.download_image(
            Some("https://h/slow.png".to_string()),
            ManagerOptions::empty(),
            None,
            Box::new(|_, _, _, _, _| {}),
        );
        manager.cancel_all();
        assert!(op.is_cancelled());
    }
}
