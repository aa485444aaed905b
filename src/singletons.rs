//! Process-wide default instances (spec §9's "global default manager
//! and image cache, constructed lazily on first access").
//!
//! Mirrors the shared-instance pattern common to image-cache libraries
//! in this space: one process-wide cache/manager pair for callers that
//! don't need a dedicated namespace, built once behind a [`OnceLock`].

use std::sync::{Arc, OnceLock};

use crate::config::CacheConfig;
use crate::downloader::ReqwestDownloader;
use crate::executor::{IoExecutor, TokioMainExecutor};
use crate::image_cache::ImageCache;
use crate::manager::Manager;

static DEFAULT_IMAGE_CACHE: OnceLock<Arc<ImageCache>> = OnceLock::new();
static DEFAULT_MANAGER: OnceLock<Arc<Manager>> = OnceLock::new();

/// The process-wide default image cache, using [`CacheConfig::default`]
/// and the platform's per-user caches directory.
pub fn default_image_cache() -> Arc<ImageCache> {
    Arc::clone(DEFAULT_IMAGE_CACHE.get_or_init(|| {
        let config = CacheConfig::default();
        Arc::new(ImageCache::new(&config, IoExecutor::new(), Arc::new(TokioMainExecutor)))
    }))
}

/// The process-wide default manager, built on top of
/// [`default_image_cache`] and a [`ReqwestDownloader`].
pub fn default_manager() -> Arc<Manager> {
    Arc::clone(DEFAULT_MANAGER.get_or_init(|| {
        Manager::builder(
            default_image_cache(),
            Arc::new(ReqwestDownloader::new()),
            Arc::new(TokioMainExecutor),
        )
        .build()
    }))
}
