//! snapcache --- an asynchronous, two-tier image cache and downloader.
//!
//! A bounded, cost-weighted memory tier (see [`memory_cache`]) sits in
//! front of an age- and size-swept disk tier (see [`disk_cache`]),
//! unified behind [`image_cache::ImageCache`]. [`manager::Manager`]
//! composes the cache with a pluggable [`downloader::Downloader`] to
//! give one cancellable entry point, `download_image`, that coalesces
//! concurrent requests for the same key and blacklists URLs that fail
//! for non-transient reasons.

pub mod codec;
pub mod config;
pub mod disk_cache;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod image_cache;
pub mod key;
pub mod manager;
pub mod memory_cache;
pub mod operation;
pub mod operation_registry;
pub mod singletons;
pub mod transform;

pub use codec::DecodedImage;
pub use config::CacheConfig;
pub use downloader::{Downloader, DownloaderOptions, ReqwestDownloader};
pub use error::{ConfigError, DiskCacheError, DownloaderError, ManagerError, TransientCause, UrlError};
pub use image_cache::{CacheSourceTag, ImageCache};
pub use key::Key;
pub use manager::{Manager, ManagerOptions};
pub use operation::{CombinedOperation, Operation};
pub use operation_registry::{OperationRegistry, Slot};
pub use singletons::{default_image_cache, default_manager};
pub use transform::TransformDelegate;
