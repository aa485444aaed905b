//! Configuration knobs for the cache (C0, see `SPEC_FULL.md` §2).
//!
//! Defaults mirror spec.md §6 exactly. Loaded from an optional TOML file
//! with [`CacheConfig::load`], or built in-process with
//! [`CacheConfig::builder`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const APP_BUNDLE_PREFIX: &str = "com.snapcache.cache";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_MAX_CACHE_AGE_SECS: u64 = 7 * 24 * 60 * 60;

/// Namespaced, filesystem- and memory-bound cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Label appended to [`APP_BUNDLE_PREFIX`] to form the namespace
    /// directory name under the caches root.
    pub namespace: String,

    /// Root directory under which `<APP_BUNDLE_PREFIX>.<namespace>` is
    /// created. Defaults to the platform's per-user caches directory.
    pub root: Option<PathBuf>,

    /// Additional read-only roots consulted, in order, after `root` on a
    /// miss. Never written to.
    pub auxiliary_disk_roots: Vec<PathBuf>,

    /// Files older than this are removed by the sweeper's age pass.
    #[serde(with = "duration_secs")]
    pub max_cache_age: Duration,

    /// Total on-disk budget, in bytes. `0` means unlimited; the
    /// sweeper's size pass only runs when this is non-zero.
    pub max_cache_size: u64,

    /// Whether disk reads apply the display-decompression step before
    /// decoding completes.
    pub should_decompress_images: bool,

    /// Whether the memory tier (C2) is consulted/populated at all.
    pub should_cache_images_in_memory: bool,

    /// Whether written files get an "exclude from backup" attribute.
    /// Best-effort and a no-op on platforms without the concept.
    pub should_disable_icloud: bool,

    /// Memory tier cost ceiling (`0` = unlimited). See `CacheCost`.
    pub max_memory_cost: u64,

    /// Memory tier entry-count ceiling (`0` = unlimited).
    pub max_memory_count_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            root: None,
            auxiliary_disk_roots: Vec::new(),
            max_cache_age: Duration::from_secs(DEFAULT_MAX_CACHE_AGE_SECS),
            max_cache_size: 0,
            should_decompress_images: true,
            should_cache_images_in_memory: true,
            should_disable_icloud: true,
            max_memory_cost: 0,
            max_memory_count_limit: 0,
        }
    }
}

impl CacheConfig {
    /// Starts a builder seeded with defaults.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder { inner: Self::default() }
    }

    /// Loads configuration from a TOML file, falling back to defaults
    /// for any field the file omits (`#[serde(default)]` per-field).
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Resolved namespace directory name, e.g. `com.snapcache.cache.default`.
    pub fn namespace_dir_name(&self) -> String {
        format!("{APP_BUNDLE_PREFIX}.{}", self.namespace)
    }

    /// Resolved caches root: the configured root, or the platform
    /// per-user caches directory.
    pub fn resolved_root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::cache_dir().unwrap_or_else(std::env::temp_dir)
        })
    }

    /// Full namespace directory path: `<root>/<namespace_dir_name>`.
    pub fn namespace_path(&self) -> PathBuf {
        self.resolved_root().join(self.namespace_dir_name())
    }
}

/// Builder for [`CacheConfig`]; every setter takes `self` by value so
/// calls chain.
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    inner: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.inner.namespace = namespace.into();
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.inner.root = Some(root.into());
        self
    }

    pub fn auxiliary_disk_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.inner.auxiliary_disk_roots = roots;
        self
    }

    pub fn max_cache_age(mut self, age: Duration) -> Self {
        self.inner.max_cache_age = age;
        self
    }

    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.inner.max_cache_size = bytes;
        self
    }

    pub fn should_cache_images_in_memory(mut self, enabled: bool) -> Self {
        self.inner.should_cache_images_in_memory = enabled;
        self
    }

    pub fn max_memory_cost(mut self, cost: u64) -> Self {
        self.inner.max_memory_cost = cost;
        self
    }

    pub fn max_memory_count_limit(mut self, count: u64) -> Self {
        self.inner.max_memory_count_limit = count;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.inner
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}
