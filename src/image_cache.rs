//! Image cache facade (C4): unifies the memory tier (C2) and disk tier
//! (C3) behind `store`/`query`/`remove`, promoting disk hits to memory.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::codec::{self, DecodedImage};
use crate::config::CacheConfig;
use crate::disk_cache::DiskCache;
use crate::executor::{IoExecutor, MainExecutor};
use crate::key::Key;
use crate::memory_cache::MemoryCache;
use crate::operation::Operation;

/// Where a delivered image came from, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSourceTag {
    None,
    Memory,
    Disk,
}

/// Options accepted by [`ImageCache::store`].
#[derive(Debug, Clone, Default)]
pub struct StoreOptions<'a> {
    /// Forces re-derivation of persisted bytes even when `data` is set.
    pub recalculate: bool,
    /// Caller-supplied encoded bytes, used verbatim unless sniffing or
    /// `recalculate` says otherwise (spec §4.4).
    pub data: Option<&'a [u8]>,
    /// Whether to additionally schedule a disk-tier write.
    pub to_disk: bool,
}

/// Options accepted by [`ImageCache::remove`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    pub from_disk: bool,
}

/// Unifies C2 and C3 behind one facade.
pub struct ImageCache {
    memory: Option<MemoryCache>,
    disk: DiskCache,
    io: IoExecutor,
    main: Arc<dyn MainExecutor>,
    should_decompress: bool,
}

impl ImageCache {
    pub fn new(config: &CacheConfig, io: IoExecutor, main: Arc<dyn MainExecutor>) -> Self {
        let memory = config.should_cache_images_in_memory.then(|| {
            MemoryCache::new(config.max_memory_cost, config.max_memory_count_limit)
        });
        let disk = DiskCache::new(
            config.namespace_path(),
            config.auxiliary_disk_roots.clone(),
            config.max_cache_age,
            config.max_cache_size,
        );
        Self { memory, disk, io, main, should_decompress: config.should_decompress_images }
    }

    pub fn disk(&self) -> &DiskCache {
        &self.disk
    }

    pub fn image_from_memory(&self, key: &Key) -> Option<DecodedImage> {
        self.memory.as_ref().and_then(|memory| memory.get(key))
    }

    /// Reads the disk tier synchronously and promotes a hit into memory.
    /// Intended for call sites already running on the IO executor.
    pub fn image_from_disk(&self, key: &Key) -> Option<DecodedImage> {
        let bytes = self.disk.read(key)?;
        let image = codec::decode_image(&bytes, key).ok()?;
        let image = codec::decompress_for_display(image, self.should_decompress);
        if let Some(memory) = &self.memory {
            memory.put(key.clone(), image.clone());
        }
        Some(image)
    }

    /// Stores `image`. Inserts into the memory tier synchronously (when
    /// enabled); when `options.to_disk`, schedules a write on the IO
    /// executor using the bytes-selection rule in spec §4.4.
    pub fn store(&self, image: DecodedImage, key: Key, options: StoreOptions<'_>) {
        if let Some(memory) = &self.memory {
            memory.put(key.clone(), image.clone());
        }

        if !options.to_disk {
            return;
        }

        let disk = self.disk.clone();
        let data = options.data.map(|d| d.to_vec());
        let recalculate = options.recalculate;
        self.io.submit(move || match codec::bytes_to_persist(&image, data.as_deref(), recalculate)
        {
            Ok(bytes) => {
                if let Err(err) = disk.write(&key, &bytes, true) {
                    tracing::warn!(%err, "store: disk write failed");
                }
            }
            Err(err) => tracing::warn!(%err, "store: bytes derivation failed"),
        });
    }

    /// Looks up `key`. On a memory hit, delivers synchronously and
    /// returns no operation. On a miss, returns a cancellable operation
    /// whose IO-executor job reads and decodes the disk tier, promoting
    /// hits into memory, and delivers on the main executor.
    pub fn query(
        &self,
        key: Option<Key>,
        done: impl FnOnce(Option<DecodedImage>, CacheSourceTag) + Send + 'static,
    ) -> Option<Operation> {
        let Some(key) = key else {
            done(None, CacheSourceTag::None);
            return None;
        };

        if let Some(image) = self.image_from_memory(&key) {
            debug!(%key, "image cache: memory hit");
            done(Some(image), CacheSourceTag::Memory);
            return None;
        }

        let operation = Operation::new();
        let flag = operation.flag();
        let disk = self.disk.clone();
        let memory = self.memory.clone();
        let should_decompress = self.should_decompress;
        let main = Arc::clone(&self.main);

        self.io.submit(move || {
            if flag.is_cancelled() {
                return;
            }

            let image = disk.read(&key).and_then(|bytes| codec::decode_image(&bytes, &key).ok());
            let image = image.map(|img| codec::decompress_for_display(img, should_decompress));

            if let (Some(memory), Some(image)) = (&memory, &image) {
                memory.put(key.clone(), image.clone());
            }

            if flag.is_cancelled() {
                return;
            }

            let source = if image.is_some() { CacheSourceTag::Disk } else { CacheSourceTag::None };
            main.spawn(Box::pin(async move {
                if !flag.is_cancelled() {
                    done(image, source);
                }
            }));
        });

        Some(operation)
    }

    /// Removes `key` from the memory tier (if enabled) and, when
    /// `options.from_disk`, schedules a disk removal, delivering
    /// `completion` on the main executor afterward. Without
    /// `from_disk`, `completion` fires immediately.
    pub fn remove(
        &self,
        key: Key,
        options: RemoveOptions,
        completion: impl FnOnce() + Send + 'static,
    ) {
        if let Some(memory) = &self.memory {
            memory.remove(&key);
        }

        if !options.from_disk {
            completion();
            return;
        }

        let disk = self.disk.clone();
        let main = Arc::clone(&self.main);
        self.io.submit(move || {
            disk.remove(&key);
            main.spawn(Box::pin(async move { completion() }));
        });
    }

    /// Async, main-executor-delivered existence probe (spec §4.3).
    pub fn disk_exists(&self, key: Key, completion: impl FnOnce(bool) + Send + 'static) {
        let disk = self.disk.clone();
        let main = Arc::clone(&self.main);
        self.io.submit(move || {
            let exists = disk.exists(&key);
            main.spawn(Box::pin(async move { completion(exists) }));
        });
    }

    /// Synchronous existence probe; may touch disk (spec §4.3: "fast,
    /// may be called off the IO executor").
    pub fn exists_sync(&self, key: &Key) -> bool {
        self.image_from_memory(key).is_some() || self.disk.exists(key)
    }

    /// Runs a full sweep on the IO executor, delivering completion on
    /// the main executor.
    pub fn sweep(&self, completion: impl FnOnce(crate::disk_cache::SweepReport) + Send + 'static) {
        let disk = self.disk.clone();
        let main = Arc::clone(&self.main);
        self.io.submit(move || {
            let report = disk.sweep();
            main.spawn(Box::pin(async move { completion(report) }));
        });
    }

    /// Flushes the memory tier; called on a process memory-pressure
    /// signal (spec §4.2).
    pub fn handle_memory_warning(&self) {
        if let Some(memory) = &self.memory {
            memory.remove_all();
        }
    }
}
