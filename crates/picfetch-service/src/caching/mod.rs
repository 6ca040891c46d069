//! # Picfetch Caching infrastructure
//!
//! Images are expensive to download and to decode, and scrolling views request the same images
//! over and over again. This module contains the two cache tiers that avoid both, and the
//! [`ImageCache`] that composes them into a single lookup / store / evict surface.
//!
//! ## Cache Tiers
//!
//! - The [`MemoryStore`] maps a [`CacheKey`] to a decoded image. It is the hottest read path,
//!   unbounded by default, and dropped wholesale by [`ImageCache::clear_memory`] when the host
//!   signals memory pressure.
//! - The [`DiskStore`] is a flat directory of encoded image files, named by the MD5 hash of the
//!   key. It is authoritative for persistence, and lives in a platform cache directory which
//!   the host may wipe at any time.
//!
//! A lookup goes through the following steps:
//! - First, it goes through the in-memory tier.
//! - On miss, it reads the file from disk, decodes it and promotes it to the in-memory tier.
//! - On miss, the caller (usually the [`RequestManager`](crate::manager::RequestManager))
//!   downloads the image and [stores](ImageCache::store) it in both tiers.
//!
//! ## Background Queues
//!
//! File system access happens on two serial background queues, each one a dedicated thread:
//!
//! - `cache-in` runs disk writes, removals, [`clear_disk`](ImageCache::clear_disk) and
//!   [`sweep`](ImageCache::sweep).
//! - `cache-out` runs the disk reads of asynchronous lookups.
//!
//! Within one queue jobs run in FIFO order. Across queues there is no ordering guarantee: a
//! [`store`](ImageCache::store) is visible in memory immediately, but on disk only eventually.
//! [`ImageCache::flush`] waits for both queues to drain.
//!
//! The synchronous methods [`has_key`](ImageCache::has_key),
//! [`image_from_key`](ImageCache::image_from_key) with `from_disk` and
//! [`size`](ImageCache::size) touch the file system on the calling thread.
//!
//! ## Errors
//!
//! Disk I/O failures are never surfaced. They are logged, and the cache degrades to memory-only
//! behavior: a failed read is a miss, a failed write leaves the image in memory only.
//!
//! ### Metrics
//!
//! - `caches.access`: All lookups.
//! - `caches.memory.hit`: Lookups served by the in-memory tier.
//! - `caches.file.hit` / `caches.file.miss`: Lookups that went to disk.
//! - `caches.file.write`: Files written to disk, and `caches.file.size` their size in bytes.

use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{self, BoxFuture};

use crate::codec::{DecodedImage, ImageCodec};
use crate::config::{CacheConfig, Config};

mod cache_key;
mod cleanup;
mod disk;
mod memory;
mod queue;

pub use cache_key::CacheKey;
pub use cleanup::SweepStats;
pub use disk::DiskStore;
pub use memory::MemoryStore;

use queue::SerialQueue;

/// Receives the result of an [`ImageCache::query_disk_async`] call.
///
/// Exactly one of the two methods is called per query, on the thread that issued it.
pub trait CacheDelegate<I> {
    fn did_find(&self, image: DecodedImage, key: &CacheKey, info: I);

    fn did_not_find(&self, key: &CacheKey, info: I);
}

/// The two-tier image cache.
///
/// Cloning is cheap, all clones share the same tiers and queues.
#[derive(Clone)]
pub struct ImageCache {
    memory: MemoryStore,
    disk: Arc<DiskStore>,
    codec: Arc<dyn ImageCodec>,
    /// Disk writes and removals.
    cache_in: SerialQueue,
    /// Disk reads for asynchronous queries.
    cache_out: SerialQueue,
    max_age: Duration,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("memory", &self.memory)
            .field("disk", &self.disk)
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl ImageCache {
    /// Creates a cache storing its files in `images_dir`, which is created if it does not exist.
    pub fn new(
        images_dir: impl Into<PathBuf>,
        config: CacheConfig,
        codec: Arc<dyn ImageCodec>,
    ) -> io::Result<Self> {
        Ok(Self {
            memory: MemoryStore::new(config.memory_capacity),
            disk: Arc::new(DiskStore::new(images_dir)?),
            codec,
            cache_in: SerialQueue::new("picfetch-cache-in")?,
            cache_out: SerialQueue::new("picfetch-cache-out")?,
            max_age: config.max_age,
        })
    }

    pub fn from_config(config: &Config, codec: Arc<dyn ImageCodec>) -> io::Result<Self> {
        Self::new(config.images_dir(), config.caches, codec)
    }

    pub fn codec(&self) -> &Arc<dyn ImageCodec> {
        &self.codec
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// Stores `image` under `key`.
    ///
    /// The image is inserted into the in-memory tier immediately. With `to_disk`, a disk write
    /// is enqueued: of `data` if given, otherwise of the image re-encoded by the codec.
    pub fn store(&self, image: DecodedImage, data: Option<Bytes>, key: &CacheKey, to_disk: bool) {
        tracing::trace!(%key, to_disk, "Storing image");
        self.memory.put(key.clone(), image.clone());

        if !to_disk {
            return;
        }

        let disk = Arc::clone(&self.disk);
        let codec = Arc::clone(&self.codec);
        let key = key.clone();
        self.cache_in.dispatch(move || {
            let data = match data {
                Some(data) => data,
                None => match codec.encode(&image) {
                    Ok(data) => Bytes::from(data),
                    Err(e) => {
                        tracing::error!(
                            error = &e as &dyn std::error::Error,
                            %key,
                            "Failed to encode image for disk",
                        );
                        return;
                    }
                },
            };

            match disk.write(&key, &data) {
                Ok(()) => {
                    metric!(counter("caches.file.write") += 1);
                    metric!(time_raw("caches.file.size") = data.len() as u64);
                }
                Err(e) => {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %disk.file_path(&key).display(),
                        "Failed to write cache file",
                    );
                }
            }
        });
    }

    /// Stores `image` in both tiers, re-encoding it for disk.
    pub fn store_image(&self, image: DecodedImage, key: &CacheKey) {
        self.store(image, None, key, true)
    }

    /// Whether `key` is in memory, or its file exists on disk.
    ///
    /// The disk check is synchronous, and the answer only advisory: the file may be swept or
    /// written concurrently.
    pub fn has_key(&self, key: &CacheKey) -> bool {
        self.memory.contains(key) || self.disk.contains(key)
    }

    /// Looks `key` up synchronously.
    ///
    /// Returns an in-memory hit right away. On a miss with `from_disk`, the file is read and
    /// decoded **on the calling thread**, and promoted to memory. Do not call this with
    /// `from_disk` from a thread that has to stay responsive.
    pub fn image_from_key(&self, key: &CacheKey, from_disk: bool) -> Option<DecodedImage> {
        metric!(counter("caches.access") += 1);
        if let Some(image) = self.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1);
            return Some(image);
        }
        if !from_disk {
            return None;
        }

        let image = load_from_disk(&self.disk, &*self.codec, key)?;
        Some(self.memory.put_if_absent(key.clone(), image))
    }

    /// Looks `key` up, reading from disk on the `cache-out` queue if it is not in memory.
    ///
    /// The returned future resolves exactly once, to the image or to `None`. A disk hit is
    /// promoted to memory before the future resolves, unless the key was stored in the
    /// meantime. The newer in-memory image wins and is returned instead.
    pub fn query_disk(&self, key: &CacheKey) -> BoxFuture<'static, Option<DecodedImage>> {
        metric!(counter("caches.access") += 1);
        if let Some(image) = self.memory.get(key) {
            metric!(counter("caches.memory.hit") += 1);
            return future::ready(Some(image)).boxed();
        }

        let read = {
            let disk = Arc::clone(&self.disk);
            let codec = Arc::clone(&self.codec);
            let key = key.clone();
            self.cache_out.run(move || load_from_disk(&disk, &*codec, &key))
        };

        let memory = self.memory.clone();
        let key = key.clone();
        async move {
            let image = read.await.ok().flatten()?;
            Some(memory.put_if_absent(key, image))
        }
        .boxed()
    }

    /// Looks `key` up asynchronously and hands the result to `callback`.
    ///
    /// The callback always runs on a later turn of the current thread, never before this
    /// method returns, even for in-memory hits.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a [`tokio::task::LocalSet`].
    pub fn query_disk_with<I, F>(&self, key: &CacheKey, info: I, callback: F)
    where
        I: 'static,
        F: FnOnce(Option<DecodedImage>, CacheKey, I) + 'static,
    {
        let query = self.query_disk(key);
        let key = key.clone();
        tokio::task::spawn_local(async move {
            let image = query.await;
            callback(image, key, info);
        });
    }

    /// Looks `key` up asynchronously and reports the result to `delegate`.
    ///
    /// See [`query_disk_with`](Self::query_disk_with) for the delivery guarantees.
    pub fn query_disk_async<I: 'static>(
        &self,
        key: &CacheKey,
        info: I,
        delegate: Rc<dyn CacheDelegate<I>>,
    ) {
        self.query_disk_with(key, info, move |image, key, info| match image {
            Some(image) => delegate.did_find(image, &key, info),
            None => delegate.did_not_find(&key, info),
        })
    }

    /// Removes `key` from memory, and enqueues the removal of its file with `from_disk`.
    pub fn remove(&self, key: &CacheKey, from_disk: bool) {
        self.memory.remove(key);
        if !from_disk {
            return;
        }

        let disk = Arc::clone(&self.disk);
        let key = key.clone();
        self.cache_in.dispatch(move || {
            if let Err(e) = disk.remove(&key) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %disk.file_path(&key).display(),
                    "Failed to remove cache file",
                );
            }
        });
    }

    /// Removes `key` from both tiers.
    pub fn remove_image(&self, key: &CacheKey) {
        self.remove(key, true)
    }

    /// Drops the whole in-memory tier.
    ///
    /// This is the entry point for the host's memory pressure notifications.
    pub fn clear_memory(&self) {
        tracing::debug!("Purging in-memory images");
        self.memory.purge();
    }

    /// Enqueues the removal of all files on disk.
    pub fn clear_disk(&self) {
        let disk = Arc::clone(&self.disk);
        self.cache_in.dispatch(move || {
            if let Err(e) = disk.clear() {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %disk.path().display(),
                    "Failed to clear image directory",
                );
            }
        });
    }

    /// Enqueues the removal of all files older than the configured `max_age`.
    pub fn sweep(&self) {
        let disk = Arc::clone(&self.disk);
        let max_age = self.max_age;
        self.cache_in.dispatch(move || {
            if let Err(e) = disk.sweep(max_age) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %disk.path().display(),
                    "Failed to sweep image directory",
                );
            }
        });
    }

    /// The total size in bytes of all files on disk, computed on the calling thread.
    pub fn size(&self) -> u64 {
        self.disk.total_size().unwrap_or_else(|e| {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to compute image directory size",
            );
            0
        })
    }

    /// The approximate number of images in memory.
    pub fn memory_entry_count(&self) -> u64 {
        self.memory.entry_count()
    }

    /// Resolves once all jobs enqueued on both background queues before this call have run.
    pub async fn flush(&self) {
        self.cache_in.flush().await;
        self.cache_out.flush().await;
    }
}

/// Reads and decodes the file for `key`, treating every failure as a miss.
fn load_from_disk(
    disk: &DiskStore,
    codec: &dyn ImageCodec,
    key: &CacheKey,
) -> Option<DecodedImage> {
    let data = match disk.read(key) {
        Ok(Some(data)) => data,
        Ok(None) => {
            metric!(counter("caches.file.miss") += 1);
            return None;
        }
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %disk.file_path(key).display(),
                "Failed to read cache file",
            );
            return None;
        }
    };

    metric!(counter("caches.file.hit") += 1);
    metric!(time_raw("caches.file.size") = data.len() as u64);
    tracing::trace!(%key, "Loading image from disk");

    match codec.decode(&data) {
        Ok(image) => Some(image),
        Err(e) => {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                %key,
                "Failed to decode cache file",
            );
            None
        }
    }
}
