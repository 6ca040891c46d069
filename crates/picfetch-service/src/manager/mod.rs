//! Coordinating many subscribers, the cache and the downloader.
//!
//! The [`RequestManager`] resolves a URL to a decoded image for any number of subscribers:
//!
//! 1. A malformed URL, or a URL whose last download failed, fails right away.
//! 2. Otherwise, the [`ImageCache`] is queried, first in memory, then on disk.
//! 3. On a miss, the URL is downloaded. All subscribers asking for the same URL while it is
//!    being downloaded share one download, and are notified in the order they subscribed.
//! 4. The downloaded image is stored in the cache and fanned out to the subscribers.
//!
//! The manager lives on one thread: it is `!Send`, all its methods must be called from within
//! a [`tokio::task::LocalSet`], and all subscriber callbacks run on that same thread. Apart from
//! the two immediate failures of step 1, results are always delivered on a later turn, never
//! from within [`request`](RequestManager::request).
//!
//! [`cancel`](RequestManager::cancel) unsubscribes a subscriber from everything it requested.
//! Results that arrive afterwards are dropped, and a download nobody is waiting for anymore is
//! aborted.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::AbortHandle;
use url::Url;

use crate::caching::{CacheKey, ImageCache};
use crate::codec::{DecodedImage, DefaultCodec, ImageCodec};
use crate::config::Config;
use crate::download::{Downloader, HttpDownloader, Priority};
use crate::error::ImageError;

mod failed;
mod request;

pub use request::{ImageRequest, Options, Subscriber, SubscriberRef};

use failed::FailedSet;
use request::{Subscription, parse_locator, same_subscriber};

/// A cache lookup that has not come back yet.
struct PendingQuery {
    id: u64,
    subscriber: SubscriberRef,
    key: CacheKey,
}

/// The subscribers waiting for one URL to be downloaded.
struct Inflight {
    id: u64,
    subscriptions: VecDeque<Subscription>,
    /// Aborts the download. Taken once the download completed.
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    queries: Vec<PendingQuery>,
    inflight: HashMap<Url, Inflight>,
    failed: FailedSet,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn take_query(&mut self, id: u64) -> Option<PendingQuery> {
        let index = self.queries.iter().position(|query| query.id == id)?;
        Some(self.queries.remove(index))
    }

    fn inflight_mut(&mut self, url: &Url, id: u64) -> Option<&mut Inflight> {
        self.inflight.get_mut(url).filter(|inflight| inflight.id == id)
    }
}

struct Inner {
    cache: ImageCache,
    downloader: Arc<dyn Downloader>,
    state: RefCell<State>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for inflight in self.state.get_mut().inflight.values_mut() {
            if let Some(abort) = inflight.abort.take() {
                abort.abort();
            }
        }
    }
}

/// Resolves URLs to images for many subscribers at once.
///
/// Cloning is cheap, all clones share the same state.
#[derive(Clone)]
pub struct RequestManager {
    inner: Rc<Inner>,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("RequestManager")
            .field("cache", &self.inner.cache)
            .field("queries", &state.queries.len())
            .field("inflight", &state.inflight.len())
            .finish()
    }
}

impl RequestManager {
    pub fn new(cache: ImageCache, downloader: Arc<dyn Downloader>) -> Self {
        Self {
            inner: Rc::new(Inner {
                cache,
                downloader,
                state: RefCell::default(),
            }),
        }
    }

    /// Creates a manager with the default codec and HTTP downloader.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let cache = ImageCache::from_config(config, Arc::new(DefaultCodec))?;
        let downloader = HttpDownloader::from_config(&config.download)?;
        Ok(Self::new(cache, Arc::new(downloader)))
    }

    pub fn cache(&self) -> &ImageCache {
        &self.inner.cache
    }

    /// Requests an image for `subscriber`.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a [`tokio::task::LocalSet`].
    pub fn request(&self, request: impl Into<ImageRequest>, subscriber: &SubscriberRef) {
        metric!(counter("manager.request") += 1);
        let (locator, subscription) = Subscription::new(request.into(), subscriber);

        let url = match parse_locator(locator.as_deref()) {
            Ok(url) => url,
            Err(error) => {
                tracing::debug!(%error, "Rejecting request");
                subscription.deliver_malformed(&error);
                return;
            }
        };

        let key = CacheKey::from_url(&url);
        let id = {
            let mut state = self.inner.state.borrow_mut();
            if subscription.options.contains(Options::RETRY_FAILED) {
                state.failed.remove(&url);
            } else if state.failed.contains(&url) {
                drop(state);
                tracing::trace!(%url, "Url failed before");
                metric!(counter("manager.failed_short_circuit") += 1);
                subscription.deliver_error(&url, &ImageError::PreviouslyFailed);
                return;
            }

            let id = state.next_id();
            state.queries.push(PendingQuery {
                id,
                subscriber: Rc::clone(subscriber),
                key: key.clone(),
            });
            id
        };

        tracing::trace!(%url, id, "Querying cache");
        let manager = Rc::downgrade(&self.inner);
        self.inner.cache.query_disk_with(
            &key,
            (url, subscription),
            move |image, _key, (url, subscription)| {
                if let Some(manager) = upgrade(&manager) {
                    manager.query_finished(id, url, subscription, image);
                }
            },
        );
    }

    /// Unsubscribes `subscriber` from all of its requests.
    ///
    /// No callback reaches the subscriber after this returns. Downloads that have no
    /// subscribers left are aborted.
    pub fn cancel(&self, subscriber: &SubscriberRef) {
        metric!(counter("manager.cancel") += 1);

        // dropped once the state is no longer borrowed
        let cancelled_queries: Vec<PendingQuery>;
        let mut cancelled = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();

            let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queries)
                .into_iter()
                .partition(|query| same_subscriber(&query.subscriber, subscriber));
            state.queries = rest;
            cancelled_queries = matching;

            state.inflight.retain(|url, inflight| {
                let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                    std::mem::take(&mut inflight.subscriptions)
                        .into_iter()
                        .partition(|subscription| subscription.is_subscriber(subscriber));
                inflight.subscriptions = rest;
                if matching.is_empty() {
                    return true;
                }
                cancelled.extend(matching);

                if !inflight.subscriptions.is_empty() {
                    return true;
                }
                if let Some(abort) = inflight.abort.take() {
                    tracing::debug!(%url, "Aborting download without subscribers");
                    abort.abort();
                }
                false
            });
        }

        tracing::trace!(
            queries = cancelled_queries.len(),
            downloads = cancelled.len(),
            "Cancelled subscriber"
        );
        for query in &cancelled_queries {
            tracing::trace!(key = %query.key, "Dropping cache query");
        }
    }

    /// Looks `url` up in memory, then synchronously on disk, without downloading it.
    pub fn cached_image(&self, url: &Url) -> Option<DecodedImage> {
        self.inner
            .cache
            .image_from_key(&CacheKey::from_url(url), true)
    }

    /// Whether the last download of `url` failed.
    pub fn is_failed(&self, url: &Url) -> bool {
        self.inner.state.borrow().failed.contains(url)
    }

    /// Forgets that the last download of `url` failed, returning whether it did.
    pub fn forget_failed(&self, url: &Url) -> bool {
        self.inner.state.borrow_mut().failed.remove(url)
    }

    fn query_finished(
        &self,
        id: u64,
        url: Url,
        subscription: Subscription,
        image: Option<DecodedImage>,
    ) {
        let query = self.inner.state.borrow_mut().take_query(id);
        if query.is_none() {
            tracing::trace!(%url, id, "Dropping result of cancelled query");
            return;
        }

        match image {
            Some(image) => {
                tracing::debug!(%url, "Cache hit");
                subscription.deliver_image(&image, &url);
            }
            None => {
                tracing::debug!(%url, "Cache miss");
                self.start_download(url, subscription);
            }
        }
    }

    /// Subscribes to the download of `url`, starting it if it is not running yet.
    fn start_download(&self, url: Url, subscription: Subscription) {
        let mut state = self.inner.state.borrow_mut();
        if let Some(inflight) = state.inflight.get_mut(&url) {
            tracing::trace!(%url, "Joining inflight download");
            metric!(counter("manager.coalesced") += 1);
            inflight.subscriptions.push_back(subscription);
            return;
        }

        let priority = match subscription.options.contains(Options::LOW_PRIORITY) {
            true => Priority::Low,
            false => Priority::Normal,
        };
        tracing::debug!(%url, ?priority, "Starting download");
        metric!(counter("manager.download") += 1, "priority" => priority_tag(priority));

        let id = state.next_id();
        let download = self.inner.downloader.download(&url, priority);
        let codec = Arc::clone(self.inner.cache.codec());
        let manager = Rc::downgrade(&self.inner);
        let task_url = url.clone();
        let handle = tokio::task::spawn_local(async move {
            let result = download.await;
            let decoded = match result {
                Ok(bytes) => decode(codec, bytes).await,
                Err(error) => Err(error),
            };

            if let Some(manager) = upgrade(&manager) {
                manager.download_finished(id, task_url, decoded);
            }
        });

        state.inflight.insert(
            url,
            Inflight {
                id,
                subscriptions: VecDeque::from([subscription]),
                abort: Some(handle.abort_handle()),
            },
        );
    }

    fn download_finished(
        &self,
        id: u64,
        url: Url,
        result: Result<(DecodedImage, Bytes), ImageError>,
    ) {
        {
            let mut state = self.inner.state.borrow_mut();
            let Some(inflight) = state.inflight_mut(&url, id) else {
                return;
            };
            // from here on, cancelling must not abort the fanout
            inflight.abort = None;
            let to_disk = inflight
                .subscriptions
                .iter()
                .any(|subscription| !subscription.options.contains(Options::MEMORY_ONLY));

            match &result {
                Ok((image, data)) => {
                    state.failed.remove(&url);
                    // stored before the fanout, so requests made from within a callback hit
                    self.inner.cache.store(
                        image.clone(),
                        Some(data.clone()),
                        &CacheKey::from_url(&url),
                        to_disk,
                    );
                }
                Err(error) => {
                    tracing::debug!(%url, %error, "Download failed");
                    state.failed.register_failure(&url, error);
                }
            }
        }

        loop {
            let next = {
                let mut state = self.inner.state.borrow_mut();
                state
                    .inflight_mut(&url, id)
                    .and_then(|inflight| inflight.subscriptions.pop_front())
            };
            let Some(subscription) = next else {
                break;
            };
            match &result {
                Ok((image, _)) => subscription.deliver_image(image, &url),
                Err(error) => subscription.deliver_error(&url, error),
            }
        }

        let finished = {
            let mut state = self.inner.state.borrow_mut();
            let is_ours = state.inflight_mut(&url, id).is_some();
            if is_ours { state.inflight.remove(&url) } else { None }
        };
        drop(finished);
    }
}

fn upgrade(inner: &Weak<Inner>) -> Option<RequestManager> {
    inner.upgrade().map(|inner| RequestManager { inner })
}

fn priority_tag(priority: Priority) -> &'static str {
    match priority {
        Priority::Normal => "normal",
        Priority::Low => "low",
    }
}

/// Decodes downloaded bytes on the blocking thread pool.
async fn decode(
    codec: Arc<dyn ImageCodec>,
    bytes: Bytes,
) -> Result<(DecodedImage, Bytes), ImageError> {
    tokio::task::spawn_blocking(move || -> Result<_, ImageError> {
        let image = codec.decode(&bytes)?;
        Ok((image, bytes))
    })
    .await
    .map_err(|e| ImageError::DecodeFailed(e.to_string()))?
}
