use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use url::Url;

use picfetch_service::config::CacheConfig;
use picfetch_service::{
    DecodedImage, DefaultCodec, Downloader, ImageCache, ImageError, Priority, RequestManager,
    Subscriber, SubscriberRef,
};
use picfetch_test as test;

pub use test::{Server, TempDir};

/// Setup tests and create a manager backed by a [`FakeDownloader`].
///
/// The cache lives in a temporary directory, which is cleaned up when the [`TempDir`] instance is
/// dropped. Keep it as guard until the test has finished.
pub fn setup_manager() -> (RequestManager, Arc<FakeDownloader>, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = ImageCache::new(
        cache_dir.path(),
        CacheConfig::default(),
        Arc::new(DefaultCodec),
    )
    .unwrap();
    let downloader = Arc::new(FakeDownloader::default());
    let manager = RequestManager::new(cache, downloader.clone());

    (manager, downloader, cache_dir)
}

/// Runs `future` on a fresh [`LocalSet`], which the manager needs for its tasks.
pub async fn run_local<F: Future>(future: F) -> F::Output {
    LocalSet::new().run_until(future).await
}

/// Waits until all cache lookups issued so far have been answered and processed.
pub async fn settle(manager: &RequestManager) {
    manager.cache().flush().await;
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within 5 seconds.
#[track_caller]
pub fn wait_until(mut condition: impl FnMut() -> bool) -> impl Future<Output = ()> {
    let caller = std::panic::Location::caller();
    async move {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting at {caller}");
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

pub fn url(s: &str) -> Url {
    s.parse().unwrap()
}

/// A [`Downloader`] whose downloads only finish when the test says so.
#[derive(Debug, Default)]
pub struct FakeDownloader {
    started: Mutex<Vec<(Url, Priority)>>,
    pending: Mutex<HashMap<Url, oneshot::Sender<Result<Bytes, ImageError>>>>,
}

impl FakeDownloader {
    /// The number of downloads started so far.
    pub fn downloads(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// All downloads started so far, in order.
    pub fn started(&self) -> Vec<(Url, Priority)> {
        self.started.lock().unwrap().clone()
    }

    /// Finishes the download of `url`, returning `false` if nobody was waiting for it anymore.
    pub fn complete(&self, url: &Url, result: Result<Bytes, ImageError>) -> bool {
        match self.pending.lock().unwrap().remove(url) {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Whether the latest download of `url` was dropped before it finished.
    pub fn is_cancelled(&self, url: &Url) -> bool {
        self.pending
            .lock()
            .unwrap()
            .get(url)
            .is_some_and(|sender| sender.is_closed())
    }
}

impl Downloader for FakeDownloader {
    fn download(
        &self,
        url: &Url,
        priority: Priority,
    ) -> BoxFuture<'static, Result<Bytes, ImageError>> {
        let (sender, receiver) = oneshot::channel();
        self.started.lock().unwrap().push((url.clone(), priority));
        self.pending.lock().unwrap().insert(url.clone(), sender);

        async move {
            receiver
                .await
                .unwrap_or_else(|_| Err(ImageError::NetworkFailed("download dropped".into())))
        }
        .boxed()
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Received(Url, DecodedImage),
    Failed(Option<Url>, ImageError),
}

/// A [`Subscriber`] that records everything it is told.
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: RefCell<Vec<Event>>,
}

impl RecordingSubscriber {
    pub fn new() -> Rc<Self> {
        Rc::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn count(&self) -> usize {
        self.events.borrow().len()
    }

    /// The URLs of all received images.
    pub fn received(&self) -> Vec<Url> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Received(url, _) => Some(url),
                Event::Failed(..) => None,
            })
            .collect()
    }

    pub fn images(&self) -> Vec<DecodedImage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Received(_, image) => Some(image),
                Event::Failed(..) => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<(Option<Url>, ImageError)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Received(..) => None,
                Event::Failed(url, error) => Some((url, error)),
            })
            .collect()
    }
}

impl Subscriber for RecordingSubscriber {
    fn did_receive(&self, image: &DecodedImage, url: &Url) {
        self.events
            .borrow_mut()
            .push(Event::Received(url.clone(), image.clone()));
    }

    fn did_fail(&self, url: Option<&Url>, error: &ImageError) {
        self.events
            .borrow_mut()
            .push(Event::Failed(url.cloned(), error.clone()));
    }
}

/// Upcasts a recording subscriber into the handle the manager works with.
pub fn subscriber(recording: &Rc<RecordingSubscriber>) -> SubscriberRef {
    recording.clone()
}
