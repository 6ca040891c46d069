use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;
use url::Url;

use crate::codec::DecodedImage;
use crate::error::ImageError;

bitflags! {
    /// Per-request options.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Options: u32 {
        /// Download the URL even if its last download failed.
        const RETRY_FAILED = 1;
        /// Start the download with [`Priority::Low`](crate::download::Priority::Low).
        const LOW_PRIORITY = 1 << 1;
        /// Keep the downloaded image in memory only.
        ///
        /// The image is still written to disk if another subscriber of the same download did
        /// not ask for this.
        const MEMORY_ONLY = 1 << 2;
    }
}

/// Receives the outcome of the requests it subscribed to.
///
/// All methods are called on the thread that made the request, and never while the
/// [`RequestManager`](super::RequestManager) holds internal borrows, so implementations are free
/// to issue new requests or cancel from within.
pub trait Subscriber {
    fn did_receive(&self, image: &DecodedImage, url: &Url);

    /// `url` is `None` if the request did not carry a valid URL.
    fn did_fail(&self, url: Option<&Url>, error: &ImageError);
}

/// A shared handle to a [`Subscriber`].
///
/// Subscribers are identified by the address of the value behind the handle, so clones of one
/// handle are the same subscriber.
pub type SubscriberRef = Rc<dyn Subscriber>;

pub(crate) fn same_subscriber(a: &SubscriberRef, b: &SubscriberRef) -> bool {
    std::ptr::eq(Rc::as_ptr(a) as *const (), Rc::as_ptr(b) as *const ())
}

type SuccessCallback = Box<dyn FnOnce(&DecodedImage)>;
type FailureCallback = Box<dyn FnOnce(&ImageError)>;

/// A request for one image, passed to [`RequestManager::request`](super::RequestManager::request).
///
/// ```
/// use picfetch_service::manager::{ImageRequest, Options};
///
/// let request = ImageRequest::new("https://example.com/cat.png")
///     .options(Options::LOW_PRIORITY | Options::MEMORY_ONLY)
///     .on_success(|image| println!("{}x{}", image.width(), image.height()));
/// ```
#[derive(Default)]
pub struct ImageRequest {
    pub(super) locator: Option<String>,
    pub(super) options: Options,
    pub(super) on_success: Option<SuccessCallback>,
    pub(super) on_failure: Option<FailureCallback>,
}

impl ImageRequest {
    pub fn new(locator: impl Into<String>) -> Self {
        Self {
            locator: Some(locator.into()),
            ..Default::default()
        }
    }

    /// A request that does not carry any URL, and therefore fails as malformed.
    pub fn without_url() -> Self {
        Self::default()
    }

    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Called with the image right before [`Subscriber::did_receive`].
    pub fn on_success(mut self, callback: impl FnOnce(&DecodedImage) + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Called with the error right before [`Subscriber::did_fail`].
    ///
    /// For a malformed request, this replaces the call to [`Subscriber::did_fail`].
    pub fn on_failure(mut self, callback: impl FnOnce(&ImageError) + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("locator", &self.locator)
            .field("options", &self.options)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

impl From<&str> for ImageRequest {
    fn from(locator: &str) -> Self {
        Self::new(locator)
    }
}

impl From<String> for ImageRequest {
    fn from(locator: String) -> Self {
        Self::new(locator)
    }
}

impl From<&Url> for ImageRequest {
    fn from(url: &Url) -> Self {
        Self::new(url.as_str())
    }
}

impl From<Url> for ImageRequest {
    fn from(url: Url) -> Self {
        Self::new(String::from(url))
    }
}

/// Parses the locator of a request into an absolute URL.
pub(super) fn parse_locator(locator: Option<&str>) -> Result<Url, ImageError> {
    let locator = locator
        .map(str::trim)
        .filter(|locator| !locator.is_empty())
        .ok_or_else(|| ImageError::Malformed("missing url".into()))?;

    Url::parse(locator).map_err(|e| ImageError::Malformed(format!("`{locator}`: {e}")))
}

/// One subscriber waiting for one image, together with its per-request options and callbacks.
pub(super) struct Subscription {
    pub subscriber: SubscriberRef,
    pub options: Options,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
}

impl Subscription {
    pub fn new(request: ImageRequest, subscriber: &SubscriberRef) -> (Option<String>, Self) {
        let ImageRequest {
            locator,
            options,
            on_success,
            on_failure,
        } = request;
        let subscription = Self {
            subscriber: Rc::clone(subscriber),
            options,
            on_success,
            on_failure,
        };
        (locator, subscription)
    }

    pub fn is_subscriber(&self, subscriber: &SubscriberRef) -> bool {
        same_subscriber(&self.subscriber, subscriber)
    }

    pub fn deliver_image(self, image: &DecodedImage, url: &Url) {
        if let Some(on_success) = self.on_success {
            on_success(image);
        }
        self.subscriber.did_receive(image, url);
    }

    pub fn deliver_error(self, url: &Url, error: &ImageError) {
        if let Some(on_failure) = self.on_failure {
            on_failure(error);
        }
        self.subscriber.did_fail(Some(url), error);
    }

    pub fn deliver_malformed(self, error: &ImageError) {
        match self.on_failure {
            Some(on_failure) => on_failure(error),
            None => self.subscriber.did_fail(None, error),
        }
    }
}
