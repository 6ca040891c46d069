use std::error::Error;

use thiserror::Error;

/// An error that happens while resolving an image for a subscriber.
///
/// All variants are cheap to clone, since a single failed download is fanned out to every
/// subscriber waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    /// The requested locator was empty or could not be parsed as a URL.
    #[error("malformed url: {0}")]
    Malformed(String),
    /// The downloader reported a failure, like connection loss, DNS resolution, or a non-2xx
    /// server response.
    #[error("download failed: {0}")]
    NetworkFailed(String),
    /// Bytes were retrieved, but could not be decoded into an image.
    #[error("decoding failed: {0}")]
    DecodeFailed(String),
    /// Reading or writing the on-disk store failed.
    ///
    /// This is never delivered to subscribers. The cache logs it and degrades to memory-only
    /// behavior instead.
    #[error("disk i/o failed: {0}")]
    DiskIoFailed(String),
    /// The URL failed before and the request did not ask to retry failed URLs.
    #[error("previously failed")]
    PreviouslyFailed,
}

impl ImageError {
    /// Whether this error should put the URL on the failed list.
    pub fn is_network_failure(&self) -> bool {
        matches!(self, Self::NetworkFailed(_) | Self::DecodeFailed(_))
    }

    pub(crate) fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }
        Self::NetworkFailed(error.to_string())
    }
}

impl From<std::io::Error> for ImageError {
    fn from(err: std::io::Error) -> Self {
        Self::DiskIoFailed(err.to_string())
    }
}

impl From<reqwest::Error> for ImageError {
    fn from(err: reqwest::Error) -> Self {
        Self::download_error(&err)
    }
}

impl From<image::ImageError> for ImageError {
    fn from(err: image::ImageError) -> Self {
        Self::DecodeFailed(err.to_string())
    }
}
