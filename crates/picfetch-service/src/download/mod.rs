//! Fetching the encoded bytes of an image.
//!
//! The [`RequestManager`](crate::manager::RequestManager) only ever talks to a [`Downloader`].
//! It starts at most one download per URL, and cancels a download by dropping its future, so
//! implementations must not rely on being polled to completion.

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::ImageError;

mod http;

pub use http::HttpDownloader;

/// The priority a download is started with.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    #[default]
    Normal,
    /// Speculative downloads, like prefetching images that are not on screen yet.
    Low,
}

/// Fetches the bytes of a remote image.
pub trait Downloader: Send + Sync + 'static {
    /// Starts downloading `url`.
    ///
    /// The returned future resolves to the complete response body. Dropping it cancels the
    /// download.
    fn download(
        &self,
        url: &Url,
        priority: Priority,
    ) -> BoxFuture<'static, Result<Bytes, ImageError>>;
}

/// Creates a [`reqwest::Client`] with the configured timeouts and user agent.
pub fn create_client(config: &DownloadConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .user_agent(config.user_agent.as_str())
        .build()
}
