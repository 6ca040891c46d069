//! Support to download images from HTTP servers.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use tokio::sync::Semaphore;
use url::Url;

use crate::config::DownloadConfig;
use crate::error::ImageError;

use super::{Downloader, Priority, create_client};

/// Downloader implementation for `http` and `https` URLs.
///
/// Normal priority downloads start right away. Low priority downloads wait for one of
/// `max_low_priority` slots, so prefetching never saturates the connection pool.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    low_priority: Arc<Semaphore>,
}

impl HttpDownloader {
    pub fn new(client: Client, max_low_priority: usize) -> Self {
        Self {
            client,
            low_priority: Arc::new(Semaphore::new(max_low_priority.max(1))),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(config)?, config.max_low_priority))
    }
}

impl Downloader for HttpDownloader {
    fn download(
        &self,
        url: &Url,
        priority: Priority,
    ) -> BoxFuture<'static, Result<Bytes, ImageError>> {
        let client = self.client.clone();
        let low_priority = Arc::clone(&self.low_priority);
        let url = url.clone();

        async move {
            // the semaphore is never closed
            let _permit = match priority {
                Priority::Low => low_priority.acquire_owned().await.ok(),
                Priority::Normal => None,
            };

            tracing::debug!(%url, ?priority, "Fetching image");
            metric!(counter("download.start") += 1);

            let response = client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                tracing::debug!(%url, %status, "Unexpected status code");
                return Err(ImageError::NetworkFailed(format!(
                    "unexpected status code {status}"
                )));
            }

            let bytes = response.bytes().await?;
            metric!(time_raw("download.size") = bytes.len() as u64);
            tracing::trace!(%url, size = bytes.len(), "Finished download");

            Ok(bytes)
        }
        .boxed()
    }
}
