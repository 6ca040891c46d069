use std::collections::HashSet;

use url::Url;

use crate::error::ImageError;

/// The URLs whose most recent download failed.
///
/// A URL stays in the set until it is downloaded successfully, is requested with
/// [`Options::RETRY_FAILED`](super::Options::RETRY_FAILED), or is explicitly forgotten. Until
/// then, requests for it fail right away with [`ImageError::PreviouslyFailed`].
#[derive(Debug, Default)]
pub(super) struct FailedSet {
    urls: HashSet<Url>,
}

impl FailedSet {
    /// Registers a download failure for the given `url`.
    pub fn register_failure(&mut self, url: &Url, error: &ImageError) {
        if !error.is_network_failure() {
            return;
        }

        tracing::debug!(%url, %error, "Marking url as failed");
        self.urls.insert(url.clone());
        metric!(gauge("manager.failed_urls") = self.urls.len() as u64);
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.urls.contains(url)
    }

    /// Forgets a past failure, returning whether there was one.
    pub fn remove(&mut self, url: &Url) -> bool {
        let removed = self.urls.remove(url);
        if removed {
            tracing::trace!(%url, "Forgetting failed url");
            metric!(gauge("manager.failed_urls") = self.urls.len() as u64);
        }
        removed
    }
}
