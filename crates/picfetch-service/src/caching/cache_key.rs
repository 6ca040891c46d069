use std::fmt;
use std::sync::Arc;

use md5::{Digest, Md5};
use url::Url;

/// The key of an image in both cache tiers.
///
/// The key is the absolute textual form of the URL the image was fetched from. It is used as
/// the key of the in-memory tier, and hashed to form the [file name](Self::file_name) of the
/// on-disk tier.
///
/// **NOTE**: The key must be stable across process restarts. Changing how it is derived
/// invalidates all on-disk content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key from any string, for images that are not tied to a URL.
    pub fn new(key: impl AsRef<str>) -> Self {
        Self(key.as_ref().into())
    }

    /// Derives the key for an image fetched from `url`.
    pub fn from_url(url: &Url) -> Self {
        Self::new(url.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the name of the file holding this image in the on-disk tier.
    ///
    /// This is the lowercase hex encoded MD5 digest of the key. Collisions are treated as
    /// impossible.
    pub fn file_name(&self) -> String {
        hex::encode(Md5::digest(self.0.as_bytes()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&Url> for CacheKey {
    fn from(url: &Url) -> Self {
        Self::from_url(url)
    }
}
