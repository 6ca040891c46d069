//! An asynchronous image fetching and caching engine.
//!
//! The [`RequestManager`] hands decoded images to any number of [`Subscriber`]s, backed by the
//! two-tier (memory and disk) [`ImageCache`] and a [`Downloader`].

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod logging;
pub mod manager;

pub use caching::{CacheKey, ImageCache};
pub use codec::{DecodedImage, DefaultCodec, ImageCodec};
pub use download::{Downloader, HttpDownloader, Priority};
pub use error::ImageError;
pub use manager::{ImageRequest, Options, RequestManager, Subscriber, SubscriberRef};
