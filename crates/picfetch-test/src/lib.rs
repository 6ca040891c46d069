//! Helpers for testing the image cache and request manager.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. When dropped too early, the directory is deleted while the
//!    cache still writes to it. To avoid this, assign it to a variable in the test function
//!    (e.g. `let _cache_dir = test::tempdir()`).
//!
//!  - When using [`Server`], make sure that the server is held until all requests to the
//!    server have been made. If the server is dropped, the ports remain open and all
//!    connections to it will time out.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract;
use axum::routing::get;
use axum::{Router, middleware};
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use reqwest::{StatusCode, Url};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `picfetch_service` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("picfetch_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

fn encode(image: DynamicImage, format: ImageFormat) -> Bytes {
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    Bytes::from(buf.into_inner())
}

/// A small PNG with an alpha channel. Every `seed` gives a different image.
pub fn png_bytes(seed: u8) -> Bytes {
    let image = RgbaImage::from_fn(8, 8, |x, y| Rgba([seed, x as u8 * 16, y as u8 * 16, 200]));
    encode(image.into(), ImageFormat::Png)
}

/// A small opaque JPEG. Every `seed` gives a different image.
pub fn jpeg_bytes(seed: u8) -> Bytes {
    let image = RgbImage::from_pixel(16, 16, Rgb([seed, 128, 64]));
    encode(image.into(), ImageFormat::Jpeg)
}

/// A test server that binds to a random port and serves images.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
///
/// Routes:
///  - `/png/:seed/*tail` and `/jpeg/:seed/*tail`: a [`png_bytes`] / [`jpeg_bytes`] image.
///  - `/delay/:millis/:seed/*tail`: a [`png_bytes`] image, served after a delay.
///  - `/respond_statuscode/:num/*tail`: an empty response with the given status.
///  - `/garbage_data/*tail`: the `tail` as plain text, which is not an image.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/png/:seed/*tail",
                get(
                    |extract::Path((seed, _)): extract::Path<(u8, String)>| async move {
                        ([("Content-Type", "image/png")], png_bytes(seed))
                    },
                ),
            )
            .route(
                "/jpeg/:seed/*tail",
                get(
                    |extract::Path((seed, _)): extract::Path<(u8, String)>| async move {
                        ([("Content-Type", "image/jpeg")], jpeg_bytes(seed))
                    },
                ),
            )
            .route(
                "/delay/:millis/:seed/*tail",
                get(|extract::Path(params): extract::Path<(u64, u8, String)>| async move {
                    let (millis, seed, _) = params;
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                    ([("Content-Type", "image/png")], png_bytes(seed))
                }),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .layer(middleware::from_fn(hitcounter));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// Returns and resets the number of requests served so far.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns and resets the number of requests per path served so far.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
