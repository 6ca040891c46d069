//! Turning bytes into images and back.
//!
//! The cache never looks into image data itself. It hands downloaded or persisted bytes to an
//! [`ImageCodec`] and keeps the resulting [`DecodedImage`] in memory.

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use crate::error::ImageError;

/// A decoded image, cheap to clone and share between subscribers.
#[derive(Clone)]
pub struct DecodedImage(Arc<DynamicImage>);

impl DecodedImage {
    pub fn new(image: DynamicImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Whether the pixel format carries an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.0.color().has_alpha()
    }

    /// The approximate number of bytes the decoded pixels occupy.
    pub fn byte_size(&self) -> u64 {
        self.0.as_bytes().len() as u64
    }

    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.0
    }

    /// Whether both handles point to the very same decoded image.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.0.color())
            .finish()
    }
}

impl From<DynamicImage> for DecodedImage {
    fn from(image: DynamicImage) -> Self {
        Self::new(image)
    }
}

/// Decodes image bytes and re-encodes images that have to be persisted without their original
/// bytes.
///
/// Codecs are called from the background queues and from download tasks, so they have to be
/// thread safe.
pub trait ImageCodec: Send + Sync + 'static {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, ImageError>;

    /// Produces a byte representation of `image` that [`decode`](Self::decode) can read back.
    fn encode(&self, image: &DecodedImage) -> Result<Vec<u8>, ImageError>;
}

/// The default codec, backed by the `image` crate.
///
/// Images with an alpha channel are encoded as PNG, all others as JPEG at full quality.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodec;

const JPEG_QUALITY: u8 = 100;

impl ImageCodec for DefaultCodec {
    fn decode(&self, data: &[u8]) -> Result<DecodedImage, ImageError> {
        let image = image::load_from_memory(data)?;
        Ok(DecodedImage::new(image))
    }

    fn encode(&self, image: &DecodedImage) -> Result<Vec<u8>, ImageError> {
        let mut buf = Cursor::new(Vec::new());
        if image.has_alpha() {
            image.as_dynamic().write_to(&mut buf, ImageFormat::Png)?;
        } else {
            let rgb = image.as_dynamic().to_rgb8();
            JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY).encode_image(&rgb)?;
        }
        Ok(buf.into_inner())
    }
}
