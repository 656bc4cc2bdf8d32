use std::future::Future;
use std::sync::Arc;

use thiserror::Error;

use crate::formats::OutputFormat;
use crate::image_codec::{ConvertError, PreparedImage};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error("Request to conversion endpoint failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Conversion endpoint answered {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Something that turns one fixed source image into bytes at a given quality.
///
/// The target-size search only ever talks to this trait, so it runs the
/// same against the in-process codec, a remote `/api/convert`, or a stub.
pub trait Encoder {
    fn output_format(&self) -> OutputFormat;

    /// `false` skips the search and encodes once.
    ///
    /// Only JPEG and AVIF have one here. WebP is written losslessly by the
    /// `image` crate, so shrinking a `.webp` source is always a single
    /// attempt and usually lands outside the tolerance.
    fn has_quality_axis(&self) -> bool {
        self.output_format().has_quality_axis()
    }

    fn encode(
        &self,
        quality: Option<u8>,
    ) -> impl Future<Output = Result<Vec<u8>, EncodeError>> + Send;
}

// In-process encoder - decodes once, encodes on the blocking pool per attempt
pub struct LocalEncoder {
    image: Arc<PreparedImage>,
    format: OutputFormat,
}

impl LocalEncoder {
    pub fn new(image: PreparedImage, format: OutputFormat) -> Self {
        Self {
            image: Arc::new(image),
            format,
        }
    }
}

impl Encoder for LocalEncoder {
    fn output_format(&self) -> OutputFormat {
        self.format
    }

    async fn encode(&self, quality: Option<u8>) -> Result<Vec<u8>, EncodeError> {
        let image = Arc::clone(&self.image);
        let format = self.format;
        let encoded = tokio::task::spawn_blocking(move || image.encode(format, quality, None))
            .await
            .map_err(ConvertError::from)??;
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_codec::ResizeOptions;
    use crate::size_search::{SearchPolicy, reduce_to_target};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tokio_util::sync::CancellationToken;

    fn prepared(width: u32, height: u32) -> PreparedImage {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
        });
        let mut png = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut png, ImageFormat::Png)
            .unwrap();
        PreparedImage::decode(png.get_ref(), ResizeOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn webp_reduction_is_one_lossless_attempt() {
        let encoder = LocalEncoder::new(prepared(32, 32), OutputFormat::Webp);
        assert!(!encoder.has_quality_axis());

        let outcome = reduce_to_target(
            &encoder,
            1_000_000,
            10,
            &SearchPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.quality, None);
        assert!(!outcome.within_tolerance);
        assert_eq!(image::guess_format(&outcome.data).unwrap(), ImageFormat::WebP);
    }

    #[tokio::test]
    async fn jpeg_quality_drives_local_output_size() {
        let encoder = LocalEncoder::new(prepared(96, 96), OutputFormat::Jpeg);
        assert!(encoder.has_quality_axis());

        let high = encoder.encode(Some(95)).await.unwrap();
        let low = encoder.encode(Some(10)).await.unwrap();
        assert!(low.len() < high.len());
    }
}
