//! Raster conversion on top of the `image` crate.
//!
//! Decoding and resizing happen once in [`PreparedImage::decode`]; encoding
//! can then run any number of times, which is what the target-size search
//! relies on. Everything here is CPU-bound and meant to run inside
//! `spawn_blocking`.

use std::io::Cursor;

use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tiff::TiffEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageReader, Limits, Rgb, RgbImage};
use thiserror::Error;

use crate::formats::OutputFormat;

/// Largest width or height we agree to decode.
const MAX_IMAGE_DIMENSION: u32 = 16384;

/// AVIF encoder speed (1 slowest .. 10 fastest).
const AVIF_SPEED: u8 = 8;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("Image decode failed: {0}")]
    Decode(#[source] image::ImageError),
    #[error("Image encoding failed: {0}")]
    Encode(#[source] image::ImageError),
    #[error("Could not read image header: {0}")]
    Io(#[from] std::io::Error),
    #[error("Conversion task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Per-request options that shape the decoded image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResizeOptions {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Everything `/api/convert` needs besides the bytes.
#[derive(Debug, Clone, Copy)]
pub struct ConvertOptions {
    pub format: OutputFormat,
    pub quality: Option<u8>,
    pub resize: ResizeOptions,
    pub background: Option<Rgb<u8>>,
}

impl ConvertOptions {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            quality: None,
            resize: ResizeOptions::default(),
            background: None,
        }
    }
}

/// A decoded, resized image ready to be encoded.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    image: DynamicImage,
}

impl PreparedImage {
    pub fn decode(data: &[u8], resize: ResizeOptions) -> Result<Self, ConvertError> {
        let mut reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_IMAGE_DIMENSION);
        limits.max_image_height = Some(MAX_IMAGE_DIMENSION);
        reader.limits(limits);

        let image = reader.decode().map_err(ConvertError::Decode)?;
        Ok(Self {
            image: fit_inside(image, resize),
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    /// Encode into `format`. `quality` is ignored by lossless formats.
    pub fn encode(
        &self,
        format: OutputFormat,
        quality: Option<u8>,
        background: Option<Rgb<u8>>,
    ) -> Result<Vec<u8>, ConvertError> {
        let quality = quality.or(format.default_quality()).unwrap_or(90).clamp(1, 100);
        let mut buf = Vec::new();

        match format {
            OutputFormat::Jpeg => {
                let rgb = match background {
                    Some(bg) => flatten(&self.image, bg),
                    None => self.image.to_rgb8(),
                };
                JpegEncoder::new_with_quality(&mut buf, quality)
                    .encode_image(&rgb)
                    .map_err(ConvertError::Encode)?;
            }
            OutputFormat::Png => {
                DynamicImage::ImageRgba8(self.image.to_rgba8())
                    .write_with_encoder(PngEncoder::new(&mut buf))
                    .map_err(ConvertError::Encode)?;
            }
            OutputFormat::Webp => {
                // lossless only; `quality` is ignored
                DynamicImage::ImageRgba8(self.image.to_rgba8())
                    .write_with_encoder(WebPEncoder::new_lossless(&mut buf))
                    .map_err(ConvertError::Encode)?;
            }
            OutputFormat::Avif => {
                DynamicImage::ImageRgba8(self.image.to_rgba8())
                    .write_with_encoder(AvifEncoder::new_with_speed_quality(
                        &mut buf, AVIF_SPEED, quality,
                    ))
                    .map_err(ConvertError::Encode)?;
            }
            OutputFormat::Tiff => {
                DynamicImage::ImageRgba8(self.image.to_rgba8())
                    .write_with_encoder(TiffEncoder::new(Cursor::new(&mut buf)))
                    .map_err(ConvertError::Encode)?;
            }
        }

        Ok(buf)
    }
}

/// One-shot conversion: decode, resize, encode.
pub fn convert(data: &[u8], options: &ConvertOptions) -> Result<Vec<u8>, ConvertError> {
    PreparedImage::decode(data, options.resize)?.encode(
        options.format,
        options.quality,
        options.background,
    )
}

/// [`convert`] on the blocking pool.
pub async fn convert_blocking(
    data: bytes::Bytes,
    options: ConvertOptions,
) -> Result<Vec<u8>, ConvertError> {
    tokio::task::spawn_blocking(move || convert(&data, &options)).await?
}

// Shrink to fit inside the requested box, keeping the aspect ratio. Never enlarges.
fn fit_inside(image: DynamicImage, resize: ResizeOptions) -> DynamicImage {
    if resize.width.is_none() && resize.height.is_none() {
        return image;
    }
    let max_w = resize.width.unwrap_or(u32::MAX);
    let max_h = resize.height.unwrap_or(u32::MAX);
    let (w, h) = image.dimensions();
    if w <= max_w && h <= max_h {
        return image;
    }
    image.resize(max_w, max_h, FilterType::Lanczos3)
}

// Composite over a solid background, dropping alpha
fn flatten(image: &DynamicImage, bg: Rgb<u8>) -> RgbImage {
    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, px) in rgba.enumerate_pixels() {
        let alpha = px[3] as u32;
        let blend = |fg: u8, back: u8| -> u8 {
            ((fg as u32 * alpha + back as u32 * (255 - alpha) + 127) / 255) as u8
        };
        out.put_pixel(
            x,
            y,
            Rgb([blend(px[0], bg[0]), blend(px[1], bg[1]), blend(px[2], bg[2])]),
        );
    }
    out
}
