//! Image format tables and upload validation.

use std::fmt;

use image::Rgb;
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

/// Upload cap applied when nothing else is configured (50 MB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

lazy_static! {
    static ref HEX_COLOR: Regex = Regex::new(r"^#([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})([0-9A-Fa-f]{2})$").unwrap();
}

/// Rejections reported to the caller as 400s.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("No file provided")]
    NoFile,
    #[error("File size must be less than {limit_mb}MB")]
    TooLarge { limit_mb: usize },
    #[error("File must be an image")]
    NotAnImage,
    #[error("Unsupported image format")]
    UnsupportedInput,
    #[error("Output format is required")]
    MissingFormat,
    #[error("Unsupported output format")]
    UnsupportedOutput,
    #[error("Quality must be a whole number between 1 and 100")]
    InvalidQuality,
    #[error("{0} must be a positive whole number")]
    InvalidDimension(&'static str),
    #[error("Background color must be a 6-digit hex value such as #ffffff")]
    InvalidBackground,
    #[error("Conversion format is required")]
    MissingConversion,
    #[error("Please enter a valid target size")]
    InvalidTarget,
    #[error("Target size must be smaller than original size")]
    TargetNotSmaller,
}

/// Formats the converter accepts as input, keyed by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Jpeg,
    Png,
    Webp,
    Tiff,
    Gif,
    Bmp,
}

impl InputFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "tif" | "tiff" => Some(Self::Tiff),
            "gif" => Some(Self::Gif),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        extension(name).and_then(Self::from_extension)
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Tiff => "image/tiff",
            Self::Gif => "image/gif",
            Self::Bmp => "image/bmp",
        }
    }
}

/// Formats the converter can encode to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Webp,
    Avif,
    Tiff,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 5] = [
        OutputFormat::Jpeg,
        OutputFormat::Png,
        OutputFormat::Webp,
        OutputFormat::Avif,
        OutputFormat::Tiff,
    ];

    pub fn parse(code: &str) -> Option<Self> {
        match code.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            "avif" => Some(Self::Avif),
            "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    // Format used when shrinking an upload to a target size
    pub fn for_reduction(source_name: &str) -> Self {
        match InputFormat::from_file_name(source_name) {
            Some(InputFormat::Png) => Self::Png,
            Some(InputFormat::Webp) => Self::Webp,
            _ => Self::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Avif => "avif",
            Self::Tiff => "tiff",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
            Self::Avif => "image/avif",
            Self::Tiff => "image/tiff",
        }
    }

    /// Whether the encoder exposes a quality knob for this format.
    ///
    /// PNG, TIFF and WebP are written losslessly, so a quality value has no
    /// effect on their size. The `image` crate has no lossy WebP encoder,
    /// which makes a `.webp` reduction a single encode.
    pub fn has_quality_axis(self) -> bool {
        matches!(self, Self::Jpeg | Self::Avif)
    }

    pub fn default_quality(self) -> Option<u8> {
        match self {
            Self::Jpeg => Some(90),
            Self::Avif => Some(80),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

pub fn extension(file_name: &str) -> Option<&str> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

pub fn check_size(len: usize, max_bytes: usize) -> Result<(), ValidationError> {
    if len > max_bytes {
        return Err(ValidationError::TooLarge {
            limit_mb: max_bytes / (1024 * 1024),
        });
    }
    Ok(())
}

/// Validate an uploaded image the way the upload form does: size cap,
/// `image/*` content type when one is declared, and a known extension.
pub fn validate_image_upload(
    file_name: &str,
    content_type: Option<&str>,
    len: usize,
    max_bytes: usize,
) -> Result<InputFormat, ValidationError> {
    check_size(len, max_bytes)?;

    if let Some(ct) = content_type {
        if !ct.starts_with("image/") {
            return Err(ValidationError::NotAnImage);
        }
    }

    InputFormat::from_file_name(file_name).ok_or(ValidationError::UnsupportedInput)
}

pub fn parse_quality(raw: &str) -> Result<u8, ValidationError> {
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|q| (1..=100).contains(q))
        .ok_or(ValidationError::InvalidQuality)
}

pub fn parse_dimension(raw: &str, field: &'static str) -> Result<u32, ValidationError> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|v| *v > 0)
        .ok_or(ValidationError::InvalidDimension(field))
}

pub fn parse_hex_color(raw: &str) -> Result<Rgb<u8>, ValidationError> {
    let caps = HEX_COLOR
        .captures(raw.trim())
        .ok_or(ValidationError::InvalidBackground)?;
    let channel = |i: usize| {
        u8::from_str_radix(&caps[i], 16).map_err(|_| ValidationError::InvalidBackground)
    };
    Ok(Rgb([channel(1)?, channel(2)?, channel(3)?]))
}

/// Human readable byte count, e.g. `1.5 MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}
