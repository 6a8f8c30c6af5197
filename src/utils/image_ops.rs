use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Raster encoding for patches and the final composite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossy, quality 1-100
    Jpeg { quality: u8 },
    /// Lossless
    Png,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Jpeg { .. } => "jpg",
            OutputFormat::Png => "png",
        }
    }
}

/// Encode an RGBA image in the requested format.
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_image(img: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Jpeg { quality } => {
            let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(&rgb)?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        }
    }
    Ok(bytes)
}

/// Decode raw bytes (JPEG/PNG/BMP) into RGBA
pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Read only the header to confirm the bytes are a decodable image
pub fn probe_dimensions(bytes: &[u8]) -> Result<(u32, u32), image::ImageError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .into_dimensions()
}

/// Asynchronously decode an image using spawn_blocking.
///
/// Image decoding is CPU-intensive, especially for large scans.
pub async fn decode_rgba_async(bytes: Vec<u8>) -> Result<Result<RgbaImage, image::ImageError>> {
    tokio::task::spawn_blocking(move || decode_rgba(&bytes))
        .await
        .context("Failed to spawn blocking task for image decoding")
}

/// Asynchronously encode an image using spawn_blocking.
pub async fn encode_image_async(
    img: RgbaImage,
    format: OutputFormat,
) -> Result<Result<Vec<u8>, image::ImageError>> {
    tokio::task::spawn_blocking(move || encode_image(&img, format))
        .await
        .context("Failed to spawn blocking task for image encoding")
}
