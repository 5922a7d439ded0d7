//! Cover art processing for embedding
//!
//! Embedded covers are normalized to a square JPEG:
//! - scaled to cover the target square, center-cropped (no letterboxing)
//! - encoded as baseline JPEG
//!
//! Sidecar covers are written as fetched; only their extension is chosen here.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::debug;

use crate::error::{Result, WorkerError};

/// Decode, cover-fit to `size`×`size` and re-encode as JPEG
pub fn process_cover_art(data: &[u8], size: u32, quality: u8) -> Result<Vec<u8>> {
    let img = ImageReader::new(Cursor::new(data))
        .with_guessed_format()
        .map_err(|e| WorkerError::tag(format!("Failed to guess cover format: {}", e)))?
        .decode()
        .map_err(|e| WorkerError::tag(format!("Failed to decode cover art: {}", e)))?;

    let img = cover_fit(img, size);

    let mut output = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut output, quality);
    encoder
        .encode_image(&img.to_rgb8())
        .map_err(|e| WorkerError::tag(format!("Failed to encode cover art as JPEG: {}", e)))?;

    debug!(
        "Processed cover art: {}x{} -> {} bytes (quality {})",
        img.width(),
        img.height(),
        output.len(),
        quality
    );
    Ok(output)
}

/// Scale so the image covers a `size` square, then crop the center
fn cover_fit(img: DynamicImage, size: u32) -> DynamicImage {
    if img.width() == size && img.height() == size {
        return img;
    }

    debug!(
        "Resizing cover art: {}x{} -> {}x{}",
        img.width(),
        img.height(),
        size,
        size
    );

    img.resize_to_fill(size, size, FilterType::Lanczos3)
}

/// Mime type of image bytes, judged by their magic number
pub fn sniff_mime(data: &[u8]) -> Option<&'static str> {
    match image::guess_format(data).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Gif => Some("image/gif"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Bmp => Some("image/bmp"),
        _ => None,
    }
}

/// Sidecar extension for an image mime type: `png`, otherwise `jpg`
pub fn sidecar_extension(mime: &str) -> &'static str {
    if mime.trim().to_ascii_lowercase().starts_with("image/png") {
        "png"
    } else {
        "jpg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgb8(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_cover_fit_wide_image() {
        let img = DynamicImage::new_rgb8(1500, 1000);
        let resized = cover_fit(img, 512);
        assert_eq!(resized.width(), 512);
        assert_eq!(resized.height(), 512);
    }

    #[test]
    fn test_cover_fit_small_image_upscales() {
        let img = DynamicImage::new_rgb8(100, 80);
        let resized = cover_fit(img, 512);
        assert_eq!((resized.width(), resized.height()), (512, 512));
    }

    #[test]
    fn test_process_cover_art_outputs_square_jpeg() {
        let jpeg = process_cover_art(&png_bytes(800, 600), 512, 90).unwrap();
        assert_eq!(sniff_mime(&jpeg), Some("image/jpeg"));
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (512, 512));
    }

    #[test]
    fn test_process_garbage_is_tag_error() {
        let err = process_cover_art(b"not an image", 512, 90).unwrap_err();
        assert!(matches!(err, WorkerError::TagError(_)));
    }

    #[test]
    fn test_sidecar_extension() {
        assert_eq!(sidecar_extension("image/png"), "png");
        assert_eq!(sidecar_extension("image/jpeg"), "jpg");
        assert_eq!(sidecar_extension(""), "jpg");
        assert_eq!(sniff_mime(&png_bytes(4, 4)), Some("image/png"));
    }
}
