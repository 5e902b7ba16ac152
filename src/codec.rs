//! Decode, encode, and pixel-cost helpers.
//!
//! All pixel work runs on blocking worker threads so neither the disk
//! I/O queue nor callback delivery ever stalls on a large decode.

use std::sync::Arc;

use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use crate::error::{ImageError, Result};

/// Memory-cache cost of an image: its pixel count.
#[must_use]
pub fn pixel_cost(image: &DynamicImage) -> u64 {
    u64::from(image.width()) * u64::from(image.height())
}

/// Returns whether the payload is an animated format.
///
/// Only GIF is treated as animated; the bundled codecs (PNG, JPEG, WebP)
/// decode stills.
#[must_use]
pub fn is_animated(data: &[u8]) -> bool {
    matches!(image::guess_format(data), Ok(ImageFormat::Gif))
}

/// Forces full pixel materialization so the first render is cheap.
#[must_use]
pub fn materialize(image: DynamicImage) -> DynamicImage {
    DynamicImage::ImageRgba8(image.into_rgba8())
}

/// Decodes image bytes on the caller's thread.
pub fn decode_blocking(data: &[u8], decompress: bool) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)
        .map_err(|e| ImageError::decode(format!("failed to decode image: {e}")))?;
    Ok(if decompress { materialize(image) } else { image })
}

/// Decodes image bytes on a blocking worker.
pub async fn decode(data: Bytes, decompress: bool) -> Result<Arc<DynamicImage>> {
    let decoded = tokio::task::spawn_blocking(move || decode_blocking(&data, decompress))
        .await
        .map_err(|e| ImageError::decode(format!("decode task panicked: {e}")))??;
    Ok(Arc::new(decoded))
}

/// Re-encodes an image to PNG, the crate's default persisted encoding,
/// on a blocking worker.
pub async fn encode_png(image: Arc<DynamicImage>) -> Result<Bytes> {
    let encoded = tokio::task::spawn_blocking(move || encode_png_blocking(&image))
        .await
        .map_err(|e| ImageError::decode(format!("encode task panicked: {e}")))??;
    Ok(encoded)
}

fn encode_png_blocking(image: &DynamicImage) -> Result<Bytes> {
    let mut buf = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| ImageError::decode(format!("failed to encode image: {e}")))?;
    Ok(Bytes::from(buf.into_inner()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_pixel_count() {
        let image = DynamicImage::new_rgb8(4, 3);
        assert_eq!(pixel_cost(&image), 12);
    }

    #[test]
    fn decode_round_trips_png() {
        let data = testing::png_bytes(5, 7);
        let decoded = decode_blocking(&data, false).expect("valid png");
        assert_eq!((decoded.width(), decoded.height()), (5, 7));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = decode_blocking(b"definitely not an image", false).unwrap_err();
        assert!(matches!(err, ImageError::Decode { .. }));
    }

    #[test]
    fn materialize_preserves_dimensions() {
        let image = materialize(DynamicImage::new_rgb8(3, 2));
        assert_eq!((image.width(), image.height()), (3, 2));
    }

    #[test]
    fn gif_magic_is_animated() {
        assert!(is_animated(b"GIF89a\x01\x00\x01\x00"));
        assert!(!is_animated(&testing::png_bytes(1, 1)));
    }
}
