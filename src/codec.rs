//! Image decode/encode and format sniffing (spec §3/§4.4).
//!
//! Decoding, scale derivation, and PNG/JPEG encoding are "called as pure
//! functions on bytes" per spec §1 --- this module is the thin,
//! intentionally boring adapter around the `image` crate that provides
//! those functions; no cache-aware logic lives here.

use std::sync::Arc;

use image::{DynamicImage, GenericImageView, ImageFormat};

/// Raw encoded bytes as received from the downloader or read from disk.
pub type ImageBytes = Vec<u8>;

/// The 8-byte PNG signature every PNG file starts with.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Returns true when `data` begins with the PNG signature.
pub fn sniff_png(data: &[u8]) -> bool {
    data.len() >= PNG_SIGNATURE.len() && data[..PNG_SIGNATURE.len()] == PNG_SIGNATURE
}

/// A decoded, in-memory image. Cheaply clonable: the pixel buffer is
/// behind an `Arc` so memory-tier hits don't copy pixels.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    inner: Arc<DynamicImage>,
    scale: f64,
    animated: bool,
}

impl DecodedImage {
    fn from_dynamic(inner: DynamicImage, scale: f64, animated: bool) -> Self {
        Self { inner: Arc::new(inner), scale, animated }
    }

    /// Pixel width (not scaled).
    pub fn width(&self) -> u32 {
        self.inner.dimensions().0
    }

    /// Pixel height (not scaled).
    pub fn height(&self) -> u32 {
        self.inner.dimensions().1
    }

    /// Display scale factor (e.g. 2.0 for a "@2x" asset). Defaults to 1.0.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Whether the decoded image carries an alpha channel.
    pub fn has_alpha(&self) -> bool {
        self.inner.color().has_alpha()
    }

    /// Whether the source bytes encoded more than one frame.
    pub fn is_animated(&self) -> bool {
        self.animated
    }

    /// `CacheCost(img)` per spec §3: `width * height * scale^2`, used as
    /// the memory tier's eviction weight.
    pub fn cache_cost(&self) -> u64 {
        let (width, height) = self.inner.dimensions();
        let scaled = (width as f64) * (height as f64) * self.scale * self.scale;
        scaled.round().max(0.0) as u64
    }

    pub(crate) fn dynamic(&self) -> &DynamicImage {
        &self.inner
    }

    /// Whether `self` and `other` share the same underlying pixel
    /// buffer --- used by the manager to decide whether a transform
    /// delegate actually changed anything (spec §4.5: `recalculate =
    /// (transformed != original)`).
    pub fn same_as(&self, other: &DecodedImage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Inverts each channel of the RGB(A) pixel buffer, preserving
    /// alpha and scale/animated metadata. A deliberately simple stand-in
    /// transform for tests exercising the manager's transform path.
    pub fn inverted(&self) -> Self {
        let mut dynamic = (*self.inner).clone();
        dynamic.invert();
        Self { inner: Arc::new(dynamic), scale: self.scale, animated: self.animated }
    }
}

/// Decodes `bytes` into a [`DecodedImage`], deriving `scale` from the
/// key's filename convention (`name@2x.ext` ⇒ 2.0, `name@3x.ext` ⇒ 3.0,
/// else 1.0) and the animated marker from a frame-count sniff performed
/// on the raw bytes ahead of the full decode (GIF/animated PNG only;
/// both are represented as >1 frame by the `image` crate's decoders for
/// the formats this cache persists).
pub fn decode_image(bytes: &[u8], key: &str) -> Result<DecodedImage, image::ImageError> {
    let format = image::guess_format(bytes)?;
    let animated = sniff_animated(bytes, format);
    let dynamic = image::load_from_memory_with_format(bytes, format)?;
    let scale = scale_for_key(key);
    Ok(DecodedImage::from_dynamic(dynamic, scale, animated))
}

/// Applies the "decompress for display" step spec §4.4 describes for
/// disk-tier hits. The `image` crate always decodes into an in-memory
/// pixel buffer eagerly, so when `enabled` there is nothing further to
/// materialize; the flag is honored for API-compatibility with decoders
/// that support a lazy/compressed in-memory representation.
pub fn decompress_for_display(image: DecodedImage, _enabled: bool) -> DecodedImage {
    image
}

fn sniff_animated(bytes: &[u8], format: ImageFormat) -> bool {
    match format {
        ImageFormat::Gif => image::codecs::gif::GifDecoder::new(std::io::Cursor::new(bytes))
            .map(|decoder| {
                use image::AnimationDecoder;
                decoder.into_frames().take(2).count() > 1
            })
            .unwrap_or(false),
        _ => false,
    }
}

fn scale_for_key(key: &str) -> f64 {
    let stem = key.split(['?', '#']).next().unwrap_or(key);
    for (suffix, scale) in [("@3x", 3.0), ("@2x", 2.0)] {
        if stem.contains(suffix) {
            return scale;
        }
    }
    1.0
}

/// Re-encodes `image` as PNG bytes.
pub fn encode_png(image: &DecodedImage) -> Result<ImageBytes, image::ImageError> {
    let mut out = Vec::new();
    image.dynamic().write_to(&mut std::io::Cursor::new(&mut out), ImageFormat::Png)?;
    Ok(out)
}

/// Re-encodes `image` as JPEG bytes at the given quality (0-100).
pub fn encode_jpeg(image: &DecodedImage, quality: u8) -> Result<ImageBytes, image::ImageError> {
    let mut out = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality);
    image.dynamic().write_with_encoder(encoder)?;
    Ok(out)
}

/// Bytes-selection rule from spec §4.4: decides what to persist to disk
/// for a `store()` call.
///
/// 1. Caller-supplied `data` wins verbatim when `recalculate` is false.
/// 2. Otherwise sniff: supplied `data` beginning with the PNG signature
///    re-encodes as PNG; absent `data` falls back to the image's own
///    alpha-channel presence (alpha ⇒ PNG, no alpha ⇒ JPEG).
pub fn bytes_to_persist(
    image: &DecodedImage,
    data: Option<&[u8]>,
    recalculate: bool,
) -> Result<ImageBytes, image::ImageError> {
    if let (Some(data), false) = (data, recalculate) {
        return Ok(data.to_vec());
    }

    if let Some(data) = data {
        if sniff_png(data) {
            return encode_png(image);
        }
    }

    if image.has_alpha() {
        encode_png(image)
    } else {
        encode_jpeg(image, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rgba(width: u32, height: u32) -> DecodedImage {
        let buffer = image::RgbaImage::from_pixel(width, height, image::Rgba([10, 20, 30, 255]));
        DecodedImage::from_dynamic(DynamicImage::ImageRgba8(buffer), 1.0, false)
    }

    fn solid_rgb(width: u32, height: u32) -> DecodedImage {
        let buffer = image::RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30]));
        DecodedImage::from_dynamic(DynamicImage::ImageRgb8(buffer), 1.0, false)
    }

    #[test]
    fn sniff_png_matches_signature() {
        let png_bytes = encode_png(&solid_rgba(2, 2)).unwrap();
        assert!(sniff_png(&png_bytes));
        assert!(!sniff_png(b"not a png"));
        assert!(!sniff_png(b"\x89PNG"));
    }

    #[test]
    fn cache_cost_scales_with_scale_factor_squared() {
        let image = solid_rgba(10, 20);
        assert_eq!(image.cache_cost(), 200);
    }

    #[test]
    fn bytes_to_persist_uses_supplied_data_verbatim() {
        let image = solid_rgba(4, 4);
        let data = b"caller-provided-bytes".to_vec();
        let persisted = bytes_to_persist(&image, Some(&data), false).unwrap();
        assert_eq!(persisted, data);
    }

    #[test]
    fn bytes_to_persist_re_encodes_png_when_data_sniffs_as_png() {
        let image = solid_rgba(3, 3);
        let png_bytes = encode_png(&image).unwrap();
        let persisted = bytes_to_persist(&image, Some(&png_bytes), true).unwrap();
        assert!(sniff_png(&persisted));
    }

    #[test]
    fn bytes_to_persist_without_data_follows_alpha_presence() {
        let with_alpha = solid_rgba(3, 3);
        let persisted = bytes_to_persist(&with_alpha, None, true).unwrap();
        assert!(sniff_png(&persisted));

        let without_alpha = solid_rgb(3, 3);
        let persisted = bytes_to_persist(&without_alpha, None, true).unwrap();
        assert!(!sniff_png(&persisted));
    }

    #[test]
    fn decode_image_round_trips_dimensions() {
        let original = solid_rgba(16, 9);
        let bytes = encode_png(&original).unwrap();
        let decoded = decode_image(&bytes, "https://h/x.png").unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 9);
        assert!(decoded.has_alpha());
    }

    #[test]
    fn decode_image_derives_scale_from_key_suffix() {
        let bytes = encode_png(&solid_rgba(4, 4)).unwrap();
        let decoded = decode_image(&bytes, "https://h/icon@2x.png").unwrap();
        assert_eq!(decoded.scale(), 2.0);
    }
}
