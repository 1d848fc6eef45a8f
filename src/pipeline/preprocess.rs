//! Image normalization: arbitrary decoded image -> canonical model input.
//!
//! Pure image-to-image transform. No I/O, no model calls.
//!
//! Steps, in order:
//! 1. Channel fix: 1 -> replicated to RGB, 3 -> as-is, 4 -> alpha dropped,
//!    anything else -> `UnsupportedChannelCount`.
//! 2. Orientation: EXIF 3 -> 180deg, 6 -> 90deg CW, 8 -> 90deg CCW, else none.
//! 3. Contrast x1.2 around the mean luminance.
//! 4. Minimum side floor of 32 px (each side raised independently).
//! 5. Center square crop on the shorter side.
//! 6. Bicubic resize to the model input size.
//!
//! Contrast is applied on every call. Running `normalize` on its own output
//! keeps the geometry but raises contrast again.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, RgbImage};
use tracing::debug;

use super::encode::ModelInput;
use super::PreprocessError;

// ═══════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════

/// Square side of the classifier input.
pub const MODEL_INPUT_SIZE: u32 = 160;

/// Fixed contrast multiplier. Not configurable per request.
pub const CONTRAST_FACTOR: f32 = 1.2;

/// Shorter sides below this are upscaled before cropping.
pub const MIN_SIDE: u32 = 32;

/// Maximum encoded image size (in bytes) before rejecting.
/// Prevents OOM on corrupt/adversarial files.
pub const MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024; // 50 MB

/// Catmull-Rom is the bicubic (a = -0.5) kernel.
const BICUBIC: FilterType = FilterType::CatmullRom;

// ═══════════════════════════════════════════════════════════
// Data types
// ═══════════════════════════════════════════════════════════

/// A decoded image before normalization: interleaved 8-bit samples with
/// 1 to 4 channels, plus the capture orientation hint if one was embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    width: u32,
    height: u32,
    channels: u8,
    pixels: Vec<u8>,
    orientation: Option<u32>,
}

impl RawImage {
    /// Build from interleaved samples. The channel count is checked later,
    /// by `normalize`, so callers can still represent e.g. grey+alpha input.
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        pixels: Vec<u8>,
    ) -> Result<Self, PreprocessError> {
        if width == 0 || height == 0 {
            return Err(PreprocessError::ZeroArea { width, height });
        }
        let expected = width as usize * height as usize * channels as usize;
        if pixels.len() != expected {
            return Err(PreprocessError::BufferSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            pixels,
            orientation: None,
        })
    }

    pub fn with_orientation(mut self, orientation: Option<u32>) -> Self {
        self.orientation = orientation;
        self
    }

    /// Decode encoded bytes (PNG, JPEG, TIFF, BMP) and read the EXIF
    /// orientation. Missing or unreadable EXIF means no hint.
    pub fn decode(bytes: &[u8]) -> Result<Self, PreprocessError> {
        validate_image_bytes(bytes)?;
        let img = image::load_from_memory(bytes)
            .map_err(|e| PreprocessError::Decode(e.to_string()))?;
        let orientation = read_exif_orientation(bytes);
        Self::from_dynamic(img, orientation)
    }

    /// Convert a decoded image, keeping its channel count. 16-bit samples
    /// are reduced to 8 bits.
    pub fn from_dynamic(
        img: DynamicImage,
        orientation: Option<u32>,
    ) -> Result<Self, PreprocessError> {
        let (width, height) = img.dimensions();
        let channels = img.color().channel_count();
        let pixels = match channels {
            1 => img.to_luma8().into_raw(),
            2 => img.to_luma_alpha8().into_raw(),
            3 => img.to_rgb8().into_raw(),
            4 => img.to_rgba8().into_raw(),
            other => return Err(PreprocessError::UnsupportedChannelCount(other)),
        };
        Ok(Self::new(width, height, channels, pixels)?.with_orientation(orientation))
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn orientation(&self) -> Option<u32> {
        self.orientation
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

impl From<CanonicalImage> for RawImage {
    fn from(canonical: CanonicalImage) -> Self {
        let image = canonical.into_inner();
        Self {
            width: image.width(),
            height: image.height(),
            channels: 3,
            pixels: image.into_raw(),
            orientation: None,
        }
    }
}

/// Fixed-geometry RGB image ready for encoding.
///
/// Invariant: `width == height == size` and 3 channels. Only
/// `Preprocessor` implementations construct it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    image: RgbImage,
}

impl CanonicalImage {
    fn new(image: RgbImage) -> Self {
        debug_assert_eq!(image.width(), image.height());
        Self { image }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn size(&self) -> u32 {
        self.image.width()
    }

    pub fn into_inner(self) -> RgbImage {
        self.image
    }
}

impl ModelInput for CanonicalImage {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn channel_count(&self) -> usize {
        3
    }

    fn samples(&self) -> &[u8] {
        self.image.as_raw()
    }
}

// ═══════════════════════════════════════════════════════════
// Preprocessor
// ═══════════════════════════════════════════════════════════

/// Maps a raw image to the canonical model input.
pub trait Preprocessor: Send + Sync {
    fn normalize(&self, raw: &RawImage) -> Result<CanonicalImage, PreprocessError>;
}

/// The production normalization chain.
#[derive(Debug, Clone)]
pub struct CanonicalPreprocessor {
    target_size: u32,
}

impl CanonicalPreprocessor {
    pub fn new(target_size: u32) -> Self {
        Self { target_size }
    }

    pub fn target_size(&self) -> u32 {
        self.target_size
    }
}

impl Default for CanonicalPreprocessor {
    fn default() -> Self {
        Self::new(MODEL_INPUT_SIZE)
    }
}

impl Preprocessor for CanonicalPreprocessor {
    fn normalize(&self, raw: &RawImage) -> Result<CanonicalImage, PreprocessError> {
        // 1. Channel fix
        let rgb = to_rgb(raw)?;

        // 2. Orientation
        let rgb = apply_orientation(rgb, raw.orientation());

        // 3. Contrast
        let rgb = enhance_contrast(&rgb, CONTRAST_FACTOR);

        // 4. Minimum-size floor
        let rgb = enforce_min_side(rgb, MIN_SIDE);

        // 5. Center square crop
        let square = center_square_crop(&rgb);

        // 6. Resize to model input
        let side = self.target_size;
        let resized = if square.width() == side {
            square
        } else {
            image::imageops::resize(&square, side, side, BICUBIC)
        };

        debug!(
            original = format!("{}x{}x{}", raw.width(), raw.height(), raw.channels()),
            orientation = raw.orientation().unwrap_or(1),
            cropped = square_side(&rgb),
            output = format!("{side}x{side}"),
            "Image normalized"
        );

        Ok(CanonicalImage::new(resized))
    }
}

/// Convenience wrapper around `CanonicalPreprocessor`.
pub fn normalize(raw: &RawImage, target_size: u32) -> Result<CanonicalImage, PreprocessError> {
    CanonicalPreprocessor::new(target_size).normalize(raw)
}

// ═══════════════════════════════════════════════════════════
// Steps
// ═══════════════════════════════════════════════════════════

/// Convert to 3-channel RGB. Grey is replicated, alpha is dropped.
pub fn to_rgb(raw: &RawImage) -> Result<RgbImage, PreprocessError> {
    let (w, h) = (raw.width(), raw.height());
    let samples = raw.pixels();
    let rgb: Vec<u8> = match raw.channels() {
        1 => samples.iter().flat_map(|&v| [v, v, v]).collect(),
        3 => samples.to_vec(),
        4 => samples
            .chunks_exact(4)
            .flat_map(|p| [p[0], p[1], p[2]])
            .collect(),
        other => return Err(PreprocessError::UnsupportedChannelCount(other)),
    };
    let expected = w as usize * h as usize * 3;
    let actual = rgb.len();
    ImageBuffer::from_raw(w, h, rgb).ok_or(PreprocessError::BufferSize { expected, actual })
}

/// Read EXIF orientation tag (0x0112) from raw image bytes.
/// Returns `None` if there is no EXIF data or no orientation tag.
pub fn read_exif_orientation(bytes: &[u8]) -> Option<u32> {
    let mut cursor = Cursor::new(bytes);
    let reader = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    reader
        .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|f| f.value.get_uint(0))
}

/// Undo the capture rotation named by an orientation hint.
///
/// 3 -> 180deg; 6 -> 90deg clockwise (270deg counter-clockwise);
/// 8 -> 90deg counter-clockwise. Mirrored orientations (2, 4, 5, 7) and
/// unknown values are left untouched.
pub fn apply_orientation(img: RgbImage, orientation: Option<u32>) -> RgbImage {
    match orientation {
        Some(3) => image::imageops::rotate180(&img),
        Some(6) => image::imageops::rotate90(&img),
        Some(8) => image::imageops::rotate270(&img),
        _ => img,
    }
}

/// Mean luminance, rounded to the nearest integer.
///
/// ITU-R BT.601 weights in 16.16 fixed point, matching the usual 8-bit
/// RGB -> L conversion.
pub fn mean_luminance(img: &RgbImage) -> u8 {
    let pixel_count = img.width() as u64 * img.height() as u64;
    if pixel_count == 0 {
        return 0;
    }
    let total: u64 = img
        .pixels()
        .map(|p| {
            let [r, g, b] = p.0;
            (r as u64 * 19595 + g as u64 * 38470 + b as u64 * 7471 + 0x8000) >> 16
        })
        .sum();
    let mean = total as f64 / pixel_count as f64;
    (mean + 0.5).floor().min(255.0) as u8
}

/// Scale every sample's distance from the mean luminance by `factor`.
///
/// `out = mean + factor * (v - mean)`, clipped to `[0, 255]` and truncated.
pub fn enhance_contrast(img: &RgbImage, factor: f32) -> RgbImage {
    let mean = mean_luminance(img) as f32;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        for v in p.0.iter_mut() {
            let t = mean + factor * (*v as f32 - mean);
            *v = if t <= 0.0 {
                0
            } else if t >= 255.0 {
                255
            } else {
                t as u8
            };
        }
    }
    out
}

/// Raise each side to at least `min_side` pixels (bicubic).
/// Sides are scaled independently; images already large enough pass through.
pub fn enforce_min_side(img: RgbImage, min_side: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    if w.min(h) >= min_side {
        return img;
    }
    let (new_w, new_h) = (w.max(min_side), h.max(min_side));
    debug!(
        from = format!("{w}x{h}"),
        to = format!("{new_w}x{new_h}"),
        "Upscaling undersized image"
    );
    image::imageops::resize(&img, new_w, new_h, BICUBIC)
}

/// Crop the centered square whose side is the shorter image side.
pub fn center_square_crop(img: &RgbImage) -> RgbImage {
    let (w, h) = img.dimensions();
    let side = w.min(h);
    if w == h {
        return img.clone();
    }
    let left = (w - side) / 2;
    let top = (h - side) / 2;
    image::imageops::crop_imm(img, left, top, side, side).to_image()
}

fn square_side(img: &RgbImage) -> u32 {
    img.width().min(img.height())
}

/// Validate encoded bytes before decoding.
pub fn validate_image_bytes(bytes: &[u8]) -> Result<(), PreprocessError> {
    if bytes.is_empty() {
        return Err(PreprocessError::EmptyImage);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(PreprocessError::ImageTooLarge {
            size: bytes.len(),
            limit_mb: MAX_IMAGE_BYTES / (1024 * 1024),
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
