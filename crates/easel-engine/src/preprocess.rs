use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};

use easel_contracts::runs::request::{PreparedInputImage, SUPPORTED_INPUT_MIME_TYPES};

use crate::error::RunError;

pub const DEFAULT_UPLOAD_CEILING: u64 = 8 * 1024 * 1024;
pub const DEFAULT_MAX_DIMENSION: u32 = 2048;

/// JPEG qualities tried in order when the image carries no meaningful alpha.
const JPEG_QUALITIES: &[u8] = &[90, 80, 68];

/// Shrink factors applied to the dimension cap, largest first.
const SCALE_FACTORS: &[f64] = &[1.0, 0.75, 0.5, 0.35];

/// Normalizes arbitrary input images into upload-ready, size-bounded bytes.
///
/// Inputs that already satisfy both the byte ceiling and the dimension cap
/// pass through untouched. Inputs that decode but violate a constraint are
/// re-encoded down a candidate ladder (lossy first without alpha, lossless
/// last) at shrinking scales until one fits. Inputs that do not decode are
/// accepted as-is only when already under the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct InputImagePreprocessor {
    upload_ceiling: u64,
    max_dimension: u32,
}

impl InputImagePreprocessor {
    pub fn new(upload_ceiling: u64, max_dimension: u32) -> Self {
        Self {
            upload_ceiling,
            max_dimension: max_dimension.max(64),
        }
    }

    pub fn prepare(&self, bytes: Vec<u8>, claimed_mime: &str) -> Result<PreparedInputImage> {
        let mime = normalize_mime(claimed_mime);
        if !SUPPORTED_INPUT_MIME_TYPES.contains(&mime.as_str()) {
            return Err(
                RunError::Validation(format!("unsupported input image type '{claimed_mime}'"))
                    .into(),
            );
        }

        let Ok(image) = image::load_from_memory(&bytes) else {
            if bytes.len() as u64 <= self.upload_ceiling {
                return Ok(PreparedInputImage::from_bytes(bytes, mime));
            }
            return Err(RunError::Validation(format!(
                "input image is {} bytes, over the {} byte upload ceiling, and could not be \
                 decoded for recompression",
                bytes.len(),
                self.upload_ceiling
            ))
            .into());
        };

        let longest = image.width().max(image.height());
        if bytes.len() as u64 <= self.upload_ceiling && longest <= self.max_dimension {
            return Ok(PreparedInputImage::from_bytes(bytes, mime));
        }

        let rgba = image.to_rgba8();
        let has_alpha = has_meaningful_alpha(&rgba);
        let bound = longest.min(self.max_dimension);

        for scale in SCALE_FACTORS {
            let target = ((f64::from(bound) * scale) as u32).max(16);
            let resized = image.resize(target, target, FilterType::Triangle);

            if !has_alpha {
                for quality in JPEG_QUALITIES {
                    let encoded = encode_jpeg(&resized, *quality)?;
                    if encoded.len() as u64 <= self.upload_ceiling {
                        return Ok(PreparedInputImage::from_bytes(encoded, "image/jpeg"));
                    }
                }
            }
            let encoded = encode_png(&resized)?;
            if encoded.len() as u64 <= self.upload_ceiling {
                return Ok(PreparedInputImage::from_bytes(encoded, "image/png"));
            }
        }

        Err(RunError::Validation(format!(
            "input image could not be compressed under the {} byte upload ceiling",
            self.upload_ceiling
        ))
        .into())
    }
}

impl Default for InputImagePreprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_CEILING, DEFAULT_MAX_DIMENSION)
    }
}

fn normalize_mime(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered == "image/jpg" {
        return "image/jpeg".to_string();
    }
    lowered
}

/// Sparse sample of up to ~64x64 positions; any translucent pixel counts.
fn has_meaningful_alpha(rgba: &RgbaImage) -> bool {
    let (width, height) = rgba.dimensions();
    let step_x = (width / 64).max(1) as usize;
    let step_y = (height / 64).max(1) as usize;
    for y in (0..height).step_by(step_y) {
        for x in (0..width).step_by(step_x) {
            if rgba.get_pixel(x, y)[3] < 0xF0 {
                return true;
            }
        }
    }
    false
}

fn encode_jpeg(image: &DynamicImage, quality: u8) -> Result<Vec<u8>> {
    let rgba = image.to_rgba8();
    let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(
            x,
            y,
            Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
        );
    }
    let rgb = DynamicImage::ImageRgba8(flattened).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(bytes)
}

fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(
        &mut std::io::Cursor::new(&mut bytes),
        image::ImageFormat::Png,
    )?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use sha2::{Digest, Sha256};

    use crate::error::RunError;

    use super::InputImagePreprocessor;

    fn png_bytes(image: RgbaImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .expect("png encode");
        bytes
    }

    fn noise_image(width: u32, height: u32, alpha: u8) -> RgbaImage {
        let mut state: u32 = 0x1234_5678;
        let mut next = move || {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        };
        let mut image = RgbaImage::new(width, height);
        for pixel in image.pixels_mut() {
            *pixel = Rgba([next(), next(), next(), alpha]);
        }
        image
    }

    fn assert_validation(err: &anyhow::Error) {
        assert!(matches!(
            RunError::from_anyhow(err),
            Some(RunError::Validation(_))
        ));
    }

    #[test]
    fn rejects_unsupported_mime_types() {
        let pre = InputImagePreprocessor::default();
        let err = pre
            .prepare(vec![0u8; 16], "image/tiff")
            .expect_err("tiff must be rejected");
        assert_validation(&err);
    }

    #[test]
    fn small_images_pass_through_unchanged() -> anyhow::Result<()> {
        let pre = InputImagePreprocessor::new(1024 * 1024, 2048);
        let original = png_bytes(noise_image(32, 32, 255));
        let prepared = pre.prepare(original.clone(), "image/png")?;
        assert_eq!(prepared.bytes(), original.as_slice());
        assert_eq!(prepared.mime_type(), "image/png");

        let mut hasher = Sha256::new();
        hasher.update(prepared.bytes());
        assert_eq!(prepared.digest(), hex::encode(hasher.finalize()));
        Ok(())
    }

    #[test]
    fn oversized_bytes_are_recompressed_under_the_ceiling() -> anyhow::Result<()> {
        let ceiling = 100 * 1024;
        let pre = InputImagePreprocessor::new(ceiling, 2048);
        let original = png_bytes(noise_image(256, 256, 255));
        assert!(original.len() as u64 > ceiling, "noise png should be large");

        let prepared = pre.prepare(original, "image/png")?;
        assert!(prepared.byte_size() <= ceiling);
        assert_eq!(prepared.mime_type(), "image/jpeg");
        Ok(())
    }

    #[test]
    fn dimension_cap_triggers_transcode() -> anyhow::Result<()> {
        let pre = InputImagePreprocessor::new(1024 * 1024, 128);
        let original = png_bytes(noise_image(512, 256, 255));
        let prepared = pre.prepare(original, "image/png")?;

        let decoded = image::load_from_memory(prepared.bytes())?;
        assert!(decoded.width().max(decoded.height()) <= 128);
        Ok(())
    }

    #[test]
    fn alpha_images_stay_lossless() -> anyhow::Result<()> {
        let pre = InputImagePreprocessor::new(1024 * 1024, 64);
        let original = png_bytes(noise_image(256, 256, 128));
        let prepared = pre.prepare(original, "image/png")?;
        assert_eq!(prepared.mime_type(), "image/png");
        Ok(())
    }

    #[test]
    fn fails_when_no_candidate_fits() {
        let pre = InputImagePreprocessor::new(10, 2048);
        let original = png_bytes(noise_image(256, 256, 255));
        let err = pre
            .prepare(original, "image/png")
            .expect_err("nothing fits a 10 byte ceiling");
        assert_validation(&err);
    }

    #[test]
    fn undecodable_bytes_pass_only_under_the_ceiling() {
        let pre = InputImagePreprocessor::new(64, 2048);
        let prepared = pre
            .prepare(vec![7u8; 32], "image/png")
            .expect("small undecodable input passes as-is");
        assert_eq!(prepared.byte_size(), 32);

        let err = pre
            .prepare(vec![7u8; 128], "image/png")
            .expect_err("oversized undecodable input must fail");
        assert_validation(&err);
    }
}
