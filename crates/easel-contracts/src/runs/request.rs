use sha2::{Digest, Sha256};

/// Raster formats accepted as generation inputs.
pub const SUPPORTED_INPUT_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/webp",
    "image/gif",
    "image/bmp",
];

/// Outputs requested per run are clamped to this range.
pub const MIN_IMAGES_PER_RUN: u64 = 1;
pub const MAX_IMAGES_PER_RUN: u64 = 4;

/// An input image already normalized for upload: encoded bytes plus the
/// metadata the provider verifies against. The digest always matches the
/// bytes; enforcing the upload byte ceiling is the preprocessor's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedInputImage {
    bytes: Vec<u8>,
    mime_type: String,
    digest: String,
}

impl PreparedInputImage {
    pub fn from_bytes(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hex::encode(hasher.finalize());
        Self {
            bytes,
            mime_type: mime_type.into(),
            digest,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// A resolved generation request. Immutable once built.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    model: String,
    prompt: String,
    count: u64,
    aspect_ratio: Option<String>,
    seed: Option<i64>,
    input_images: Vec<PreparedInputImage>,
}

impl GenerationRequest {
    pub fn new(
        model: impl Into<String>,
        prompt: impl Into<String>,
        count: u64,
        aspect_ratio: Option<String>,
        seed: Option<i64>,
        input_images: Vec<PreparedInputImage>,
    ) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            count: count.clamp(MIN_IMAGES_PER_RUN, MAX_IMAGES_PER_RUN),
            aspect_ratio: aspect_ratio
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
            seed: seed.filter(|value| *value >= 0),
            input_images,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn aspect_ratio(&self) -> Option<&str> {
        self.aspect_ratio.as_deref()
    }

    pub fn seed(&self) -> Option<i64> {
        self.seed
    }

    pub fn input_images(&self) -> &[PreparedInputImage] {
        &self.input_images
    }

    pub fn input_digests(&self) -> Vec<String> {
        self.input_images
            .iter()
            .map(|image| image.digest().to_string())
            .collect()
    }
}

/// Parse an aspect-ratio string in any of the accepted spellings
/// (`"3:2"`, `"3x2"`, `"3/2"`). Zero components are rejected.
pub fn parse_aspect_ratio(raw: &str) -> Option<(u32, u32)> {
    let trimmed = raw.trim();
    let (left, right) = trimmed
        .split_once(':')
        .or_else(|| trimmed.split_once('x'))
        .or_else(|| trimmed.split_once('X'))
        .or_else(|| trimmed.split_once('/'))?;
    let width: u32 = left.trim().parse().ok()?;
    let height: u32 = right.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

/// Frame size for output slots: a fixed base width, height following the
/// aspect ratio (square when absent or unparseable).
pub fn frame_for_aspect(aspect_ratio: Option<&str>, base_width: f64) -> (f64, f64) {
    let Some((width, height)) = aspect_ratio.and_then(parse_aspect_ratio) else {
        return (base_width, base_width);
    };
    (base_width, base_width * f64::from(height) / f64::from(width))
}
