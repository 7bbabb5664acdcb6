use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const SIDECAR_SCHEMA_VERSION: u64 = 1;

/// Best-effort metadata record written next to each saved output.
///
/// Non-authoritative: persistence of the primary image file is the only hard
/// requirement, and callers swallow sidecar write failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub schema_version: u64,
    pub created_at: String,
    pub prompt: String,
    pub model: String,
    pub job_id: String,
    pub job_status: String,
    pub output_index: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub seed: Option<i64>,
    pub image_path: String,
    #[serde(default)]
    pub input_digests: Vec<String>,
}

impl SidecarRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        prompt: &str,
        model: &str,
        job_id: &str,
        job_status: &str,
        output_index: u64,
        width: Option<u64>,
        height: Option<u64>,
        seed: Option<i64>,
        image_path: &Path,
        input_digests: Vec<String>,
    ) -> Self {
        Self {
            schema_version: SIDECAR_SCHEMA_VERSION,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
            prompt: prompt.to_string(),
            model: model.to_string(),
            job_id: job_id.to_string(),
            job_status: job_status.to_string(),
            output_index,
            width,
            height,
            seed,
            image_path: image_path.to_string_lossy().to_string(),
            input_digests,
        }
    }
}

/// Sidecar path for an output file: same stem, `json` extension.
pub fn sidecar_path_for(image_path: &Path) -> PathBuf {
    let mut path = image_path.to_path_buf();
    path.set_extension("json");
    path
}

pub fn write_sidecar(path: &Path, record: &SidecarRecord) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(record)?)?;
    Ok(())
}
