use std::collections::HashMap;
use std::env;
use std::io::Cursor;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{RunError, RETRYABLE_DOWNLOAD_STATUSES};
use crate::truncate_text;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn parse(raw: &str) -> JobStatus {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "starting" | "accepted" => JobStatus::Queued,
            "succeeded" | "completed" | "success" | "done" => JobStatus::Succeeded,
            "failed" | "error" | "canceled" | "cancelled" => JobStatus::Failed,
            _ => JobStatus::Processing,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// One finished image as reported by the provider. The URL may be
/// short-lived; re-polling the job refreshes it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub index: u64,
    pub url: String,
    pub mime_type: Option<String>,
    pub byte_size: Option<u64>,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

/// Provider-side job state. Mutated only by re-fetching, never patched
/// locally.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub poll_url: Option<String>,
    pub outputs: Vec<GenerationOutput>,
}

#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job_id: String,
    pub poll_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DownloadedImage {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// What the provider needs to know about an input image before upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImageMeta {
    pub mime_type: String,
    pub byte_size: u64,
    pub digest: String,
}

/// Provider-issued upload destination for one input image. The echoed
/// mime/size/digest must match the local image before the reference is
/// trusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub upload_url: String,
    pub reference: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub digest: String,
}

/// Transport boundary to the generation provider. Single fetches only; all
/// looping, retry, and classification live in the engine.
pub trait GenerationClient: Send + Sync {
    fn create_job(&self, body: &Map<String, Value>, idempotency_key: &str) -> Result<CreatedJob>;

    fn poll_job(&self, job_id: &str, poll_url_hint: Option<&str>) -> Result<GenerationJob>;

    fn download_output(&self, url: &str) -> Result<DownloadedImage>;

    /// Request out-of-band upload targets for the given inputs. An empty
    /// result means the backend takes inline references instead.
    fn prepare_uploads(&self, images: &[InputImageMeta]) -> Result<Vec<UploadTarget>> {
        let _ = images;
        Ok(Vec::new())
    }

    fn upload_prepared(&self, target: &UploadTarget, bytes: &[u8]) -> Result<()> {
        let _ = (target, bytes);
        bail!("backend does not accept prepared uploads");
    }
}

/// HTTP implementation of the provider protocol.
pub struct HttpGenerationClient {
    api_base: String,
    http: HttpClient,
}

impl HttpGenerationClient {
    pub fn new() -> Self {
        Self {
            api_base: env::var("EASEL_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://api.easel.dev/v1".to_string()),
            http: HttpClient::new(),
        }
    }

    fn api_key() -> Option<String> {
        env::var("EASEL_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn require_api_key() -> Result<String> {
        Self::api_key()
            .ok_or_else(|| RunError::Configuration("EASEL_API_KEY not set".to_string()).into())
    }

    fn jobs_endpoint(&self) -> String {
        format!("{}/jobs", self.api_base)
    }

    /// True when `url` shares scheme, host, and port with the API base, so
    /// credentials may accompany the request.
    fn same_origin(&self, url: &str) -> bool {
        let (Ok(base), Ok(target)) = (Url::parse(&self.api_base), Url::parse(url)) else {
            return false;
        };
        base.scheme() == target.scheme()
            && base.host_str() == target.host_str()
            && base.port_or_known_default() == target.port_or_known_default()
    }

    fn parse_job(payload: &Value) -> GenerationJob {
        let id = payload
            .get("job_id")
            .or_else(|| payload.get("id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(JobStatus::parse)
            .unwrap_or(JobStatus::Processing);
        let error = payload
            .get("error")
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            })
            .filter(|text| !text.trim().is_empty());
        let poll_url = payload
            .get("poll_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut outputs = Vec::new();
        if let Some(rows) = payload.get("outputs").and_then(Value::as_array) {
            for (position, row) in rows.iter().enumerate() {
                let Some(url) = row.get("url").and_then(Value::as_str).map(str::trim) else {
                    continue;
                };
                if url.is_empty() {
                    continue;
                }
                outputs.push(GenerationOutput {
                    index: row
                        .get("index")
                        .and_then(Value::as_u64)
                        .unwrap_or(position as u64),
                    url: url.to_string(),
                    mime_type: row
                        .get("mime_type")
                        .or_else(|| row.get("content_type"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    byte_size: row
                        .get("byte_size")
                        .or_else(|| row.get("size"))
                        .and_then(Value::as_u64),
                    width: row.get("width").and_then(Value::as_u64),
                    height: row.get("height").and_then(Value::as_u64),
                });
            }
        }

        GenerationJob {
            id,
            status,
            error,
            poll_url,
            outputs,
        }
    }

    fn response_json(context: &str, response: reqwest::blocking::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "{context} failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        response
            .json()
            .with_context(|| format!("{context} returned malformed JSON"))
    }
}

impl Default for HttpGenerationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationClient for HttpGenerationClient {
    fn create_job(&self, body: &Map<String, Value>, idempotency_key: &str) -> Result<CreatedJob> {
        let api_key = Self::require_api_key()?;
        let endpoint = self.jobs_endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .header("Idempotency-Key", idempotency_key)
            .json(&Value::Object(body.clone()))
            .send()
            .with_context(|| format!("job submission failed ({endpoint})"))?;
        let payload = Self::response_json("job submission", response)?;

        let job = Self::parse_job(&payload);
        if job.id.is_empty() {
            bail!("provider response carried no job id: {payload}");
        }
        Ok(CreatedJob {
            job_id: job.id,
            poll_url: job.poll_url,
        })
    }

    fn poll_job(&self, job_id: &str, poll_url_hint: Option<&str>) -> Result<GenerationJob> {
        let api_key = Self::require_api_key()?;
        let endpoint = poll_url_hint
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/{job_id}", self.jobs_endpoint()));
        let response = self
            .http
            .get(&endpoint)
            .bearer_auth(&api_key)
            .send()
            .with_context(|| format!("job poll failed ({endpoint})"))?;
        let payload = Self::response_json("job poll", response)?;

        let mut job = Self::parse_job(&payload);
        if job.id.is_empty() {
            job.id = job_id.to_string();
        }
        Ok(job)
    }

    fn download_output(&self, url: &str) -> Result<DownloadedImage> {
        let mut request = self.http.get(url);
        if self.same_origin(url) {
            if let Some(api_key) = Self::api_key() {
                request = request.bearer_auth(api_key);
            }
        }
        let response = request
            .send()
            .with_context(|| format!("failed downloading output ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            if RETRYABLE_DOWNLOAD_STATUSES.contains(&code) {
                return Err(RunError::TransientProvider {
                    status: code,
                    url: url.to_string(),
                }
                .into());
            }
            let body = response.text().unwrap_or_default();
            return Err(RunError::TerminalProvider(format!(
                "output download failed ({code}): {}",
                truncate_text(&body, 512)
            ))
            .into());
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading output bytes")?
            .to_vec();
        Ok(DownloadedImage {
            bytes,
            content_type,
        })
    }

    fn prepare_uploads(&self, images: &[InputImageMeta]) -> Result<Vec<UploadTarget>> {
        if images.is_empty() {
            return Ok(Vec::new());
        }
        let api_key = Self::require_api_key()?;
        let endpoint = format!("{}/uploads", self.api_base);
        let rows: Vec<Value> = images
            .iter()
            .map(|meta| {
                serde_json::json!({
                    "mime_type": meta.mime_type,
                    "byte_size": meta.byte_size,
                    "digest": meta.digest,
                })
            })
            .collect();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&api_key)
            .json(&serde_json::json!({ "images": rows }))
            .send()
            .with_context(|| format!("upload preparation failed ({endpoint})"))?;
        let payload = Self::response_json("upload preparation", response)?;

        let mut targets = Vec::new();
        for row in payload
            .get("targets")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
        {
            targets.push(UploadTarget {
                upload_url: row
                    .get("upload_url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                reference: row
                    .get("reference")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                mime_type: row
                    .get("mime_type")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                byte_size: row.get("byte_size").and_then(Value::as_u64).unwrap_or(0),
                digest: row
                    .get("digest")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        if targets.len() != images.len() {
            bail!(
                "provider prepared {} upload targets for {} images",
                targets.len(),
                images.len()
            );
        }
        Ok(targets)
    }

    fn upload_prepared(&self, target: &UploadTarget, bytes: &[u8]) -> Result<()> {
        let mut request = self
            .http
            .put(&target.upload_url)
            .header(CONTENT_TYPE, target.mime_type.clone())
            .body(bytes.to_vec());
        if self.same_origin(&target.upload_url) {
            if let Some(api_key) = Self::api_key() {
                request = request.bearer_auth(api_key);
            }
        }
        let response = request
            .send()
            .with_context(|| format!("input upload failed ({})", target.upload_url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!(
                "input upload failed ({}): {}",
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(())
    }
}

/// Offline backend: jobs succeed immediately and outputs are synthesized
/// solid-color images keyed by prompt and seed. Used by tests and the CLI's
/// `--dryrun` mode.
#[derive(Default)]
pub struct DryrunClient {
    jobs: Mutex<HashMap<String, Map<String, Value>>>,
}

impl DryrunClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn job_body(&self, job_id: &str) -> Result<Map<String, Value>> {
        let jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("dryrun job table lock poisoned"))?;
        jobs.get(job_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown dryrun job '{job_id}'"))
    }

    fn output_dims(body: &Map<String, Value>) -> (u32, u32) {
        let aspect = body
            .get("aspect_ratio")
            .and_then(Value::as_str)
            .unwrap_or("1:1");
        let (w, h) =
            easel_contracts::runs::request::parse_aspect_ratio(aspect).unwrap_or((1, 1));
        if w >= h {
            (512, (512 * h / w).max(1))
        } else {
            ((512 * w / h).max(1), 512)
        }
    }
}

impl GenerationClient for DryrunClient {
    fn create_job(&self, body: &Map<String, Value>, idempotency_key: &str) -> Result<CreatedJob> {
        let mut hasher = Sha256::new();
        hasher.update(idempotency_key.as_bytes());
        let job_id = format!("dryrun-{}", hex::encode(&hasher.finalize()[..6]));
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| anyhow::anyhow!("dryrun job table lock poisoned"))?;
        jobs.insert(job_id.clone(), body.clone());
        Ok(CreatedJob {
            job_id,
            poll_url: None,
        })
    }

    fn poll_job(&self, job_id: &str, _poll_url_hint: Option<&str>) -> Result<GenerationJob> {
        let body = self.job_body(job_id)?;
        let n = body.get("n").and_then(Value::as_u64).unwrap_or(1).max(1);
        let (width, height) = Self::output_dims(&body);
        let outputs = (0..n)
            .map(|index| GenerationOutput {
                index,
                url: format!("http://dryrun.invalid/{job_id}/{index}.png"),
                mime_type: Some("image/png".to_string()),
                byte_size: None,
                width: Some(u64::from(width)),
                height: Some(u64::from(height)),
            })
            .collect();
        Ok(GenerationJob {
            id: job_id.to_string(),
            status: JobStatus::Succeeded,
            error: None,
            poll_url: None,
            outputs,
        })
    }

    fn download_output(&self, url: &str) -> Result<DownloadedImage> {
        let mut segments = url.rsplit('/');
        let file = segments.next().unwrap_or_default();
        let job_id = segments.next().unwrap_or_default();
        let index: u64 = file
            .strip_suffix(".png")
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| anyhow::anyhow!("malformed dryrun output url '{url}'"))?;
        let body = self.job_body(job_id)?;

        let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or("");
        let seed = body.get("seed").and_then(Value::as_i64).unwrap_or(0);
        let (width, height) = Self::output_dims(&body);
        let bytes = dryrun_image_bytes(
            width,
            height,
            prompt,
            seed.saturating_add(index as i64) as u64,
        )?;
        Ok(DownloadedImage {
            bytes,
            content_type: Some("image/png".to_string()),
        })
    }
}

fn dryrun_image_bytes(width: u32, height: u32, prompt: &str, seed: u64) -> Result<Vec<u8>> {
    let (r, g, b) = color_from_prompt(prompt, seed);
    let mut image = RgbImage::new(width, height);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed encoding dryrun image")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
