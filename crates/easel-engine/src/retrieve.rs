use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use easel_contracts::runs::sidecar::{sidecar_path_for, write_sidecar, SidecarRecord};

use crate::cancel::CancelSignal;
use crate::client::{GenerationClient, GenerationOutput};
use crate::error::RunError;
use crate::poller::{JobPoller, PollPolicy};

/// A finished output persisted to disk.
#[derive(Debug, Clone)]
pub struct SavedOutput {
    pub output: GenerationOutput,
    pub path: PathBuf,
}

/// Request context recorded into each output's sidecar.
#[derive(Debug, Clone, Copy)]
pub struct SidecarContext<'a> {
    pub prompt: &'a str,
    pub model: &'a str,
    pub seed: Option<i64>,
    pub input_digests: &'a [String],
}

/// Downloads finished outputs, recovering once from an expired or
/// rate-limited URL by re-polling the owning job for a fresh one.
pub struct OutputRetriever<'a> {
    client: &'a dyn GenerationClient,
    refresh_policy: PollPolicy,
}

impl<'a> OutputRetriever<'a> {
    pub fn new(client: &'a dyn GenerationClient, refresh_policy: PollPolicy) -> Self {
        Self {
            client,
            refresh_policy,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        output: &GenerationOutput,
        job_id: &str,
        poll_url_hint: Option<&str>,
        dest_dir: &Path,
        stamp: u128,
        sidecar: &SidecarContext<'_>,
        cancel: &CancelSignal,
    ) -> Result<SavedOutput> {
        cancel.check()?;
        let mut effective = output.clone();
        let downloaded = match self.client.download_output(&effective.url) {
            Ok(downloaded) => downloaded,
            Err(err) => {
                if RunError::retryable_download_status(&err).is_none() {
                    return Err(err);
                }
                let refreshed = self.refresh_output(output, job_id, poll_url_hint, cancel)?;
                match refreshed {
                    Some(fresh) if fresh.url != effective.url => {
                        effective = fresh;
                        cancel.check()?;
                        self.client.download_output(&effective.url)?
                    }
                    _ => return Err(err),
                }
            }
        };

        let ext = extension_for(
            downloaded.content_type.as_deref(),
            effective.mime_type.as_deref(),
            &effective.url,
        );
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("failed to create {}", dest_dir.display()))?;
        let path = dest_dir.join(format!("artifact-{}-{:02}.{}", stamp, effective.index, ext));
        fs::write(&path, &downloaded.bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;

        // Best-effort: the saved image is the only hard requirement.
        let record = SidecarRecord::new(
            sidecar.prompt,
            sidecar.model,
            job_id,
            "succeeded",
            effective.index,
            effective.width,
            effective.height,
            sidecar.seed,
            &path,
            sidecar.input_digests.to_vec(),
        );
        let _ = write_sidecar(&sidecar_path_for(&path), &record);

        Ok(SavedOutput {
            output: effective,
            path,
        })
    }

    /// Short bounded re-poll of the owning job; the refreshed output is
    /// matched by ordinal index first, positional order second.
    fn refresh_output(
        &self,
        output: &GenerationOutput,
        job_id: &str,
        poll_url_hint: Option<&str>,
        cancel: &CancelSignal,
    ) -> Result<Option<GenerationOutput>> {
        let job = JobPoller::new(self.client, self.refresh_policy).poll(
            job_id,
            poll_url_hint,
            cancel,
            &mut |_| {},
        )?;
        let by_index = job
            .outputs
            .iter()
            .find(|candidate| candidate.index == output.index);
        let matched = by_index.or_else(|| job.outputs.get(output.index as usize));
        Ok(matched.cloned())
    }
}

fn extension_for(content_type: Option<&str>, declared_mime: Option<&str>, url: &str) -> &'static str {
    content_type
        .and_then(mime_extension)
        .or_else(|| declared_mime.and_then(mime_extension))
        .or_else(|| url_extension(url))
        .unwrap_or("png")
}

fn mime_extension(mime: &str) -> Option<&'static str> {
    let essence = mime
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}

fn url_extension(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();
    let ext = name.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "webp" => Some("webp"),
        "gif" => Some("gif"),
        "bmp" => Some("bmp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;
    use serde_json::{Map, Value};

    use crate::cancel::CancelSignal;
    use crate::client::{
        CreatedJob, DownloadedImage, GenerationClient, GenerationJob, GenerationOutput, JobStatus,
    };
    use crate::error::RunError;
    use crate::poller::PollPolicy;

    use super::{extension_for, OutputRetriever, SidecarContext};

    fn refresh_policy() -> PollPolicy {
        PollPolicy {
            initial_delay: Duration::ZERO,
            interval: Duration::from_millis(1),
            backoff: 1.0,
            max_interval: Duration::from_millis(1),
            max_wait: Some(Duration::from_millis(50)),
        }
    }

    fn output(index: u64, url: &str) -> GenerationOutput {
        GenerationOutput {
            index,
            url: url.to_string(),
            mime_type: Some("image/png".to_string()),
            byte_size: None,
            width: Some(512),
            height: Some(512),
        }
    }

    fn sidecar_ctx<'a>() -> SidecarContext<'a> {
        SidecarContext {
            prompt: "a cat",
            model: "m1",
            seed: Some(3),
            input_digests: &[],
        }
    }

    /// Fails downloads with scripted statuses, then serves bytes; refresh
    /// polls always return the configured output set.
    struct FlakyClient {
        failures: Mutex<Vec<u16>>,
        refreshed: Vec<GenerationOutput>,
        downloads: Mutex<Vec<String>>,
        polls: Mutex<u32>,
    }

    impl FlakyClient {
        fn new(failures: Vec<u16>, refreshed: Vec<GenerationOutput>) -> Self {
            Self {
                failures: Mutex::new(failures),
                refreshed,
                downloads: Mutex::new(Vec::new()),
                polls: Mutex::new(0),
            }
        }

        fn downloads(&self) -> Vec<String> {
            self.downloads.lock().unwrap().clone()
        }

        fn poll_count(&self) -> u32 {
            *self.polls.lock().unwrap()
        }
    }

    impl GenerationClient for FlakyClient {
        fn create_job(
            &self,
            _body: &Map<String, Value>,
            _idempotency_key: &str,
        ) -> Result<CreatedJob> {
            unreachable!("retriever tests never create jobs")
        }

        fn poll_job(&self, job_id: &str, _poll_url_hint: Option<&str>) -> Result<GenerationJob> {
            *self.polls.lock().unwrap() += 1;
            Ok(GenerationJob {
                id: job_id.to_string(),
                status: JobStatus::Succeeded,
                error: None,
                poll_url: None,
                outputs: self.refreshed.clone(),
            })
        }

        fn download_output(&self, url: &str) -> Result<DownloadedImage> {
            self.downloads.lock().unwrap().push(url.to_string());
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                let status = failures.remove(0);
                return Err(RunError::TransientProvider {
                    status,
                    url: url.to_string(),
                }
                .into());
            }
            Ok(DownloadedImage {
                bytes: b"image-bytes".to_vec(),
                content_type: Some("image/png".to_string()),
            })
        }
    }

    #[test]
    fn retries_once_with_the_refreshed_url() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = FlakyClient::new(
            vec![503],
            vec![output(0, "https://cdn.example/refreshed.png")],
        );
        let retriever = OutputRetriever::new(&client, refresh_policy());
        let saved = retriever.save(
            &output(0, "https://cdn.example/stale.png"),
            "job-1",
            None,
            temp.path(),
            17,
            &sidecar_ctx(),
            &CancelSignal::new(),
        )?;

        assert_eq!(saved.output.url, "https://cdn.example/refreshed.png");
        assert_eq!(
            client.downloads(),
            vec![
                "https://cdn.example/stale.png".to_string(),
                "https://cdn.example/refreshed.png".to_string(),
            ]
        );
        assert_eq!(client.poll_count(), 1);
        assert_eq!(std::fs::read(&saved.path)?, b"image-bytes");

        let sidecar_path = saved.path.with_extension("json");
        let sidecar: Value = serde_json::from_str(&std::fs::read_to_string(sidecar_path)?)?;
        assert_eq!(sidecar["prompt"], "a cat");
        assert_eq!(sidecar["job_id"], "job-1");
        Ok(())
    }

    #[test]
    fn a_second_failure_is_not_refreshed_again() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = FlakyClient::new(
            vec![503, 503],
            vec![output(0, "https://cdn.example/refreshed.png")],
        );
        let retriever = OutputRetriever::new(&client, refresh_policy());
        let err = retriever
            .save(
                &output(0, "https://cdn.example/stale.png"),
                "job-1",
                None,
                temp.path(),
                17,
                &sidecar_ctx(),
                &CancelSignal::new(),
            )
            .expect_err("second 503 must propagate");

        assert_eq!(RunError::retryable_download_status(&err), Some(503));
        assert_eq!(client.poll_count(), 1);
        assert_eq!(client.downloads().len(), 2);
        Ok(())
    }

    #[test]
    fn non_retryable_statuses_skip_the_refresh() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = FlakyClient::new(vec![404], Vec::new());
        let retriever = OutputRetriever::new(&client, refresh_policy());
        let err = retriever
            .save(
                &output(0, "https://cdn.example/gone.png"),
                "job-1",
                None,
                temp.path(),
                17,
                &sidecar_ctx(),
                &CancelSignal::new(),
            )
            .expect_err("404 must propagate");

        assert!(RunError::retryable_download_status(&err).is_none());
        assert_eq!(client.poll_count(), 0);
        assert_eq!(client.downloads().len(), 1);
        Ok(())
    }

    #[test]
    fn unchanged_refresh_url_propagates_the_original_error() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = FlakyClient::new(
            vec![410],
            vec![output(0, "https://cdn.example/stale.png")],
        );
        let retriever = OutputRetriever::new(&client, refresh_policy());
        let err = retriever
            .save(
                &output(0, "https://cdn.example/stale.png"),
                "job-1",
                None,
                temp.path(),
                17,
                &sidecar_ctx(),
                &CancelSignal::new(),
            )
            .expect_err("identical refreshed URL is no recovery");

        assert_eq!(RunError::retryable_download_status(&err), Some(410));
        assert_eq!(client.downloads().len(), 1);
        Ok(())
    }

    #[test]
    fn refresh_matching_falls_back_to_positional_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let client = FlakyClient::new(
            vec![429],
            vec![output(9, "https://cdn.example/renumbered.png")],
        );
        let retriever = OutputRetriever::new(&client, refresh_policy());
        let saved = retriever.save(
            &output(0, "https://cdn.example/stale.png"),
            "job-1",
            None,
            temp.path(),
            17,
            &sidecar_ctx(),
            &CancelSignal::new(),
        )?;
        assert_eq!(saved.output.url, "https://cdn.example/renumbered.png");
        Ok(())
    }

    #[test]
    fn extension_priority_is_content_type_then_mime_then_url() {
        assert_eq!(
            extension_for(
                Some("image/webp"),
                Some("image/png"),
                "https://cdn.example/a.jpg"
            ),
            "webp"
        );
        assert_eq!(
            extension_for(None, Some("image/jpeg"), "https://cdn.example/a.gif"),
            "jpg"
        );
        assert_eq!(
            extension_for(None, None, "https://cdn.example/a.gif?sig=abc"),
            "gif"
        );
        assert_eq!(
            extension_for(Some("application/octet-stream"), None, "https://cdn.example/a"),
            "png"
        );
    }
}
