use anyhow::Result;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use easel_contracts::runs::request::GenerationRequest;

use crate::cancel::CancelSignal;
use crate::client::{GenerationClient, GenerationOutput, JobStatus};
use crate::error::RunError;
use crate::poller::{JobPoller, PollPolicy};

/// One usable output plus the job that owns it, kept so the retriever can
/// re-poll for a fresh URL.
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub output: GenerationOutput,
    pub job_id: String,
    pub poll_url: Option<String>,
}

/// Submits as many sub-jobs as the per-job output ceiling requires, polling
/// each to terminal, until the requested count is reached or the attempt
/// budget runs out.
pub struct GenerationSubmitter<'a> {
    client: &'a dyn GenerationClient,
    poll_policy: PollPolicy,
}

impl<'a> GenerationSubmitter<'a> {
    pub fn new(client: &'a dyn GenerationClient, poll_policy: PollPolicy) -> Self {
        Self {
            client,
            poll_policy,
        }
    }

    pub fn submit_batch(
        &self,
        request: &GenerationRequest,
        input_refs: &[String],
        per_job_max: u64,
        run_id: &str,
        cancel: &CancelSignal,
        on_update: &mut dyn FnMut(&str),
    ) -> Result<Vec<BatchOutput>> {
        let desired = request.count();
        let per_job_max = per_job_max.max(1);
        let max_attempts = desired.saturating_mul(3).max(3);

        let mut taken: Vec<BatchOutput> = Vec::new();
        let mut attempts = 0u64;

        while (taken.len() as u64) < desired && attempts < max_attempts {
            attempts += 1;
            let done = taken.len() as u64;
            let remaining = desired - done;
            let n = remaining.min(per_job_max);
            let seed = request.seed().map(|seed| seed.saturating_add(done as i64));

            let body = normalized_body(request, input_refs, n, seed);
            let attempt_token = Uuid::new_v4().to_string();
            let key = idempotency_key(run_id, &body, &attempt_token);

            cancel.check()?;
            on_update("submitting generation job...");
            let created = self.client.create_job(&body, &key)?;

            let job = JobPoller::new(self.client, self.poll_policy).poll(
                &created.job_id,
                created.poll_url.as_deref(),
                cancel,
                &mut |status| match status {
                    JobStatus::Queued => on_update("waiting in queue..."),
                    _ => on_update(&format!("generating image ({}/{})...", done + 1, desired)),
                },
            )?;

            if job.status == JobStatus::Failed {
                if taken.is_empty() {
                    let reason = job
                        .error
                        .unwrap_or_else(|| "provider reported job failure".to_string());
                    return Err(RunError::TerminalProvider(reason).into());
                }
                break;
            }

            let poll_url = created.poll_url.or(job.poll_url);
            let usable: Vec<GenerationOutput> = job
                .outputs
                .into_iter()
                .filter(|output| is_fetchable_url(&output.url))
                .take(remaining as usize)
                .collect();
            if usable.is_empty() {
                if taken.is_empty() {
                    return Err(RunError::TerminalProvider(
                        "provider returned no usable outputs".to_string(),
                    )
                    .into());
                }
                break;
            }
            for output in usable {
                taken.push(BatchOutput {
                    output,
                    job_id: job.id.clone(),
                    poll_url: poll_url.clone(),
                });
            }
        }

        Ok(taken)
    }
}

/// Stable submission body: serde_json's default map ordering keeps the
/// serialization deterministic for a given field set.
fn normalized_body(
    request: &GenerationRequest,
    input_refs: &[String],
    n: u64,
    seed: Option<i64>,
) -> Map<String, Value> {
    let mut body = Map::new();
    body.insert(
        "model".to_string(),
        Value::String(request.model().to_string()),
    );
    body.insert(
        "prompt".to_string(),
        Value::String(request.prompt().to_string()),
    );
    body.insert("n".to_string(), Value::Number(n.into()));
    if let Some(aspect) = request.aspect_ratio() {
        body.insert(
            "aspect_ratio".to_string(),
            Value::String(aspect.to_string()),
        );
    }
    if let Some(seed) = seed {
        body.insert("seed".to_string(), Value::Number(seed.into()));
    }
    if !input_refs.is_empty() {
        body.insert(
            "input_images".to_string(),
            Value::Array(
                input_refs
                    .iter()
                    .map(|reference| Value::String(reference.clone()))
                    .collect(),
            ),
        );
    }
    body
}

/// Key the provider uses to recognize a transport-level retry of this exact
/// submission. The fresh attempt token scopes deduplication to one logical
/// attempt: separate user-initiated runs of the same prompt produce distinct
/// keys on purpose.
fn idempotency_key(run_id: &str, body: &Map<String, Value>, attempt_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_vec(&Value::Object(body.clone())).unwrap_or_default());
    hasher.update(b"\n");
    hasher.update(attempt_token.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_fetchable_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;
    use serde_json::{Map, Value};

    use easel_contracts::runs::request::GenerationRequest;

    use crate::cancel::CancelSignal;
    use crate::client::{
        CreatedJob, DownloadedImage, GenerationClient, GenerationJob, GenerationOutput, JobStatus,
    };
    use crate::error::RunError;
    use crate::poller::PollPolicy;

    use super::{idempotency_key, normalized_body, GenerationSubmitter};

    fn quick_policy() -> PollPolicy {
        PollPolicy {
            initial_delay: std::time::Duration::ZERO,
            interval: std::time::Duration::from_millis(1),
            backoff: 1.0,
            max_interval: std::time::Duration::from_millis(1),
            max_wait: None,
        }
    }

    fn output(index: u64, url: &str) -> GenerationOutput {
        GenerationOutput {
            index,
            url: url.to_string(),
            mime_type: Some("image/png".to_string()),
            byte_size: None,
            width: None,
            height: None,
        }
    }

    /// Succeeds every job, handing out a scripted output set per sub-job.
    struct RecordingClient {
        bodies: Mutex<Vec<Map<String, Value>>>,
        keys: Mutex<Vec<String>>,
        script: Mutex<Vec<Vec<GenerationOutput>>>,
        fail_first_job: bool,
    }

    impl RecordingClient {
        fn new(script: Vec<Vec<GenerationOutput>>) -> Self {
            Self {
                bodies: Mutex::new(Vec::new()),
                keys: Mutex::new(Vec::new()),
                script: Mutex::new(script),
                fail_first_job: false,
            }
        }

        fn created(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }

        fn body_field(&self, call: usize, key: &str) -> Option<Value> {
            self.bodies.lock().unwrap().get(call)?.get(key).cloned()
        }
    }

    impl GenerationClient for RecordingClient {
        fn create_job(
            &self,
            body: &Map<String, Value>,
            idempotency_key: &str,
        ) -> Result<CreatedJob> {
            self.bodies.lock().unwrap().push(body.clone());
            self.keys.lock().unwrap().push(idempotency_key.to_string());
            let job_id = format!("job-{}", self.created());
            Ok(CreatedJob {
                job_id,
                poll_url: None,
            })
        }

        fn poll_job(&self, job_id: &str, _poll_url_hint: Option<&str>) -> Result<GenerationJob> {
            if self.fail_first_job && job_id == "job-1" {
                return Ok(GenerationJob {
                    id: job_id.to_string(),
                    status: JobStatus::Failed,
                    error: Some("safety system rejected the prompt".to_string()),
                    poll_url: None,
                    outputs: Vec::new(),
                });
            }
            let mut script = self.script.lock().unwrap();
            let outputs = if script.is_empty() {
                Vec::new()
            } else {
                script.remove(0)
            };
            Ok(GenerationJob {
                id: job_id.to_string(),
                status: JobStatus::Succeeded,
                error: None,
                poll_url: None,
                outputs,
            })
        }

        fn download_output(&self, _url: &str) -> Result<DownloadedImage> {
            unreachable!("submitter tests never download")
        }
    }

    fn request(count: u64, seed: Option<i64>) -> GenerationRequest {
        GenerationRequest::new("m1", "a cat", count, None, seed, Vec::new())
    }

    #[test]
    fn splits_into_single_output_jobs_with_offset_seeds() -> Result<()> {
        let client = RecordingClient::new(vec![
            vec![output(0, "https://cdn.example/0.png")],
            vec![output(0, "https://cdn.example/1.png")],
            vec![output(0, "https://cdn.example/2.png")],
        ]);
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let outputs = submitter.submit_batch(
            &request(3, Some(11)),
            &[],
            1,
            "run-1",
            &CancelSignal::new(),
            &mut |_| {},
        )?;

        assert_eq!(outputs.len(), 3);
        assert_eq!(client.created(), 3);
        for (call, seed) in [(0usize, 11i64), (1, 12), (2, 13)] {
            assert_eq!(client.body_field(call, "seed"), Some(Value::from(seed)));
            assert_eq!(client.body_field(call, "n"), Some(Value::from(1u64)));
        }
        let keys = client.keys.lock().unwrap();
        assert_eq!(keys.len(), 3);
        assert_ne!(keys[0], keys[1]);
        Ok(())
    }

    #[test]
    fn never_requests_more_than_the_remaining_count() -> Result<()> {
        let client = RecordingClient::new(vec![
            vec![
                output(0, "https://cdn.example/0.png"),
                output(1, "https://cdn.example/1.png"),
                output(2, "https://cdn.example/2.png"),
            ],
            vec![output(0, "https://cdn.example/3.png")],
        ]);
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let outputs = submitter.submit_batch(
            &request(4, None),
            &[],
            3,
            "run-1",
            &CancelSignal::new(),
            &mut |_| {},
        )?;

        assert_eq!(outputs.len(), 4);
        assert_eq!(client.created(), 2);
        assert_eq!(client.body_field(0, "n"), Some(Value::from(3u64)));
        assert_eq!(client.body_field(1, "n"), Some(Value::from(1u64)));
        Ok(())
    }

    #[test]
    fn fails_when_the_first_sub_job_yields_nothing() {
        let client = RecordingClient::new(vec![Vec::new()]);
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let err = submitter
            .submit_batch(
                &request(2, None),
                &[],
                1,
                "run-1",
                &CancelSignal::new(),
                &mut |_| {},
            )
            .expect_err("an empty first sub-job must fail");
        assert!(matches!(
            RunError::from_anyhow(&err),
            Some(RunError::TerminalProvider(_))
        ));
        assert_eq!(client.created(), 1);
    }

    #[test]
    fn stops_early_once_progress_stalls() -> Result<()> {
        let client = RecordingClient::new(vec![
            vec![output(0, "https://cdn.example/0.png")],
            Vec::new(),
        ]);
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let outputs = submitter.submit_batch(
            &request(3, None),
            &[],
            1,
            "run-1",
            &CancelSignal::new(),
            &mut |_| {},
        )?;

        assert_eq!(outputs.len(), 1);
        assert_eq!(client.created(), 2);
        Ok(())
    }

    #[test]
    fn filters_outputs_without_fetchable_urls() -> Result<()> {
        let client = RecordingClient::new(vec![vec![
            output(0, "asset://pending/0"),
            output(1, "https://cdn.example/1.png"),
        ]]);
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let outputs = submitter.submit_batch(
            &request(1, None),
            &[],
            4,
            "run-1",
            &CancelSignal::new(),
            &mut |_| {},
        )?;

        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].output.url, "https://cdn.example/1.png");
        Ok(())
    }

    #[test]
    fn first_job_failure_carries_the_provider_reason() {
        let mut client = RecordingClient::new(Vec::new());
        client.fail_first_job = true;
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let err = submitter
            .submit_batch(
                &request(1, None),
                &[],
                1,
                "run-1",
                &CancelSignal::new(),
                &mut |_| {},
            )
            .expect_err("failed job must propagate");
        assert_eq!(
            RunError::from_anyhow(&err),
            Some(&RunError::TerminalProvider(
                "safety system rejected the prompt".to_string()
            ))
        );
    }

    #[test]
    fn cancellation_before_submission_makes_no_calls() {
        let client = RecordingClient::new(Vec::new());
        let cancel = CancelSignal::new();
        cancel.cancel();
        let submitter = GenerationSubmitter::new(&client, quick_policy());
        let err = submitter
            .submit_batch(&request(2, None), &[], 1, "run-1", &cancel, &mut |_| {})
            .expect_err("cancelled run must fail");
        assert!(RunError::is_aborted(&err));
        assert_eq!(client.created(), 0);
    }

    #[test]
    fn idempotency_key_is_deterministic_and_field_sensitive() {
        let refs = vec!["upload-1".to_string()];
        let base = normalized_body(&request(2, Some(5)), &refs, 2, Some(5));
        let key = idempotency_key("run-1", &base, "token-1");
        assert_eq!(key, idempotency_key("run-1", &base, "token-1"));

        let other_prompt = normalized_body(
            &GenerationRequest::new("m1", "a dog", 2, None, Some(5), Vec::new()),
            &refs,
            2,
            Some(5),
        );
        assert_ne!(key, idempotency_key("run-1", &other_prompt, "token-1"));

        let other_seed = normalized_body(&request(2, Some(6)), &refs, 2, Some(6));
        assert_ne!(key, idempotency_key("run-1", &other_seed, "token-1"));

        let other_refs = normalized_body(
            &request(2, Some(5)),
            &["upload-2".to_string()],
            2,
            Some(5),
        );
        assert_ne!(key, idempotency_key("run-1", &other_refs, "token-1"));

        assert_ne!(key, idempotency_key("run-2", &base, "token-1"));
        assert_ne!(key, idempotency_key("run-1", &base, "token-2"));
    }
}
