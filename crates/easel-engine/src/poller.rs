use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::cancel::CancelSignal;
use crate::client::{GenerationClient, GenerationJob, JobStatus};
use crate::error::RunError;

/// Polling cadence, decoupled from the polling mechanism.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Multiplier applied to the interval after each non-terminal poll.
    pub backoff: f64,
    pub max_interval: Duration,
    /// Hard wait budget. `None` for the primary run poll, which may
    /// legitimately run for minutes; set only for short refresh polls.
    pub max_wait: Option<Duration>,
}

impl PollPolicy {
    /// Cadence for the primary run poll: unbounded wait, growing interval.
    pub fn primary() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            interval: Duration::from_secs(1),
            backoff: 1.5,
            max_interval: Duration::from_secs(5),
            max_wait: None,
        }
    }

    /// Cadence for a URL-refresh re-poll: fast, flat, hard-bounded.
    pub fn refresh() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval: Duration::from_millis(500),
            backoff: 1.0,
            max_interval: Duration::from_millis(500),
            max_wait: Some(Duration::from_secs(10)),
        }
    }

    fn grow(&self, interval: Duration) -> Duration {
        if self.backoff <= 1.0 {
            return interval;
        }
        interval.mul_f64(self.backoff).min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::primary()
    }
}

/// Repeatedly fetches job status until a terminal state.
///
/// The cancel signal is checked before every fetch and every sleep; once
/// set, no further network calls are made. A failed job is returned, not
/// raised; classification belongs to the caller.
pub struct JobPoller<'a> {
    client: &'a dyn GenerationClient,
    policy: PollPolicy,
}

impl<'a> JobPoller<'a> {
    pub fn new(client: &'a dyn GenerationClient, policy: PollPolicy) -> Self {
        Self { client, policy }
    }

    pub fn poll(
        &self,
        job_id: &str,
        poll_url_hint: Option<&str>,
        cancel: &CancelSignal,
        on_update: &mut dyn FnMut(JobStatus),
    ) -> Result<GenerationJob> {
        let started = Instant::now();
        if !self.policy.initial_delay.is_zero() {
            cancel.check()?;
            thread::sleep(self.policy.initial_delay);
        }

        let mut interval = self.policy.interval;
        loop {
            cancel.check()?;
            let job = self.client.poll_job(job_id, poll_url_hint)?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            on_update(job.status);

            if let Some(max_wait) = self.policy.max_wait {
                if started.elapsed() >= max_wait {
                    return Err(RunError::TimedOut(max_wait).into());
                }
            }
            cancel.check()?;
            thread::sleep(interval);
            interval = self.policy.grow(interval);
        }
    }
}
