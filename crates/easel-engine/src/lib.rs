pub mod cancel;
pub mod client;
pub mod error;
pub mod orchestrator;
pub mod placeholder;
pub mod poller;
pub mod preprocess;
pub mod retrieve;
pub mod submit;

pub use cancel::CancelSignal;
pub use client::{
    CreatedJob, DownloadedImage, DryrunClient, GenerationClient, GenerationJob, GenerationOutput,
    HttpGenerationClient, InputImageMeta, JobStatus, UploadTarget,
};
pub use error::{RunError, RETRYABLE_DOWNLOAD_STATUSES};
pub use orchestrator::{
    GenerationOrchestrator, RawInputImage, RunConfig, RunOutcome, RunSettings,
};
pub use placeholder::{PlaceholderAnimator, PlaceholderSession, DEFAULT_TICK_PERIOD};
pub use poller::{JobPoller, PollPolicy};
pub use preprocess::{InputImagePreprocessor, DEFAULT_MAX_DIMENSION, DEFAULT_UPLOAD_CEILING};
pub use retrieve::{OutputRetriever, SavedOutput};
pub use submit::{BatchOutput, GenerationSubmitter};

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

pub(crate) fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
