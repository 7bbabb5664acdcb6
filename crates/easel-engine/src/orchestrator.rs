use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use uuid::Uuid;

use easel_contracts::canvas::CanvasSurface;
use easel_contracts::events::EventWriter;
use easel_contracts::models::{ModelCatalog, ModelSpec};
use easel_contracts::runs::request::{
    frame_for_aspect, GenerationRequest, PreparedInputImage, MAX_IMAGES_PER_RUN,
    MIN_IMAGES_PER_RUN,
};

use crate::cancel::CancelSignal;
use crate::client::{GenerationClient, InputImageMeta};
use crate::error::RunError;
use crate::map_object;
use crate::placeholder::{PhaseHandle, PlaceholderAnimator, DEFAULT_TICK_PERIOD};
use crate::poller::PollPolicy;
use crate::preprocess::{InputImagePreprocessor, DEFAULT_MAX_DIMENSION, DEFAULT_UPLOAD_CEILING};
use crate::retrieve::{OutputRetriever, SavedOutput, SidecarContext};
use crate::submit::GenerationSubmitter;
use crate::timestamp_millis;

/// Per-run knobs. Everything else comes from the model catalog.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub output_dir: PathBuf,
    pub upload_ceiling: u64,
    pub max_input_dimension: u32,
    pub max_input_images: usize,
    pub frame_base_width: f64,
    pub tick_period: Duration,
    pub poll: PollPolicy,
    pub refresh_poll: PollPolicy,
}

impl RunSettings {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            upload_ceiling: DEFAULT_UPLOAD_CEILING,
            max_input_dimension: DEFAULT_MAX_DIMENSION,
            max_input_images: 6,
            frame_base_width: 360.0,
            tick_period: DEFAULT_TICK_PERIOD,
            poll: PollPolicy::primary(),
            refresh_poll: PollPolicy::refresh(),
        }
    }
}

/// An input image as handed over by the caller, not yet normalized.
#[derive(Debug, Clone)]
pub struct RawInputImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// The configuration surface of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model: String,
    pub prompt: String,
    pub count: u64,
    pub aspect_ratio: Option<String>,
    pub seed: Option<i64>,
    pub inputs: Vec<RawInputImage>,
}

/// Completed run. Fewer saved outputs than requested is not an error; the
/// shortfall is reported here.
#[derive(Debug)]
pub struct RunOutcome {
    pub saved: Vec<SavedOutput>,
    pub requested: u64,
}

impl RunOutcome {
    pub fn shortfall(&self) -> u64 {
        self.requested.saturating_sub(self.saved.len() as u64)
    }
}

/// Top-level run state machine: placeholder setup, input preparation, the
/// submit/poll/retrieve loop, then placeholder replacement or rollback.
pub struct GenerationOrchestrator {
    client: Arc<dyn GenerationClient>,
    canvas: Arc<dyn CanvasSurface>,
    catalog: ModelCatalog,
    settings: RunSettings,
}

impl GenerationOrchestrator {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        canvas: Arc<dyn CanvasSurface>,
        catalog: ModelCatalog,
        settings: RunSettings,
    ) -> Self {
        Self {
            client,
            canvas,
            catalog,
            settings,
        }
    }

    pub fn run(
        &self,
        anchor: &str,
        config: RunConfig,
        cancel: &CancelSignal,
        mut on_status: Option<&mut dyn FnMut(&str)>,
    ) -> Result<RunOutcome> {
        let run_id = format!("run-{}", Uuid::new_v4());
        fs::create_dir_all(&self.settings.output_dir)?;
        let events = EventWriter::new(
            self.settings.output_dir.join("events.jsonl"),
            run_id.clone(),
        );
        let _ = events.emit(
            "run_started",
            map_object(json!({
                "anchor": anchor,
                "model": config.model,
                "prompt": config.prompt,
            })),
        );

        let result =
            self.run_with_rollback(anchor, &config, &run_id, &events, cancel, &mut on_status);
        match &result {
            Ok(outcome) => {
                let _ = events.emit(
                    "run_finished",
                    map_object(json!({
                        "saved": outcome.saved.len(),
                        "requested": outcome.requested,
                    })),
                );
            }
            Err(err) => {
                let _ = events.emit(
                    "run_failed",
                    map_object(json!({
                        "error": format!("{err:#}"),
                        "aborted": RunError::is_aborted(err),
                    })),
                );
            }
        }
        result
    }

    fn run_with_rollback(
        &self,
        anchor: &str,
        config: &RunConfig,
        run_id: &str,
        events: &EventWriter,
        cancel: &CancelSignal,
        on_status: &mut Option<&mut dyn FnMut(&str)>,
    ) -> Result<RunOutcome> {
        let model = self
            .catalog
            .get(&config.model)
            .cloned()
            .ok_or_else(|| RunError::Configuration(format!("unknown model '{}'", config.model)))?;
        if config.inputs.len() > self.settings.max_input_images {
            return Err(RunError::Validation(format!(
                "{} input images exceed the limit of {}",
                config.inputs.len(),
                self.settings.max_input_images
            ))
            .into());
        }
        if !model.accepts_input_images && !config.inputs.is_empty() {
            return Err(RunError::Validation(format!(
                "model '{}' does not accept input images",
                model.slug
            ))
            .into());
        }
        let count = config.count.clamp(MIN_IMAGES_PER_RUN, MAX_IMAGES_PER_RUN);
        let aspect = config
            .aspect_ratio
            .clone()
            .or_else(|| model.default_aspect_ratio.clone());

        let frame = frame_for_aspect(aspect.as_deref(), self.settings.frame_base_width);
        let slots = self
            .canvas
            .compute_next_free_slot(anchor, count as usize, frame)?;
        let animator =
            PlaceholderAnimator::new(Arc::clone(&self.canvas), self.settings.tick_period);
        let session = animator.start(anchor, &slots)?;
        let phase = session.phase_handle();

        // The single broad catch: placeholders roll back before any error,
        // including Aborted, propagates to the caller.
        match self.run_inner(
            config,
            &model,
            count,
            aspect.as_deref(),
            run_id,
            events,
            &phase,
            on_status,
            cancel,
        ) {
            Ok(saved) => {
                let outcome = RunOutcome {
                    requested: count,
                    saved,
                };
                animator.replace(session, &outcome.saved)?;
                Ok(outcome)
            }
            Err(err) => {
                let _ = animator.remove(session);
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_inner(
        &self,
        config: &RunConfig,
        model: &ModelSpec,
        count: u64,
        aspect: Option<&str>,
        run_id: &str,
        events: &EventWriter,
        phase: &PhaseHandle,
        on_status: &mut Option<&mut dyn FnMut(&str)>,
        cancel: &CancelSignal,
    ) -> Result<Vec<SavedOutput>> {
        if !config.inputs.is_empty() {
            emit_status(events, phase, on_status, "preparing input images...");
        }
        let preprocessor = InputImagePreprocessor::new(
            self.settings.upload_ceiling,
            self.settings.max_input_dimension,
        );
        let mut prepared = Vec::with_capacity(config.inputs.len());
        for input in &config.inputs {
            prepared.push(preprocessor.prepare(input.bytes.clone(), &input.mime_type)?);
        }
        let request = GenerationRequest::new(
            model.slug.clone(),
            config.prompt.clone(),
            count,
            aspect.map(str::to_string),
            config.seed,
            prepared,
        );

        let input_refs = if request.input_images().is_empty() {
            Vec::new()
        } else {
            emit_status(events, phase, on_status, "uploading input images...");
            self.upload_inputs(request.input_images(), cancel)?
        };

        let submitter = GenerationSubmitter::new(self.client.as_ref(), self.settings.poll);
        let outputs = submitter.submit_batch(
            &request,
            &input_refs,
            model.max_images_per_job(),
            run_id,
            cancel,
            &mut |raw| emit_status(events, phase, on_status, raw),
        )?;

        let digests = request.input_digests();
        let sidecar = SidecarContext {
            prompt: request.prompt(),
            model: request.model(),
            seed: request.seed(),
            input_digests: &digests,
        };
        let retriever = OutputRetriever::new(self.client.as_ref(), self.settings.refresh_poll);
        let stamp = timestamp_millis();
        let mut saved = Vec::with_capacity(outputs.len());
        for (position, batch) in outputs.iter().enumerate() {
            emit_status(
                events,
                phase,
                on_status,
                &format!(
                    "downloading generated image ({}/{})...",
                    position + 1,
                    outputs.len()
                ),
            );
            let item = retriever.save(
                &batch.output,
                &batch.job_id,
                batch.poll_url.as_deref(),
                &self.settings.output_dir,
                stamp,
                &sidecar,
                cancel,
            )?;
            let _ = events.emit(
                "output_saved",
                map_object(json!({
                    "index": item.output.index,
                    "path": item.path.to_string_lossy(),
                })),
            );
            saved.push(item);
        }

        emit_status(events, phase, on_status, "finishing up...");
        Ok(saved)
    }

    /// Hand input images to the provider, either as out-of-band uploads or,
    /// when the backend declines, as inline data URLs. Echoed upload
    /// metadata must match the local image before its reference is trusted.
    fn upload_inputs(
        &self,
        images: &[PreparedInputImage],
        cancel: &CancelSignal,
    ) -> Result<Vec<String>> {
        let metas: Vec<InputImageMeta> = images
            .iter()
            .map(|image| InputImageMeta {
                mime_type: image.mime_type().to_string(),
                byte_size: image.byte_size(),
                digest: image.digest().to_string(),
            })
            .collect();
        cancel.check()?;
        let targets = self.client.prepare_uploads(&metas)?;
        if targets.is_empty() {
            return Ok(images
                .iter()
                .map(|image| {
                    format!(
                        "data:{};base64,{}",
                        image.mime_type(),
                        BASE64.encode(image.bytes())
                    )
                })
                .collect());
        }

        if targets.len() != images.len() {
            return Err(RunError::TerminalProvider(format!(
                "provider prepared {} upload targets for {} images",
                targets.len(),
                images.len()
            ))
            .into());
        }
        let mut refs = Vec::with_capacity(images.len());
        for (image, target) in images.iter().zip(&targets) {
            if target.digest != image.digest()
                || target.byte_size != image.byte_size()
                || target.mime_type != image.mime_type()
            {
                return Err(RunError::TerminalProvider(format!(
                    "upload target does not match input image {}",
                    image.digest()
                ))
                .into());
            }
            cancel.check()?;
            self.client.upload_prepared(target, image.bytes())?;
            refs.push(target.reference.clone());
        }
        Ok(refs)
    }
}

/// Fan one raw status string out to the placeholder session, the external
/// callback, and the run log.
fn emit_status(
    events: &EventWriter,
    phase: &PhaseHandle,
    on_status: &mut Option<&mut dyn FnMut(&str)>,
    raw: &str,
) {
    phase.set(raw);
    if let Some(callback) = on_status.as_mut() {
        callback(raw);
    }
    let _ = events.emit("status", map_object(json!({ "text": raw })));
}
