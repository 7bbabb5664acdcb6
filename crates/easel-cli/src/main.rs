use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use easel_contracts::models::ModelCatalog;
use easel_engine::{
    CancelSignal, DryrunClient, GenerationClient, GenerationOrchestrator, HttpGenerationClient,
    RawInputImage, RunConfig, RunSettings,
};

mod canvas;

use canvas::JsonCanvas;

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Prompt-to-image generation for canvas documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a generation against a canvas document.
    Generate(GenerateArgs),
    /// List the model catalog.
    Models,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    /// Canvas document to read and update.
    #[arg(long)]
    canvas: PathBuf,
    /// Node id the run is anchored to.
    #[arg(long)]
    anchor: String,
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = "gpt-image-1")]
    model: String,
    /// Desired image count, clamped to 1-4.
    #[arg(long, default_value_t = 1)]
    count: u64,
    #[arg(long)]
    seed: Option<i64>,
    /// Aspect ratio, e.g. "16:9".
    #[arg(long)]
    aspect: Option<String>,
    /// Input image paths, repeatable.
    #[arg(long = "input")]
    inputs: Vec<PathBuf>,
    /// Directory for saved outputs, sidecars, and the run log.
    #[arg(long)]
    out: PathBuf,
    /// Use the offline dryrun backend instead of the HTTP provider.
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Generate(args) => run_generate(args),
        Command::Models => {
            run_models();
            Ok(0)
        }
    }
}

fn run_models() {
    for spec in ModelCatalog::default().list() {
        let inputs = if spec.accepts_input_images {
            ", accepts input images"
        } else {
            ""
        };
        println!(
            "{:<24} {:<24} up to {} per job{}",
            spec.slug,
            spec.label,
            spec.max_images_per_job(),
            inputs
        );
    }
}

fn run_generate(args: GenerateArgs) -> Result<i32> {
    let canvas = Arc::new(JsonCanvas::open(&args.canvas)?);
    let client: Arc<dyn GenerationClient> = if args.dryrun {
        Arc::new(DryrunClient::new())
    } else {
        Arc::new(HttpGenerationClient::new())
    };

    let mut inputs = Vec::with_capacity(args.inputs.len());
    for path in &args.inputs {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        inputs.push(RawInputImage {
            bytes,
            mime_type: guess_image_mime(path).to_string(),
        });
    }

    let orchestrator = GenerationOrchestrator::new(
        client,
        canvas.clone(),
        ModelCatalog::default(),
        RunSettings::new(&args.out),
    );
    let cancel = CancelSignal::new();
    let outcome = orchestrator.run(
        &args.anchor,
        RunConfig {
            model: args.model,
            prompt: args.prompt,
            count: args.count,
            aspect_ratio: args.aspect,
            seed: args.seed,
            inputs,
        },
        &cancel,
        Some(&mut |raw: &str| println!("  {raw}")),
    )?;

    for item in &outcome.saved {
        println!("saved {}", item.path.display());
    }
    if outcome.shortfall() > 0 {
        eprintln!(
            "warning: saved {} of {} requested images",
            outcome.saved.len(),
            outcome.requested
        );
    }
    Ok(0)
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "image/png",
    }
}
