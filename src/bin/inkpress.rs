//! CLI binary for inkpress.
//!
//! A thin debug tool over the library crate: run the HTML normalization
//! pipeline against a real Chromium backend, or apply the annotation
//! post-processor to an existing PDF.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use inkpress::{
    attach_notes, BackendConfig, ChromiumEngine, ConvertOptions, Converter, Note, NoteIcon,
    OfficeConverter, RenderBackend,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "inkpress", version, about = "HTML image-normalization and PDF annotation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTML pipeline (notes, SVG rasterisation, VSDX) and write the
    /// processed HTML plus a notes sidecar.
    Preprocess {
        /// Input HTML file.
        input: PathBuf,

        /// Output HTML file (default: `<input>.processed.html`).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Notes sidecar JSON file (default: `<input>.notes.json`).
        #[arg(long)]
        notes: Option<PathBuf>,

        /// Chromium executable (default: `CHROMIUM_EXECUTABLE_PATH`).
        #[arg(long, env = "CHROMIUM_EXECUTABLE_PATH")]
        chromium: Option<PathBuf>,

        /// Device scale factor (1.0–10.0).
        #[arg(long)]
        scale: Option<f64>,
    },

    /// Rewrite marker links in an existing PDF into sticky-note annotations
    /// using a notes sidecar produced by `preprocess`.
    Annotate {
        /// Input PDF file.
        input: PathBuf,

        /// Notes sidecar JSON file.
        #[arg(long)]
        notes: PathBuf,

        /// Output PDF file (default: `<input>.annotated.pdf`).
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// PNG icon for annotation appearance streams.
        #[arg(long)]
        icon: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    // The pipeline futures are not Send (Rc-based DOM); a current-thread
    // runtime drives them fine.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Preprocess {
            input,
            output,
            notes,
            chromium,
            scale,
        } => preprocess(input, output, notes, chromium, scale).await,
        Command::Annotate {
            input,
            notes,
            output,
            icon,
        } => annotate(input, notes, output, icon),
    }
}

async fn preprocess(
    input: PathBuf,
    output: Option<PathBuf>,
    notes_path: Option<PathBuf>,
    chromium: Option<PathBuf>,
    scale: Option<f64>,
) -> Result<()> {
    let html = std::fs::read_to_string(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;

    let engine = match chromium {
        Some(path) => ChromiumEngine::new(path),
        None => ChromiumEngine::from_env().context("no Chromium executable configured")?,
    };
    let backend = Arc::new(RenderBackend::new(Arc::new(engine), BackendConfig::default()));
    backend.start().await.context("failed to start Chromium")?;

    let office = Arc::new(OfficeConverter::detect(Duration::from_secs(30)).await);

    let mut options = ConvertOptions::builder();
    if let Some(scale) = scale {
        options = options.scale_factor(scale);
    }
    let converter = Converter::new(backend.clone(), office, options.build()?);

    let result = converter.preprocess(&html).await;
    backend.stop().await.ok();
    let processed = result?;

    let output = output.unwrap_or_else(|| input.with_extension("processed.html"));
    std::fs::write(&output, &processed.html)
        .with_context(|| format!("failed to write {}", output.display()))?;

    let notes_path = notes_path.unwrap_or_else(|| input.with_extension("notes.json"));
    std::fs::write(&notes_path, serde_json::to_vec_pretty(&processed.notes)?)
        .with_context(|| format!("failed to write {}", notes_path.display()))?;

    eprintln!(
        "{}: {} inline SVGs rewritten, {}/{} images converted, {} notes → {}",
        input.display(),
        processed.stats.inline_svgs_rewritten,
        processed.stats.images_converted,
        processed.stats.images_found,
        processed.stats.notes_found,
        output.display(),
    );
    Ok(())
}

fn annotate(
    input: PathBuf,
    notes_path: PathBuf,
    output: Option<PathBuf>,
    icon: Option<PathBuf>,
) -> Result<()> {
    let pdf = std::fs::read(&input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let notes: Vec<Note> = serde_json::from_slice(
        &std::fs::read(&notes_path)
            .with_context(|| format!("failed to read {}", notes_path.display()))?,
    )
    .context("notes sidecar is not valid JSON")?;

    let icon = icon.as_deref().and_then(NoteIcon::load);
    let annotated = attach_notes(&pdf, &notes, icon.as_ref())?;

    let output = output.unwrap_or_else(|| input.with_extension("annotated.pdf"));
    std::fs::write(&output, &annotated)
        .with_context(|| format!("failed to write {}", output.display()))?;

    eprintln!(
        "{}: {} note trees applied → {}",
        input.display(),
        notes.len(),
        output.display(),
    );
    Ok(())
}
