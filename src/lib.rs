//! # inkpress
//!
//! Image-normalization and annotation pipeline for HTML→PDF conversion.
//!
//! ## What it does
//!
//! HTML destined for a PDF engine routinely carries content the engine
//! renders poorly or not at all: inline SVG with viewport-relative sizing,
//! base64 SVG images with mislabeled MIME types, Visio (VSDX) diagrams, and
//! structured "sticky note" markup. This crate normalizes all of that
//! before the engine runs, and post-processes the engine's output so note
//! markup becomes real, nested PDF annotations.
//!
//! ## Pipeline overview
//!
//! ```text
//! HTML
//!  │
//!  ├─ 1. Notes     note markup → Note trees + invisible marker links
//!  ├─ 2. Extract   top-level inline <svg> → <img data:image/svg+xml;…>
//!  ├─ 3. Raster    data-URI SVGs → PNG via managed headless Chromium
//!  │               (dimension resolution, bounded concurrency, retry,
//!  │                automatic backend restart)
//!  ├─ 4. VSDX      Visio diagrams → PNG via office subprocess
//!  ├─ 5. Attach    rel="attachment" links → file:// URIs + embed records
//!  ├─ 6. Engine    external HTML→PDF engine (caller-provided seam)
//!  └─ 7. Annotate  marker /Link annotations → nested /Text sticky notes
//!                  with /IRT reply chains and icon appearance streams
//! ```
//!
//! Failure philosophy: best effort. An image that cannot be converted is
//! left in its pre-render form; a note that cannot get its icon becomes a
//! plain annotation; the request only fails when the PDF engine itself
//! does (or when `fail_on_image_error` says image fidelity is mandatory).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use inkpress::{
//!     BackendConfig, ChromiumEngine, ConvertOptions, Converter, OfficeConverter, RenderBackend,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run(engine: impl inkpress::PdfEngine) -> Result<(), Box<dyn std::error::Error>> {
//! let chromium = Arc::new(ChromiumEngine::from_env()?);
//! let backend = Arc::new(RenderBackend::new(chromium, BackendConfig::default()));
//! backend.start().await?;
//!
//! let office = Arc::new(OfficeConverter::detect(Duration::from_secs(30)).await);
//! let converter = Converter::new(backend.clone(), office, ConvertOptions::default());
//!
//! let workspace = tempfile::tempdir()?;
//! let output = converter
//!     .convert("<svg viewBox=\"0 0 300 150\"></svg>", &[], workspace.path(), &engine)
//!     .await?;
//! std::fs::write("out.pdf", &output.pdf)?;
//!
//! backend.stop().await?;
//! # Ok(())
//! # }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod annot;
pub mod attach;
pub mod backend;
pub mod config;
pub mod convert;
pub mod dom;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod svg;
pub mod units;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use annot::{attach_notes, format_pdf_date, NoteIcon};
pub use attach::{AttachmentRecord, Upload};
pub use backend::{
    BackendConfig, BackendState, ChromiumEngine, MetricsSnapshot, OfficeConverter, RasterEngine,
    RenderBackend, RenderRequest, RenderedImage,
};
pub use config::{ConvertOptions, ConvertOptionsBuilder};
pub use convert::{ConversionOutput, ConversionStats, Converter, PreprocessedDocument};
pub use dom::HtmlDocument;
pub use engine::{PdfEngine, PdfEngineError, PdfRequest};
pub use error::{AnnotError, BackendError, EngineError, Error, SkipReason, UnitError, VsdxError};
pub use pipeline::Note;
pub use svg::{PixelSize, SvgDocument};
pub use units::{px_ratio, resolve_px, Length, ViewBox};
