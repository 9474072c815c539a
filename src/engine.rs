//! The external HTML→PDF engine seam.
//!
//! inkpress does not lay out or typeset HTML. The surrounding application
//! supplies an implementation of [`PdfEngine`] (WeasyPrint-class renderer,
//! wkhtmltopdf wrapper, a test fake, …). The pipeline relies on two
//! behaviours of that engine:
//!
//! * `<a>`/`<link rel="attachment">` elements with a `file://` target become
//!   clickable file annotations, and
//! * any `<a href>` with a custom URI scheme becomes a `/Link` annotation
//!   with a `/URI` action — the note post-processor consumes exactly those.

use crate::attach::AttachmentRecord;
use async_trait::async_trait;

/// Rendering parameters forwarded to the engine alongside the HTML.
#[derive(Debug, Clone, Default)]
pub struct PdfRequest {
    /// Base URL used to resolve relative resources.
    pub base_url: Option<String>,
    /// CSS media type hint, typically `"print"`.
    pub media_type: String,
    /// Text encoding of the HTML string.
    pub encoding: String,
    /// Files to embed into the PDF (not referenced from the markup).
    pub attachments: Vec<AttachmentRecord>,
}

/// Boxed error type for engine implementations outside this crate.
pub type PdfEngineError = Box<dyn std::error::Error + Send + Sync>;

/// The HTML→PDF engine contract. The engine is a black box: layout,
/// typesetting and PDF serialization are entirely its business.
#[async_trait]
pub trait PdfEngine: Send + Sync {
    /// Render serialized HTML into PDF bytes.
    async fn render_pdf(&self, html: &str, request: &PdfRequest) -> Result<Vec<u8>, PdfEngineError>;
}
