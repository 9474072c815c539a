//! Top-level conversion orchestration.
//!
//! [`Converter`] wires the pipeline stages together for one document:
//!
//! 1. parse the HTML once,
//! 2. extract note trees and plant marker links,
//! 3. rewrite top-level inline SVGs into data-URI images,
//! 4. rasterise SVG candidates through the render backend,
//! 5. convert VSDX diagrams through the office subprocess,
//! 6. resolve attachment links,
//! 7. serialize and hand the HTML to the external PDF engine,
//! 8. rewrite marker links in the PDF into native sticky notes.
//!
//! Degradation policy: a failed image stays in its pre-render form; only
//! engine failures (and, opt-in, render failures under
//! `fail_on_image_error`) fail the request.
//!
//! The returned futures are not `Send`: the document tree is `Rc`-based.
//! Drive a conversion on a current-thread runtime or inside
//! `tokio::task::LocalSet`, one task per request.

use crate::annot::{self, NoteIcon};
use crate::attach::{self, AttachmentRecord, Upload};
use crate::backend::{OfficeConverter, RenderBackend};
use crate::config::ConvertOptions;
use crate::dom::HtmlDocument;
use crate::engine::{PdfEngine, PdfRequest};
use crate::error::Error;
use crate::pipeline::{extract, notes, raster, vsdx, Note};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters and timings for one conversion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionStats {
    pub inline_svgs_rewritten: usize,
    pub images_found: usize,
    pub images_converted: usize,
    pub images_skipped: usize,
    pub vsdx_converted: usize,
    pub vsdx_skipped: usize,
    pub notes_found: usize,
    pub attachments_embedded: usize,
    pub render_duration_ms: u64,
    pub pdf_duration_ms: u64,
    pub annotation_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// Result of the HTML-only half of the pipeline.
pub struct PreprocessedDocument {
    pub html: String,
    pub notes: Vec<Note>,
    pub stats: ConversionStats,
}

/// Result of a full conversion.
#[derive(Debug)]
pub struct ConversionOutput {
    pub pdf: Vec<u8>,
    pub notes: Vec<Note>,
    pub stats: ConversionStats,
}

/// The pipeline orchestrator. One per worker, explicitly constructed with
/// its backend and office converter — no hidden global state.
pub struct Converter {
    backend: Arc<RenderBackend>,
    office: Arc<OfficeConverter>,
    options: ConvertOptions,
    note_icon: Option<NoteIcon>,
}

impl Converter {
    pub fn new(
        backend: Arc<RenderBackend>,
        office: Arc<OfficeConverter>,
        options: ConvertOptions,
    ) -> Self {
        let note_icon = options.note_icon.as_deref().and_then(NoteIcon::load);
        Converter {
            backend,
            office,
            options,
            note_icon,
        }
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    pub fn backend(&self) -> &Arc<RenderBackend> {
        &self.backend
    }

    /// Run the HTML normalization pipeline without producing a PDF.
    pub async fn preprocess(&self, html: &str) -> Result<PreprocessedDocument, Error> {
        let total_start = Instant::now();
        let doc = HtmlDocument::parse(html);
        let mut stats = ConversionStats::default();
        let notes = self.run_html_stages(&doc, &mut stats).await?;
        let html = doc.serialize();
        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
        Ok(PreprocessedDocument { html, notes, stats })
    }

    /// Convert HTML (plus uploaded files) to the final PDF.
    ///
    /// `attachment_dir` is the request-scoped directory uploads are
    /// persisted into; the caller owns and deletes it (a
    /// [`tempfile::TempDir`] is the usual choice).
    pub async fn convert(
        &self,
        html: &str,
        uploads: &[Upload],
        attachment_dir: &std::path::Path,
        engine: &dyn PdfEngine,
    ) -> Result<ConversionOutput, Error> {
        let total_start = Instant::now();
        info!(bytes = html.len(), uploads = uploads.len(), "starting conversion");

        let doc = HtmlDocument::parse(html);
        let mut stats = ConversionStats::default();

        // ── HTML stages ──────────────────────────────────────────────────
        let notes = self.run_html_stages(&doc, &mut stats).await?;

        let attachments: Vec<AttachmentRecord> = if uploads.is_empty() {
            Vec::new()
        } else {
            attach::resolve_attachments(&doc, attachment_dir, uploads).await?
        };
        stats.attachments_embedded = attachments.len();

        let processed_html = doc.serialize();

        // ── External PDF engine ──────────────────────────────────────────
        let pdf_start = Instant::now();
        let request = PdfRequest {
            base_url: self.options.base_url.clone(),
            media_type: self.options.media_type.clone(),
            encoding: self.options.encoding.clone(),
            attachments,
        };
        let pdf = engine
            .render_pdf(&processed_html, &request)
            .await
            .map_err(Error::PdfEngine)?;
        stats.pdf_duration_ms = pdf_start.elapsed().as_millis() as u64;
        info!(bytes = pdf.len(), "PDF generated");

        // ── Annotation post-processing ───────────────────────────────────
        let annot_start = Instant::now();
        let pdf = annot::attach_notes(&pdf, &notes, self.note_icon.as_ref())?;
        stats.annotation_duration_ms = annot_start.elapsed().as_millis() as u64;

        stats.total_duration_ms = total_start.elapsed().as_millis() as u64;
        info!(
            images = stats.images_converted,
            notes = stats.notes_found,
            total_ms = stats.total_duration_ms,
            "conversion complete"
        );

        Ok(ConversionOutput { pdf, notes, stats })
    }

    /// Stages 2–5: notes, inline SVG rewrite, rasterisation, VSDX.
    async fn run_html_stages(
        &self,
        doc: &HtmlDocument,
        stats: &mut ConversionStats,
    ) -> Result<Vec<Note>, Error> {
        let extracted_notes = notes::extract_notes(doc);
        stats.notes_found = extracted_notes.len();
        debug!(count = extracted_notes.len(), "note trees extracted");

        stats.inline_svgs_rewritten = extract::replace_inline_svgs(doc);

        let scan = extract::scan_svg_candidates(doc);
        stats.images_found = scan.candidates.len() + scan.skipped.len();
        stats.images_skipped += scan.skipped.len();

        let render_start = Instant::now();
        let scale = self
            .options
            .scale_factor
            .unwrap_or(self.backend.config().scale_factor);
        let report = raster::convert_candidates(
            &self.backend,
            scan.candidates,
            scale,
            self.options.clip_compensation_px,
        )
        .await;
        stats.render_duration_ms = render_start.elapsed().as_millis() as u64;
        stats.images_converted = report.converted;
        stats.images_skipped += report.skipped.len();

        if self.options.fail_on_image_error {
            if let Some(failure) = report.backend_failures().next() {
                return Err(Error::ImageConversionRequired(failure.to_string()));
            }
        } else {
            for failure in report.backend_failures() {
                warn!(%failure, "image left unconverted");
            }
        }

        let vsdx_report = vsdx::convert_vsdx_images(doc, &self.office).await;
        stats.vsdx_converted = vsdx_report.converted;
        stats.vsdx_skipped = vsdx_report.skipped.len();

        Ok(extracted_notes)
    }
}
