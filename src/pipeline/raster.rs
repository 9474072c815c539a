//! SVG rasterisation stage: plan → render → crop → splice.
//!
//! Planning and splicing touch the document tree and run sequentially;
//! the renders in between operate on owned byte payloads and run
//! concurrently up to the backend's semaphore size. Ordering across images
//! carries no meaning — each render mutates only its own node.
//!
//! The render request adds `clip_compensation` extra pixels of height (the
//! headless browser clips the bottom edge of exact-height viewports) and
//! the excess, scaled by the device scale factor, is cropped off the
//! result. The compensation value is a backend quirk knob, not semantics.

use crate::backend::{RenderBackend, RenderRequest};
use crate::error::SkipReason;
use crate::pipeline::extract::{DataUri, EmbeddedImage, PNG_MIME};
use crate::svg::PixelSize;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, StreamExt};
use image::ImageFormat;
use std::io::Cursor;
use tracing::{debug, warn};

/// What one pipeline stage did to the document.
#[derive(Debug, Default)]
pub struct StageReport {
    pub converted: usize,
    pub skipped: Vec<SkipReason>,
}

impl StageReport {
    pub fn skip(&mut self, reason: SkipReason) {
        self.skipped.push(reason);
    }

    /// Backend-shaped failures, the only ones `fail_on_image_error` escalates.
    pub fn backend_failures(&self) -> impl Iterator<Item = &SkipReason> {
        self.skipped.iter().filter(|s| s.is_backend_failure())
    }
}

struct RenderJob {
    image: EmbeddedImage,
    size: PixelSize,
}

/// Rasterise every SVG candidate in place.
pub async fn convert_candidates(
    backend: &RenderBackend,
    candidates: Vec<EmbeddedImage>,
    scale_factor: f64,
    clip_compensation_px: u32,
) -> StageReport {
    let mut report = StageReport::default();

    // Plan: resolve dimensions; failures leave the node untouched.
    let mut jobs: Vec<RenderJob> = Vec::with_capacity(candidates.len());
    for mut image in candidates {
        image.svg.ensure_namespace();
        match image.svg.resolve_dimensions() {
            Ok(Some(size)) => jobs.push(RenderJob { image, size }),
            Ok(None) => {
                warn!("invalid or undefined dimensions for SVG, leaving image unchanged");
                report.skip(SkipReason::DimensionsUnresolved);
            }
            Err(unit_err) => {
                warn!(error = %unit_err, "dimension resolution failed, leaving image unchanged");
                report.skip(SkipReason::Unit(unit_err));
            }
        }
    }
    if jobs.is_empty() {
        return report;
    }

    // Render: concurrent over owned payloads; the backend's own semaphore
    // is the second (process-wide) bound.
    let concurrency = backend.config().max_concurrent_renders;
    let crop_px = effective_crop(clip_compensation_px, scale_factor);
    let outcomes: Vec<(usize, Result<Vec<u8>, SkipReason>)> = stream::iter(
        jobs.iter().enumerate().map(|(index, job)| {
            let request = RenderRequest {
                content: job.image.svg.text_bytes(),
                width: job.size.width,
                height: job.size.height + clip_compensation_px,
                scale_factor,
            };
            async move { (index, render_and_crop(backend, request, crop_px).await) }
        }),
    )
    .buffer_unordered(concurrency)
    .collect()
    .await;

    // Splice: sequential tree mutation.
    for (index, outcome) in outcomes {
        let job = &jobs[index];
        match outcome {
            Ok(png) => match splice(&job.image, &png, job.size.width) {
                Ok(()) => report.converted += 1,
                Err(reason) => {
                    debug!(%reason, "render result not spliced");
                    report.skip(reason);
                }
            },
            Err(reason) => {
                warn!(%reason, "leaving image in pre-render form");
                report.skip(reason);
            }
        }
    }

    report
}

/// Pixels to crop off the bottom of the rendered raster.
fn effective_crop(clip_compensation_px: u32, scale_factor: f64) -> u32 {
    if clip_compensation_px == 0 {
        0
    } else {
        ((clip_compensation_px as f64 * scale_factor).round() as u32).max(1)
    }
}

async fn render_and_crop(
    backend: &RenderBackend,
    request: RenderRequest,
    crop_px: u32,
) -> Result<Vec<u8>, SkipReason> {
    let rendered = backend
        .convert_to_raster(&request)
        .await
        .map_err(|e| SkipReason::RenderFailed(e.to_string()))?;
    crop_bottom(&rendered.bytes, crop_px)
}

/// Remove `crop_px` rows from the bottom of a PNG.
fn crop_bottom(png: &[u8], crop_px: u32) -> Result<Vec<u8>, SkipReason> {
    if crop_px == 0 {
        return Ok(png.to_vec());
    }
    let decoded =
        image::load_from_memory(png).map_err(|e| SkipReason::CropFailed(e.to_string()))?;
    let (width, height) = (decoded.width(), decoded.height());
    if crop_px >= height {
        return Err(SkipReason::CropFailed(format!(
            "cannot crop {crop_px}px from a {height}px-tall image"
        )));
    }
    let cropped = decoded.crop_imm(0, 0, width, height - crop_px);
    let mut out = Vec::new();
    cropped
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| SkipReason::CropFailed(e.to_string()))?;
    Ok(out)
}

/// Rewrite the `<img>` node with the rendered PNG, propagating the resolved
/// pixel width into the `width` attribute and inline style so the final
/// layout matches the original vector size.
fn splice(image: &EmbeddedImage, png: &[u8], width: u32) -> Result<(), SkipReason> {
    let replacement_b64 = STANDARD.encode(png);
    if replacement_b64 == image.payload_b64 {
        // A backend no-op must not be mistaken for a conversion.
        return Err(SkipReason::UnchangedOutput);
    }

    let Some(el) = image.node.as_element() else {
        return Err(SkipReason::RenderFailed("img node vanished".into()));
    };
    let mut attrs = el.attributes.borrow_mut();
    attrs.insert("src", DataUri::format(PNG_MIME, &replacement_b64));
    attrs.insert("width", format!("{width}px"));

    let style = attrs.get("style").unwrap_or("").to_string();
    let mut parts: Vec<String> = style
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.to_ascii_lowercase().starts_with("width:"))
        .map(str::to_string)
        .collect();
    parts.push(format!("width: {width}px"));
    attrs.insert("style", parts.join("; "));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn png_of(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([1, 2, 3, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    #[test]
    fn crop_removes_exactly_the_requested_rows() {
        let png = png_of(30, 120);
        let cropped = crop_bottom(&png, 100).unwrap();
        let reloaded = image::load_from_memory(&cropped).unwrap();
        assert_eq!(reloaded.width(), 30);
        assert_eq!(reloaded.height(), 20);
    }

    #[test]
    fn crop_of_zero_is_identity() {
        let png = png_of(8, 8);
        assert_eq!(crop_bottom(&png, 0).unwrap(), png);
    }

    #[test]
    fn crop_larger_than_image_fails() {
        let png = png_of(10, 50);
        let err = crop_bottom(&png, 50).unwrap_err();
        assert!(matches!(err, SkipReason::CropFailed(_)));
    }

    #[test]
    fn effective_crop_scales_and_floors_at_one() {
        assert_eq!(effective_crop(100, 1.0), 100);
        assert_eq!(effective_crop(100, 2.0), 200);
        assert_eq!(effective_crop(1, 0.1), 1); // never zero once enabled
        assert_eq!(effective_crop(0, 4.0), 0);
    }

    #[test]
    fn splice_updates_src_width_and_style() {
        use crate::dom::HtmlDocument;
        use crate::svg::SvgDocument;

        let doc = HtmlDocument::parse(
            r#"<img src="data:image/svg+xml;base64,AAA" style="border: 1px; width: 7px">"#,
        );
        let node = doc.root().select_first("img").unwrap().as_node().clone();
        let image = EmbeddedImage {
            node,
            content_type: "image/svg+xml".into(),
            payload_b64: "AAA".into(),
            svg: SvgDocument::parse("<svg></svg>").unwrap(),
        };

        splice(&image, &png_of(4, 4), 300).unwrap();

        let attrs = image.node.as_element().unwrap().attributes.borrow();
        assert!(attrs.get("src").unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(attrs.get("width").unwrap(), "300px");
        let style = attrs.get("style").unwrap();
        assert!(style.contains("border: 1px"), "got: {style}");
        assert!(style.contains("width: 300px"), "got: {style}");
        assert!(!style.contains("width: 7px"), "got: {style}");
    }

    #[test]
    fn splice_detects_backend_noop() {
        use crate::dom::HtmlDocument;
        use crate::svg::SvgDocument;

        let png = png_of(2, 2);
        let payload = STANDARD.encode(&png);
        let doc = HtmlDocument::parse(&format!(
            r#"<img src="data:image/svg+xml;base64,{payload}">"#
        ));
        let node = doc.root().select_first("img").unwrap().as_node().clone();
        let image = EmbeddedImage {
            node,
            content_type: "image/svg+xml".into(),
            payload_b64: payload,
            svg: SvgDocument::parse("<svg></svg>").unwrap(),
        };

        let err = splice(&image, &png, 2).unwrap_err();
        assert_eq!(err, SkipReason::UnchangedOutput);
    }
}
