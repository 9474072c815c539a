//! VSDX conversion stage.
//!
//! Visio diagrams arrive as `data:application/vnd.ms-visio.drawing;base64,…`
//! image sources. When a diagram-capable office subprocess was detected at
//! startup, each payload is converted to PNG in place; otherwise the whole
//! stage is skipped for the process lifetime — no per-request probing.
//!
//! Conversions run sequentially: the office subprocess serializes internally
//! anyway, and diagram counts per document are small.

use crate::backend::OfficeConverter;
use crate::dom::HtmlDocument;
use crate::error::SkipReason;
use crate::pipeline::extract::{DataUri, PNG_MIME, VSDX_MIME};
use crate::pipeline::raster::StageReport;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use kuchiki::NodeRef;
use tracing::{debug, warn};

/// Convert every VSDX data-URI image in the document.
pub async fn convert_vsdx_images(doc: &HtmlDocument, office: &OfficeConverter) -> StageReport {
    let mut report = StageReport::default();

    let targets: Vec<(NodeRef, DataUri)> = collect_vsdx_images(doc);
    if targets.is_empty() {
        return report;
    }

    if !office.is_available() {
        warn!(
            count = targets.len(),
            "office subprocess unavailable, skipping VSDX conversion"
        );
        for _ in &targets {
            report.skip(SkipReason::VsdxUnavailable);
        }
        return report;
    }

    debug!(count = targets.len(), "VSDX data URIs to convert");
    for (node, uri) in targets {
        let payload = match STANDARD.decode(uri.payload_b64.as_bytes()) {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!("VSDX payload is not valid base64, keeping original");
                report.skip(SkipReason::UndecodableBase64);
                continue;
            }
        };

        match office.convert_to_png(&payload).await {
            Ok(png) => {
                let b64 = STANDARD.encode(&png);
                if let Some(el) = node.as_element() {
                    el.attributes
                        .borrow_mut()
                        .insert("src", DataUri::format(PNG_MIME, &b64));
                    report.converted += 1;
                    debug!(bytes = png.len(), "VSDX converted to PNG");
                }
            }
            Err(e) => {
                warn!(error = %e, "VSDX conversion failed, keeping original");
                report.skip(SkipReason::Vsdx(e.to_string()));
            }
        }
    }

    report
}

fn collect_vsdx_images(doc: &HtmlDocument) -> Vec<(NodeRef, DataUri)> {
    let Ok(images) = doc.root().select("img") else {
        return Vec::new();
    };
    images
        .filter_map(|img| {
            let src = img.attributes.borrow().get("src")?.to_string();
            let uri = DataUri::parse(&src)?;
            (uri.content_type == VSDX_MIME).then(|| (img.as_node().clone(), uri))
        })
        .collect()
}
