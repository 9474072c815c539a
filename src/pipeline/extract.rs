//! SVG extraction and rewriting.
//!
//! Two operations over the parsed document:
//!
//! * [`replace_inline_svgs`] — every **top-level** inline `<svg>` (one with
//!   no `<svg>` ancestor) is serialized to XML, base64-encoded and replaced
//!   by an `<img>` carrying a `data:image/svg+xml;base64,…` source. Nested
//!   SVGs travel inside their parent's payload untouched.
//! * [`scan_svg_candidates`] — every `<img>` with a base64 data URI is
//!   examined as a potential SVG. The detector is permissive about MIME
//!   labels (real-world producers mislabel SVG constantly) but strict about
//!   content: explicit raster types are denied outright, and payloads must
//!   decode, be text, and parse as an XML document rooted at `svg`.

use crate::dom::{has_ancestor_element, serialize_xml, HtmlDocument};
use crate::error::SkipReason;
use crate::svg::SvgDocument;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use html5ever::{local_name, namespace_url, ns, QualName};
use kuchiki::{Attribute, ExpandedName, NodeRef};
use tracing::debug;

pub const SVG_MIME: &str = "image/svg+xml";
pub const PNG_MIME: &str = "image/png";
pub const VSDX_MIME: &str = "application/vnd.ms-visio.drawing";

/// Explicit raster types are never re-examined as SVG candidates,
/// regardless of actual content — re-processing raster data is wasted work.
pub const RASTER_DENYLIST: [&str; 3] = ["image/jpeg", "image/png", "image/gif"];

/// A `data:<type>;base64,<payload>` URI split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub content_type: String,
    pub payload_b64: String,
}

impl DataUri {
    /// Parse a base64 data URI; anything else yields `None`.
    pub fn parse(src: &str) -> Option<Self> {
        let rest = src.strip_prefix("data:")?;
        let (content_type, payload) = rest.split_once(";base64,")?;
        Some(DataUri {
            content_type: content_type.to_string(),
            // Attribute values may be line-wrapped; base64 itself never
            // contains whitespace.
            payload_b64: payload
                .chars()
                .filter(|c| !c.is_ascii_whitespace())
                .collect(),
        })
    }

    pub fn format(content_type: &str, payload_b64: &str) -> String {
        format!("data:{content_type};base64,{payload_b64}")
    }
}

/// One discovered image reference: the owning `<img>` node, the original
/// payload, and the validated SVG document decoded from it.
pub struct EmbeddedImage {
    pub node: NodeRef,
    pub content_type: String,
    pub payload_b64: String,
    pub svg: SvgDocument,
}

/// Outcome of one scan over the document's `<img>` nodes.
#[derive(Default)]
pub struct ScanReport {
    pub candidates: Vec<EmbeddedImage>,
    pub skipped: Vec<SkipReason>,
}

/// Replace every top-level inline `<svg>` with an `<img>` data-URI node.
///
/// `width`/`height` attributes present on the `<svg>` are carried over onto
/// the new `<img>` so the layout box is preserved. Returns the number of
/// elements rewritten; running this on an already-rewritten document is a
/// no-op.
pub fn replace_inline_svgs(doc: &HtmlDocument) -> usize {
    let top_level: Vec<NodeRef> = match doc.root().select("svg") {
        Ok(matches) => matches
            .map(|m| m.as_node().clone())
            .filter(|node| !has_ancestor_element(node, "svg"))
            .collect(),
        Err(()) => Vec::new(),
    };

    debug!(
        count = top_level.len(),
        "top-level inline SVG elements to rewrite"
    );

    for svg_node in &top_level {
        let xml = serialize_xml(svg_node);
        debug!(chars = xml.len(), "converting inline SVG to data URL");
        let payload = STANDARD.encode(xml.as_bytes());

        let (width, height) = {
            let attrs = svg_node
                .as_element()
                .map(|el| el.attributes.borrow().clone());
            match attrs {
                Some(attrs) => (
                    attrs.get("width").map(str::to_string),
                    attrs.get("height").map(str::to_string),
                ),
                None => (None, None),
            }
        };

        // Attribute order mirrors the serialized output: height, src, width.
        let mut attributes: Vec<(ExpandedName, Attribute)> = Vec::new();
        if let Some(h) = height {
            attributes.push(attr("height", h));
        }
        attributes.push(attr("src", DataUri::format(SVG_MIME, &payload)));
        if let Some(w) = width {
            attributes.push(attr("width", w));
        }

        let img = NodeRef::new_element(
            QualName::new(None, ns!(html), local_name!("img")),
            attributes,
        );
        svg_node.insert_after(img);
        svg_node.detach();
    }

    top_level.len()
}

fn attr(name: &str, value: String) -> (ExpandedName, Attribute) {
    (
        ExpandedName::new(ns!(), name),
        Attribute {
            prefix: None,
            value,
        },
    )
}

/// Scan `<img>` data URIs for SVG candidates.
///
/// Non-data-URI images and VSDX payloads are not candidates and produce no
/// skip record; they simply belong to other stages. Everything else either
/// becomes an [`EmbeddedImage`] or an explicit [`SkipReason`].
pub fn scan_svg_candidates(doc: &HtmlDocument) -> ScanReport {
    let mut report = ScanReport::default();

    let images: Vec<NodeRef> = match doc.root().select("img") {
        Ok(matches) => matches.map(|m| m.as_node().clone()).collect(),
        Err(()) => Vec::new(),
    };
    debug!(count = images.len(), "img nodes to check for SVG data URLs");

    for node in images {
        let src = match node.as_element() {
            Some(el) => match el.attributes.borrow().get("src") {
                Some(src) => src.to_string(),
                None => continue,
            },
            None => continue,
        };
        let Some(uri) = DataUri::parse(&src) else {
            continue;
        };
        if uri.content_type == VSDX_MIME {
            continue; // handled by the VSDX stage
        }

        match decode_svg_payload(&uri) {
            Ok(svg) => report.candidates.push(EmbeddedImage {
                node,
                content_type: uri.content_type,
                payload_b64: uri.payload_b64,
                svg,
            }),
            Err(reason) => {
                debug!(content_type = %uri.content_type, %reason, "skipping img data URI");
                report.skipped.push(reason);
            }
        }
    }

    report
}

/// Decode and validate one data-URI payload as SVG.
fn decode_svg_payload(uri: &DataUri) -> Result<SvgDocument, SkipReason> {
    if RASTER_DENYLIST.contains(&uri.content_type.as_str()) {
        return Err(SkipReason::RasterContentType(uri.content_type.clone()));
    }

    let decoded = STANDARD
        .decode(uri.payload_b64.as_bytes())
        .map_err(|_| SkipReason::UndecodableBase64)?;
    if decoded.contains(&0) {
        return Err(SkipReason::BinaryPayload);
    }
    let text = String::from_utf8(decoded).map_err(|_| SkipReason::NotUtf8)?;
    SvgDocument::parse(text)
}
