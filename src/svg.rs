//! Standalone SVG payload handling.
//!
//! [`SvgDocument`] wraps the decoded text of one SVG payload. Parsing
//! validates well-formedness (roxmltree) and that the root element actually
//! is `svg` — the data-URI detector is deliberately permissive about MIME
//! labels, but not about content.
//!
//! Dimension resolution follows the algorithm in the unit resolver: width
//! and height resolve independently; a viewBox backfills missing axes, and
//! when it does, the explicit `width`/`height` attributes on the root start
//! tag are rewritten to the resolved pixel values so the renderer receives
//! an unambiguous size.
//!
//! Attribute rewriting is text-surgical: the root start tag is located via
//! the validated parse, then edited in place with a quote-aware scanner.
//! roxmltree is read-only, and round-tripping the whole document through a
//! writer would disturb content we have no business touching.

use crate::dom::SVG_NS;
use crate::error::{SkipReason, UnitError};
use crate::units::{resolve_px, Length, ViewBox};
use once_cell::sync::Lazy;
use regex::Regex;

/// A validated SVG document held as text.
#[derive(Debug, Clone)]
pub struct SvgDocument {
    text: String,
}

/// Resolved pixel dimensions for one SVG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    pub width: u32,
    pub height: u32,
}

// `width="..."` / `height="..."` inside a start tag. The `pre` capture
// rejects hyphenated lookalikes such as `stroke-width`.
static WIDTH_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(?P<pre>[^-\w])width\s*=\s*("[^"]*"|'[^']*')"#).unwrap());
static HEIGHT_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)(?P<pre>[^-\w])height\s*=\s*("[^"]*"|'[^']*')"#).unwrap());
static XMLNS_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)[^-\w:]xmlns\s*="#).unwrap());

impl SvgDocument {
    /// Validate and wrap SVG text.
    pub fn parse(text: impl Into<String>) -> Result<Self, SkipReason> {
        let text = text.into();
        {
            let doc = roxmltree::Document::parse(&text).map_err(|_| SkipReason::MalformedXml)?;
            let root = doc.root_element().tag_name().name().to_string();
            if !root.eq_ignore_ascii_case("svg") {
                return Err(SkipReason::NotSvg(root));
            }
        }
        Ok(SvgDocument { text })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Owned UTF-8 bytes of the document, for render requests.
    pub fn text_bytes(&self) -> Vec<u8> {
        self.text.clone().into_bytes()
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Inject `xmlns` on the root when absent. A standalone SVG document
    /// without its namespace renders as unknown XML in the browser.
    pub fn ensure_namespace(&mut self) {
        let Some((tag_start, tag_end)) = self.root_tag_span() else {
            return;
        };
        let tag = &self.text[tag_start..tag_end];
        if !XMLNS_ATTR.is_match(tag) {
            let insert_at = tag_start + attr_insert_pos(tag);
            self.text
                .insert_str(insert_at, &format!(" xmlns=\"{SVG_NS}\""));
        }
    }

    /// Resolve width/height to pixel dimensions.
    ///
    /// Returns `Ok(None)` when either axis remains unresolved (caller skips
    /// rendering and leaves the content unchanged). Relative units without a
    /// viewBox surface as [`UnitError`] to the immediate caller.
    pub fn resolve_dimensions(&mut self) -> Result<Option<PixelSize>, UnitError> {
        let (width_attr, height_attr, viewbox) = self.read_root();

        let width_len = width_attr.as_deref().and_then(Length::parse);
        let height_len = height_attr.as_deref().and_then(Length::parse);

        let mut width_px = match &width_len {
            Some(len) => resolve_px(len, viewbox.map(|vb| vb.width))?,
            None => None,
        };
        let mut height_px = match &height_len {
            Some(len) => resolve_px(len, viewbox.map(|vb| vb.height))?,
            None => None,
        };

        if let Some(vb) = viewbox {
            if width_px.is_none() || height_px.is_none() {
                if width_px.is_none() && vb.width > 0.0 {
                    width_px = Some(vb.width.ceil() as u32);
                }
                if height_px.is_none() && vb.height > 0.0 {
                    height_px = Some(vb.height.ceil() as u32);
                }
                if let (Some(w), Some(h)) = (width_px, height_px) {
                    self.rewrite_root_dimensions(w, h);
                }
            }
        }

        match (width_px, height_px) {
            (Some(width), Some(height)) => Ok(Some(PixelSize { width, height })),
            _ => Ok(None),
        }
    }

    /// Read `width`, `height` and `viewBox` off the root element.
    fn read_root(&self) -> (Option<String>, Option<String>, Option<ViewBox>) {
        // The text was validated at construction; a later rewrite keeping it
        // well-formed is an invariant of this type.
        let Ok(doc) = roxmltree::Document::parse(&self.text) else {
            return (None, None, None);
        };
        let root = doc.root_element();
        let width = root.attribute("width").map(str::to_string);
        let height = root.attribute("height").map(str::to_string);
        let viewbox = root.attribute("viewBox").and_then(ViewBox::parse);
        (width, height, viewbox)
    }

    /// Rewrite (or insert) `width`/`height` on the root start tag as
    /// `{n}px` values.
    fn rewrite_root_dimensions(&mut self, width: u32, height: u32) {
        let Some((tag_start, tag_end)) = self.root_tag_span() else {
            return;
        };
        let mut tag = self.text[tag_start..tag_end].to_string();

        tag = replace_or_insert_attr(&tag, &WIDTH_ATTR, "width", &format!("{width}px"));
        tag = replace_or_insert_attr(&tag, &HEIGHT_ATTR, "height", &format!("{height}px"));

        self.text.replace_range(tag_start..tag_end, &tag);
    }

    /// Byte span of the root element's start tag, `<svg ... >` inclusive.
    fn root_tag_span(&self) -> Option<(usize, usize)> {
        let start = roxmltree::Document::parse(&self.text)
            .ok()
            .map(|doc| doc.root_element().range().start)?;
        let bytes = self.text.as_bytes();
        let mut quote: Option<u8> = None;
        for (offset, &b) in bytes[start..].iter().enumerate() {
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'>' => return Some((start, start + offset + 1)),
                    _ => {}
                },
            }
        }
        None
    }
}

fn replace_or_insert_attr(tag: &str, pattern: &Regex, name: &str, value: &str) -> String {
    if pattern.is_match(tag) {
        pattern
            .replace(tag, format!("${{pre}}{name}=\"{value}\""))
            .into_owned()
    } else {
        let mut out = tag.to_string();
        out.insert_str(attr_insert_pos(tag), &format!(" {name}=\"{value}\""));
        out
    }
}

/// Byte offset just past the tag name of a start tag, where a new
/// attribute can be inserted.
fn attr_insert_pos(tag: &str) -> usize {
    tag.char_indices()
        .skip(1)
        .find(|(_, c)| c.is_whitespace() || *c == '>' || *c == '/')
        .map(|(i, _)| i)
        .unwrap_or(tag.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dims(svg: &str) -> (Option<PixelSize>, String) {
        let mut doc = SvgDocument::parse(svg).expect("valid svg");
        let size = doc.resolve_dimensions().expect("no unit error");
        (size, doc.into_text())
    }

    #[test]
    fn rejects_malformed_and_non_svg_xml() {
        assert_eq!(
            SvgDocument::parse("<svg>").unwrap_err(),
            SkipReason::MalformedXml
        );
        assert_eq!(
            SvgDocument::parse("<div>x</div>").unwrap_err(),
            SkipReason::NotSvg("div".into())
        );
    }

    #[test]
    fn absolute_attributes_resolve_directly() {
        let (size, text) = dims(r#"<svg width="120" height="80"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 120,
                height: 80
            })
        );
        // No viewBox backfill happened, so the text is untouched.
        assert!(text.contains(r#"width="120""#));
    }

    #[test]
    fn relative_units_resolve_against_viewbox_axes() {
        let (size, _) = dims(r#"<svg width="100vw" height="50vh" viewBox="0 0 800 600"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 800,
                height: 300
            })
        );
    }

    #[test]
    fn relative_units_without_viewbox_error() {
        let mut doc = SvgDocument::parse(r#"<svg width="100vw" height="50"></svg>"#).unwrap();
        let err = doc.resolve_dimensions().unwrap_err();
        assert_eq!(
            err,
            UnitError::RelativeWithoutViewBox { unit: "vw".into() }
        );
    }

    #[test]
    fn viewbox_backfills_and_rewrites_attributes() {
        let (size, text) = dims(r#"<svg viewBox="0 0 300 150"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 300,
                height: 150
            })
        );
        assert!(text.contains(r#"width="300px""#), "got: {text}");
        assert!(text.contains(r#"height="150px""#), "got: {text}");
        // Still well-formed after the rewrite.
        assert!(roxmltree::Document::parse(&text).is_ok());
    }

    #[test]
    fn viewbox_backfills_single_missing_axis() {
        let (size, text) = dims(r#"<svg width="100" viewBox="0 0 300 150"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 100,
                height: 150
            })
        );
        assert!(text.contains(r#"width="100px""#), "got: {text}");
        assert!(text.contains(r#"height="150px""#), "got: {text}");
    }

    #[test]
    fn stroke_width_attribute_is_not_mistaken_for_width() {
        let (size, text) = dims(r#"<svg stroke-width="3" viewBox="0 0 40 20"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 40,
                height: 20
            })
        );
        assert!(text.contains(r#"stroke-width="3""#), "got: {text}");
        assert!(text.contains(r#"width="40px""#), "got: {text}");
    }

    #[test]
    fn no_dimensions_and_no_viewbox_is_unresolved() {
        let (size, _) = dims("<svg></svg>");
        assert_eq!(size, None);
    }

    #[test]
    fn unparseable_dimension_values_fall_back_to_viewbox() {
        let (size, _) = dims(r#"<svg width="auto" viewBox="0 0 10 10"></svg>"#);
        assert_eq!(
            size,
            Some(PixelSize {
                width: 10,
                height: 10
            })
        );
    }

    #[test]
    fn ensure_namespace_inserts_once() {
        let mut doc = SvgDocument::parse("<svg></svg>").unwrap();
        doc.ensure_namespace();
        assert!(doc.text().starts_with(r#"<svg xmlns="http://www.w3.org/2000/svg">"#));
        let before = doc.text().to_string();
        doc.ensure_namespace();
        assert_eq!(doc.text(), before);
    }

    #[test]
    fn ensure_namespace_keeps_existing() {
        let src = r#"<svg xmlns="http://www.w3.org/2000/svg" width="5" height="5"></svg>"#;
        let mut doc = SvgDocument::parse(src).unwrap();
        doc.ensure_namespace();
        assert_eq!(doc.text(), src);
    }
}
