//! HTML document wrapper around the kuchiki tree.
//!
//! [`HtmlDocument`] owns the parsed tree for one conversion request and
//! remembers two things the parser normalizes away: whether the input was a
//! full document (vs a fragment) and any leading XML declaration. Fragments
//! serialize back to body *contents* so the caller gets out the same shape
//! it put in; full documents serialize whole, with the XML declaration
//! restored.
//!
//! kuchiki's serializer emits HTML, which is not necessarily well-formed
//! XML. [`serialize_xml`] provides the minimal XML serialization needed for
//! SVG subtrees (attribute quoting, explicit end tags, `xmlns` injection).

use kuchiki::traits::TendrilSink;
use kuchiki::{ElementData, NodeData, NodeRef};

pub const SVG_NS: &str = "http://www.w3.org/2000/svg";

/// A parsed HTML document plus the serialization metadata kuchiki drops.
pub struct HtmlDocument {
    root: NodeRef,
    was_full_document: bool,
    xml_decl: Option<String>,
}

impl HtmlDocument {
    /// Parse an HTML string, remembering document-vs-fragment shape and any
    /// leading `<?xml ...?>` declaration.
    pub fn parse(html: &str) -> Self {
        let xml_decl = extract_xml_decl(html);
        let was_full_document = is_full_document(html);
        let root = kuchiki::parse_html().one(html);
        clear_leading_xml_comment(&root);
        HtmlDocument {
            root,
            was_full_document,
            xml_decl,
        }
    }

    /// The document node of the tree.
    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    pub fn was_full_document(&self) -> bool {
        self.was_full_document
    }

    /// Serialize back to markup text.
    ///
    /// Full documents round-trip whole (plus restored XML declaration);
    /// fragments round-trip as the body's inner markup.
    pub fn serialize(&self) -> String {
        if self.was_full_document {
            let body = self.root.to_string();
            match &self.xml_decl {
                Some(decl) => format!("{decl}{body}"),
                None => body,
            }
        } else {
            match self.root.select_first("body") {
                Ok(body) => body
                    .as_node()
                    .children()
                    .map(|child| child.to_string())
                    .collect(),
                Err(()) => self.root.to_string(),
            }
        }
    }
}

/// Local (lower-cased) element name, or `None` for non-element nodes.
pub fn element_name(node: &NodeRef) -> Option<String> {
    node.as_element()
        .map(|el| el.name.local.as_ref().to_ascii_lowercase())
}

/// Whether `node` is an element with the given local name.
pub fn is_element(node: &NodeRef, name: &str) -> bool {
    element_name(node).as_deref() == Some(name)
}

/// Whether an element carries `class_name` in its space-separated class list.
pub fn has_class(el: &ElementData, class_name: &str) -> bool {
    el.attributes
        .borrow()
        .get("class")
        .map(|classes| classes.split_ascii_whitespace().any(|c| c == class_name))
        .unwrap_or(false)
}

/// Whether any ancestor of `node` is an element with the given local name.
pub fn has_ancestor_element(node: &NodeRef, name: &str) -> bool {
    node.ancestors().any(|a| is_element(&a, name))
}

/// Whether any ancestor of `node` carries the given class.
pub fn has_ancestor_class(node: &NodeRef, class_name: &str) -> bool {
    node.ancestors()
        .any(|a| a.as_element().is_some_and(|el| has_class(el, class_name)))
}

// ── XML subtree serialization (for SVG payloads) ─────────────────────────

/// Serialize a subtree as well-formed XML.
///
/// An `svg` root without an `xmlns` attribute gets the SVG namespace
/// injected, since a standalone SVG document requires it.
pub fn serialize_xml(node: &NodeRef) -> String {
    let mut out = String::new();
    write_xml(node, &mut out);
    out
}

fn write_xml(node: &NodeRef, out: &mut String) {
    match node.data() {
        NodeData::Element(el) => {
            let tag = el.name.local.as_ref();
            out.push('<');
            out.push_str(tag);

            let attrs = el.attributes.borrow();
            let mut has_xmlns = false;
            for (name, attr) in attrs.map.iter() {
                let key = name.local.as_ref();
                if key.eq_ignore_ascii_case("xmlns") {
                    has_xmlns = true;
                }
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                escape_xml_attr(&attr.value, out);
                out.push('"');
            }
            if tag.eq_ignore_ascii_case("svg") && !has_xmlns {
                out.push_str(" xmlns=\"");
                out.push_str(SVG_NS);
                out.push('"');
            }
            out.push('>');

            for child in node.children() {
                write_xml(&child, out);
            }

            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        NodeData::Text(t) => escape_xml_text(&t.borrow(), out),
        // Comments, doctypes and PIs have no place inside an SVG payload.
        _ => {
            for child in node.children() {
                write_xml(&child, out);
            }
        }
    }
}

fn escape_xml_attr(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

fn escape_xml_text(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

// ── Input-shape detection ────────────────────────────────────────────────

fn extract_xml_decl(html: &str) -> Option<String> {
    let trimmed = html.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        trimmed.find("?>").map(|end| trimmed[..end + 2].to_string())
    } else {
        None
    }
}

/// Detect whether the input is a full HTML document.
///
/// Leading BOM, whitespace, comments and processing instructions are
/// skipped; a `<!doctype` declaration or `<html>` start tag makes the
/// input a full document.
fn is_full_document(html: &str) -> bool {
    let mut rest = html.trim_start_matches('\u{feff}').trim_start();
    loop {
        if rest.starts_with("<!--") {
            match rest.find("-->") {
                Some(end) => rest = rest[end + 3..].trim_start(),
                None => return false,
            }
        } else if rest.starts_with("<?") {
            match rest.find("?>") {
                Some(end) => rest = rest[end + 2..].trim_start(),
                None => return false,
            }
        } else {
            break;
        }
    }

    let lower = rest.get(..16).unwrap_or(rest).to_ascii_lowercase();
    if lower.starts_with("<!doctype") {
        return true;
    }
    if let Some(after) = lower.strip_prefix("<html") {
        return matches!(after.chars().next(), None | Some(' ' | '\t' | '\n' | '>' | '/'));
    }
    false
}

/// Some parsers turn a leading `<?xml ...?>` into a `<!--?xml ...?-->`
/// comment node; drop it so it does not survive into the output.
fn clear_leading_xml_comment(root: &NodeRef) {
    if let Some(first) = root.first_child() {
        if let Some(comment) = first.as_comment() {
            if comment.borrow().trim_start().starts_with("?xml") {
                first.detach();
            }
        }
    }
}
