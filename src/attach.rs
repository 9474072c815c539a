//! Attachment reference resolution.
//!
//! Uploaded files meet the document in two ways:
//!
//! * files whose basename is referenced from an
//!   `<a rel="attachment" href="…">` (or `<link rel="attachment">`) have
//!   their hrefs rewritten to absolute `file://` URIs, so the PDF engine
//!   turns them into clickable file annotations;
//! * unreferenced files become [`AttachmentRecord`]s handed to the engine
//!   for plain embedding.
//!
//! Everything is request-scoped: uploads land in a caller-owned directory
//! that is deleted with the request.

use crate::dom::HtmlDocument;
use kuchiki::NodeRef;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

/// One uploaded file: logical basename plus content.
#[derive(Debug, Clone)]
pub struct Upload {
    pub basename: String,
    pub bytes: Vec<u8>,
}

/// An uploaded file persisted to the request workspace.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub basename: String,
    pub path: PathBuf,
}

/// Collect basenames referenced via `rel="attachment"` links.
pub fn find_referenced_names(doc: &HtmlDocument) -> HashSet<String> {
    let mut names = HashSet::new();
    for node in attachment_link_nodes(doc) {
        let Some(el) = node.as_element() else { continue };
        let attrs = el.attributes.borrow();
        if let Some(href) = attrs.get("href") {
            if let Some(name) = href_basename(href) {
                names.insert(name);
            }
        }
    }
    names
}

/// Persist uploads into `dir`, uniquifying clashing basenames as
/// `name (1).ext`, `name (2).ext`, …
///
/// Returns the mapping `{basename → saved path}` keyed by the (possibly
/// uniquified) on-disk name.
pub async fn save_uploads(
    dir: &Path,
    uploads: &[Upload],
) -> std::io::Result<HashMap<String, PathBuf>> {
    let mut saved = HashMap::new();
    tokio::fs::create_dir_all(dir).await?;

    for upload in uploads {
        let name = sanitize_basename(&upload.basename);
        let mut candidate = dir.join(&name);
        let mut counter = 1;
        while candidate.exists() {
            candidate = dir.join(uniquified(&name, counter));
            counter += 1;
        }
        tokio::fs::write(&candidate, &upload.bytes).await?;
        let stored_name = candidate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        debug!(name = %stored_name, bytes = upload.bytes.len(), "upload saved");
        saved.insert(stored_name, candidate);
    }
    Ok(saved)
}

/// Records for files not referenced anywhere in the document.
pub fn records_for_unreferenced(
    saved: &HashMap<String, PathBuf>,
    referenced: &HashSet<String>,
) -> Vec<AttachmentRecord> {
    let mut records: Vec<AttachmentRecord> = saved
        .iter()
        .filter(|(name, _)| !referenced.contains(*name))
        .map(|(name, path)| AttachmentRecord {
            basename: name.clone(),
            path: path.clone(),
        })
        .collect();
    // HashMap order is arbitrary; keep the engine input deterministic.
    records.sort_by(|a, b| a.basename.cmp(&b.basename));
    records
}

/// Rewrite `rel="attachment"` hrefs whose basename matches a saved upload
/// into absolute `file://` URIs.
pub fn rewrite_attachment_links(doc: &HtmlDocument, saved: &HashMap<String, PathBuf>) {
    for node in attachment_link_nodes(doc) {
        let Some(el) = node.as_element() else { continue };
        let mut attrs = el.attributes.borrow_mut();
        let Some(name) = attrs.get("href").and_then(href_basename) else {
            continue;
        };
        let Some(path) = saved.get(&name) else {
            continue;
        };
        if let Some(uri) = file_uri(path) {
            attrs.insert("href", uri);
        }
    }
}

/// The full four-step flow: find references, persist uploads, build records
/// for unreferenced files, rewrite referenced links.
pub async fn resolve_attachments(
    doc: &HtmlDocument,
    dir: &Path,
    uploads: &[Upload],
) -> std::io::Result<Vec<AttachmentRecord>> {
    let referenced = find_referenced_names(doc);
    let saved = save_uploads(dir, uploads).await?;
    let records = records_for_unreferenced(&saved, &referenced);
    rewrite_attachment_links(doc, &saved);
    Ok(records)
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn attachment_link_nodes(doc: &HtmlDocument) -> Vec<NodeRef> {
    let Ok(links) = doc.root().select("a, link") else {
        return Vec::new();
    };
    links
        .filter(|node| {
            let attrs = node.attributes.borrow();
            attrs
                .get("rel")
                .map(|rel| {
                    rel.split_ascii_whitespace()
                        .any(|token| token.eq_ignore_ascii_case("attachment"))
                })
                .unwrap_or(false)
        })
        .map(|node| node.as_node().clone())
        .collect()
}

/// Percent-decoded basename of an href, path segments stripped.
fn href_basename(href: &str) -> Option<String> {
    let decoded = percent_decode_str(href).decode_utf8().ok()?;
    let name = Path::new(decoded.as_ref()).file_name()?;
    Some(name.to_string_lossy().into_owned())
}

/// Strip any path components a hostile basename might carry.
fn sanitize_basename(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "attachment.bin".to_string();
    }
    Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment.bin".to_string())
}

fn uniquified(name: &str, counter: u32) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem} ({counter}).{}", ext.to_string_lossy()),
        None => format!("{stem} ({counter})"),
    }
}

fn file_uri(path: &Path) -> Option<String> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::fs::canonicalize(path).ok()?
    };
    Url::from_file_path(&absolute).ok().map(String::from)
}
