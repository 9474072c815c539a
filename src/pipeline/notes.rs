//! Sticky-note markup parsing.
//!
//! Note markup is a nested `div` convention:
//!
//! ```html
//! <div class="inkpress-note">
//!   <div class="inkpress-note-time">2026-08-07 11:24</div>
//!   <div class="inkpress-note-author">Admin</div>
//!   <div class="inkpress-note-title">Main note</div>
//!   <div class="inkpress-note-text">Comment body</div>
//!   <div class="inkpress-note">…reply…</div>
//! </div>
//! ```
//!
//! A node is top-level when it has no note-class ancestor. Fields and
//! replies are read from **direct children only**, so unrelated nested
//! markup is never absorbed. Each parsed tree is replaced by a minimal
//! marker link whose target encodes the note's generated id; the external
//! PDF engine turns that link into a `/Link` annotation with a `/URI`
//! action, which the post-processor later rewrites into a native sticky
//! note.

use crate::dom::{has_ancestor_class, has_class, HtmlDocument};
use html5ever::{local_name, namespace_url, ns, QualName};
use kuchiki::{Attribute, ExpandedName, NodeRef};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

pub const NOTE_CLASS: &str = "inkpress-note";
pub const NOTE_TIME_CLASS: &str = "inkpress-note-time";
pub const NOTE_AUTHOR_CLASS: &str = "inkpress-note-author";
pub const NOTE_TITLE_CLASS: &str = "inkpress-note-title";
pub const NOTE_TEXT_CLASS: &str = "inkpress-note-text";

/// URI scheme carried by marker links; the post-processor matches on it.
pub const MARKER_SCHEME: &str = "inkpress-note://";

/// The marker must occupy a real layout box (the PDF engine derives the
/// annotation `/Rect` from it) while staying invisible.
const MARKER_STYLE: &str =
    "display: inline-block; width: 20px; height: 20px; overflow: hidden; opacity: 0;";

/// One sticky annotation: content plus ordered replies.
///
/// `id` is generated at parse time, unique per document, and correlates the
/// serialized marker with the annotation synthesized into the PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub author: String,
    pub title: String,
    pub text: String,
    pub timestamp: String,
    pub replies: Vec<Note>,
}

impl Note {
    /// Total annotations this tree expands to (itself plus all replies).
    pub fn annotation_count(&self) -> usize {
        1 + self
            .replies
            .iter()
            .map(Note::annotation_count)
            .sum::<usize>()
    }
}

/// Extract every top-level note tree, replacing each with a marker link.
pub fn extract_notes(doc: &HtmlDocument) -> Vec<Note> {
    let selector = format!(".{NOTE_CLASS}");
    let top_level: Vec<NodeRef> = match doc.root().select(&selector) {
        Ok(matches) => matches
            .map(|m| m.as_node().clone())
            .filter(|node| !has_ancestor_class(node, NOTE_CLASS))
            .collect(),
        Err(()) => Vec::new(),
    };

    debug!(count = top_level.len(), "top-level note trees found");

    let mut notes = Vec::with_capacity(top_level.len());
    for node in top_level {
        let note = parse_note(&node);
        node.insert_after(marker_node(&note.id));
        node.detach();
        notes.push(note);
    }
    notes
}

/// Recursively build a [`Note`] from a note-class node.
fn parse_note(node: &NodeRef) -> Note {
    let replies = direct_children_with_class(node, NOTE_CLASS)
        .iter()
        .map(parse_note)
        .collect();

    Note {
        id: Uuid::new_v4().to_string(),
        author: direct_child_text(node, NOTE_AUTHOR_CLASS),
        title: direct_child_text(node, NOTE_TITLE_CLASS),
        text: direct_child_text(node, NOTE_TEXT_CLASS),
        timestamp: direct_child_text(node, NOTE_TIME_CLASS),
        replies,
    }
}

fn direct_children_with_class(node: &NodeRef, class_name: &str) -> Vec<NodeRef> {
    node.children()
        .filter(|child| {
            child
                .as_element()
                .is_some_and(|el| has_class(el, class_name))
        })
        .collect()
}

/// Trimmed text content of the first direct child with the given class;
/// absent child yields the empty string.
fn direct_child_text(node: &NodeRef, class_name: &str) -> String {
    direct_children_with_class(node, class_name)
        .first()
        .map(|child| child.text_contents().trim().to_string())
        .unwrap_or_default()
}

fn marker_node(note_id: &str) -> NodeRef {
    let a = NodeRef::new_element(
        QualName::new(None, ns!(html), local_name!("a")),
        vec![
            (
                ExpandedName::new(ns!(), "href"),
                Attribute {
                    prefix: None,
                    value: format!("{MARKER_SCHEME}{note_id}"),
                },
            ),
            (
                ExpandedName::new(ns!(), "style"),
                Attribute {
                    prefix: None,
                    value: MARKER_STYLE.to_string(),
                },
            ),
        ],
    );
    a.append(NodeRef::new_text("N"));
    a
}
