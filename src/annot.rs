//! PDF annotation post-processing.
//!
//! After the external engine produced PDF bytes, every page's `/Annots`
//! array is scanned for `/Link` annotations whose `/URI` action carries the
//! marker scheme. Matching links are removed and replaced by native `/Text`
//! (sticky-note) annotations rebuilt from the corresponding [`Note`] tree:
//! author (`/T`), subject (`/Subj`), PDF-format timestamps, and reply
//! chains via `/IRT` + `/RT /R` references. All other annotations pass
//! through untouched.
//!
//! Parent references are plain object ids handed down the recursion — an
//! arena in the loosest sense: no annotation ever owns another, the
//! document's object table does.
//!
//! Failure philosophy: a note that cannot be synthesized degrades (plain
//! annotation without icon, omitted date fields); only a structurally
//! unreadable PDF is an error.

use crate::error::AnnotError;
use crate::pipeline::notes::{Note, MARKER_SCHEME};
use chrono::{DateTime, NaiveDateTime};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream, StringFormat};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Decoded icon pixels for the custom appearance stream.
///
/// Rows are stored bottom-up so the appearance transform that flips the
/// unit square into PDF's bottom-left origin shows the icon upright.
pub struct NoteIcon {
    width: u32,
    height: u32,
    rgb: Vec<u8>,
    alpha: Option<Vec<u8>>,
}

impl NoteIcon {
    /// Decode a PNG icon.
    pub fn from_png_bytes(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let decoded = image::load_from_memory(bytes)?.flipv().to_rgba8();
        let (width, height) = decoded.dimensions();

        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        let mut alpha = Vec::with_capacity((width * height) as usize);
        for pixel in decoded.pixels() {
            rgb.extend_from_slice(&pixel.0[..3]);
            alpha.push(pixel.0[3]);
        }
        let alpha = alpha.iter().any(|&a| a != 0xff).then_some(alpha);

        Ok(NoteIcon {
            width,
            height,
            rgb,
            alpha,
        })
    }

    /// Best-effort load from disk; a missing or unreadable icon degrades to
    /// plain annotations.
    pub fn load(path: &Path) -> Option<Self> {
        match std::fs::read(path) {
            Ok(bytes) => match Self::from_png_bytes(&bytes) {
                Ok(icon) => Some(icon),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "note icon not decodable, using plain annotations");
                    None
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "note icon not readable, using plain annotations");
                None
            }
        }
    }
}

/// Replace marker links in `pdf` with nested sticky-note annotations.
pub fn attach_notes(
    pdf: &[u8],
    notes: &[Note],
    icon: Option<&NoteIcon>,
) -> Result<Vec<u8>, AnnotError> {
    if notes.is_empty() {
        return Ok(pdf.to_vec());
    }

    let note_map: HashMap<&str, &Note> = notes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut doc = Document::load_mem(pdf)?;

    // Scan pass: per page, split /Annots into kept entries and queued
    // marker hits. Read-only over the object table.
    struct PagePlan {
        page_id: ObjectId,
        kept: Vec<Object>,
        queued: Vec<(String, [f32; 4])>,
    }
    let mut plans: Vec<PagePlan> = Vec::new();

    for page_id in doc.get_pages().values().copied() {
        let annots = page_annotation_entries(&doc, page_id);
        if annots.is_empty() {
            continue;
        }

        let total = annots.len();
        let mut plan = PagePlan {
            page_id,
            kept: Vec::with_capacity(total),
            queued: Vec::new(),
        };
        for entry in annots {
            let marker: Option<(String, Option<[f32; 4]>)> = resolve_dict(&doc, &entry)
                .and_then(|dict| marker_note_id(&doc, dict).map(|id| (id, annotation_rect(dict))));
            match marker {
                Some((id, rect)) if note_map.contains_key(id.as_str()) => match rect {
                    Some(rect) => plan.queued.push((id, rect)),
                    // A marker without a usable rectangle cannot anchor an
                    // annotation; drop the dead link.
                    None => warn!(%id, "marker link without /Rect, dropping"),
                },
                _ => plan.kept.push(entry),
            }
        }
        if plan.kept.len() != total {
            plans.push(plan);
        }
    }

    if plans.is_empty() {
        debug!("no marker links found in generated PDF");
        return Ok(pdf.to_vec());
    }

    // Write pass: rewrite each affected page's /Annots to the kept set.
    for plan in &plans {
        let page = doc.get_object_mut(plan.page_id)?.as_dict_mut()?;
        if plan.kept.is_empty() {
            page.remove(b"Annots");
        } else {
            page.set("Annots", Object::Array(plan.kept.clone()));
        }
    }

    // The icon image XObject is shared by every appearance stream.
    let icon_image_id = icon.map(|i| embed_icon_image(&mut doc, i));

    // Creation pass: synthesize annotation trees depth-first.
    let mut created = 0usize;
    for plan in &plans {
        for (note_id, rect) in &plan.queued {
            let note = note_map[note_id.as_str()];
            let appearance = icon_image_id.map(|image_id| {
                build_icon_appearance(&mut doc, image_id, rect[2] - rect[0], rect[3] - rect[1])
            });
            created += create_annotation_tree(&mut doc, plan.page_id, note, *rect, None, appearance)?;
        }
    }
    info!(created, "sticky-note annotations synthesized");

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| AnnotError::Write(e.to_string()))?;
    Ok(out)
}

/// Recursively create one annotation and its replies.
///
/// Replies are created after their parent; each carries an `/IRT` reference
/// to the parent's freshly created object and becomes the parent reference
/// for its own replies — a strictly single-parent chain mirroring the
/// original nesting.
fn create_annotation_tree(
    doc: &mut Document,
    page_id: ObjectId,
    note: &Note,
    rect: [f32; 4],
    parent: Option<ObjectId>,
    appearance: Option<ObjectId>,
) -> Result<usize, AnnotError> {
    let mut dict = dictionary! {
        "Type" => "Annot",
        "Subtype" => "Text",
        "Rect" => Object::Array(rect.iter().map(|v| Object::Real(*v)).collect()),
        "Contents" => pdf_text_string(&note.text),
        "T" => pdf_text_string(&note.author),
        "Name" => "Comment",
        "Open" => false,
        // Print the annotation icon with the page.
        "F" => 4,
    };
    if !note.title.is_empty() {
        dict.set("Subj", pdf_text_string(&note.title));
    }
    if let Some(date) = format_pdf_date(&note.timestamp) {
        dict.set(
            "CreationDate",
            Object::String(date.clone().into_bytes(), StringFormat::Literal),
        );
        dict.set("M", Object::String(date.into_bytes(), StringFormat::Literal));
    }
    if let Some(parent_id) = parent {
        dict.set("IRT", Object::Reference(parent_id));
        dict.set("RT", "R");
    }
    if let Some(appearance_id) = appearance {
        dict.set("AP", dictionary! { "N" => Object::Reference(appearance_id) });
    }

    let annot_id = doc.add_object(dict);
    push_page_annotation(doc, page_id, annot_id)?;

    let mut created = 1;
    for reply in &note.replies {
        // Replies reuse the parent's rectangle; viewers nest them by /IRT.
        created += create_annotation_tree(doc, page_id, reply, rect, Some(annot_id), appearance)?;
    }
    Ok(created)
}

fn push_page_annotation(
    doc: &mut Document,
    page_id: ObjectId,
    annot_id: ObjectId,
) -> Result<(), AnnotError> {
    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    match page.get_mut(b"Annots") {
        Ok(Object::Array(annots)) => annots.push(Object::Reference(annot_id)),
        _ => page.set("Annots", vec![Object::Reference(annot_id)]),
    }
    Ok(())
}

// ── Marker-link detection ────────────────────────────────────────────────

/// Entries of a page's /Annots array, with a reference-valued array
/// resolved through the object table.
fn page_annotation_entries(doc: &Document, page_id: ObjectId) -> Vec<Object> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let Ok(annots) = page.get(b"Annots") else {
        return Vec::new();
    };
    match annots {
        Object::Array(entries) => entries.clone(),
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Array(entries)) => entries.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn resolve_dict<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Dictionary(dict) => Some(dict),
        Object::Reference(id) => match doc.get_object(*id) {
            Ok(Object::Dictionary(dict)) => Some(dict),
            _ => None,
        },
        _ => None,
    }
}

/// If the annotation is a `/Link` whose `/URI` action carries the marker
/// scheme, return the encoded note id.
fn marker_note_id(doc: &Document, annot: &Dictionary) -> Option<String> {
    let subtype = annot.get(b"Subtype").ok()?;
    if !matches!(subtype, Object::Name(name) if name == b"Link") {
        return None;
    }
    let action = resolve_dict(doc, annot.get(b"A").ok()?)?;
    let uri = match action.get(b"URI").ok()? {
        Object::String(bytes, _) => String::from_utf8_lossy(bytes).into_owned(),
        _ => return None,
    };
    uri.strip_prefix(MARKER_SCHEME).map(str::to_string)
}

fn annotation_rect(annot: &Dictionary) -> Option<[f32; 4]> {
    let Ok(Object::Array(values)) = annot.get(b"Rect") else {
        return None;
    };
    if values.len() != 4 {
        return None;
    }
    let mut rect = [0.0f32; 4];
    for (slot, value) in rect.iter_mut().zip(values) {
        *slot = number(value)?;
    }
    Some(rect)
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(v) => Some(*v as f32),
        Object::Real(v) => Some(*v),
        _ => None,
    }
}

// ── Appearance streams ───────────────────────────────────────────────────

/// Embed the icon pixels as an image XObject (plus SMask for alpha).
fn embed_icon_image(doc: &mut Document, icon: &NoteIcon) -> ObjectId {
    let smask_id = icon.alpha.as_ref().map(|alpha| {
        doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => icon.width as i64,
                "Height" => icon.height as i64,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            alpha.clone(),
        ))
    });

    let mut dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => icon.width as i64,
        "Height" => icon.height as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
    };
    if let Some(smask_id) = smask_id {
        dict.set("SMask", Object::Reference(smask_id));
    }
    doc.add_object(Stream::new(dict, icon.rgb.clone()))
}

/// Wrap the icon image in a Form XObject sized to the annotation rect.
///
/// The `cm` matrix scales the unit square to the rect and flips it into
/// PDF's bottom-left coordinate origin; the icon rows were stored
/// bottom-up to compensate.
fn build_icon_appearance(doc: &mut Document, image_id: ObjectId, width: f32, height: f32) -> ObjectId {
    let width = width.abs().max(1.0);
    let height = height.abs().max(1.0);
    let content = format!("q\n{width} 0 0 {height} 0 0 cm\n/Im0 Do\nQ\n");
    doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "BBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => Object::Reference(image_id) },
            },
        },
        content.into_bytes(),
    ))
}

// ── Strings and dates ────────────────────────────────────────────────────

/// PDF text string: plain literal for ASCII, UTF-16BE with BOM otherwise.
fn pdf_text_string(s: &str) -> Object {
    if s.is_ascii() {
        Object::String(s.as_bytes().to_vec(), StringFormat::Literal)
    } else {
        let mut bytes = vec![0xfe, 0xff];
        for unit in s.encode_utf16() {
            bytes.extend_from_slice(&unit.to_be_bytes());
        }
        Object::String(bytes, StringFormat::Hexadecimal)
    }
}

/// Convert a timestamp into the PDF date format `D:YYYYMMDDHHMMSS±HH'MM`.
///
/// Accepts RFC 3339 (offset preserved) and the bare forms
/// `YYYY-MM-DD HH:MM[:SS]` / `YYYY-MM-DDTHH:MM:SS`. Empty or unparseable
/// input yields `None`; callers omit the date fields entirely.
pub fn format_pdf_date(timestamp: &str) -> Option<String> {
    let trimmed = timestamp.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        let offset_secs = dt.offset().local_minus_utc();
        let sign = if offset_secs < 0 { '-' } else { '+' };
        let offset_abs = offset_secs.unsigned_abs();
        return Some(format!(
            "D:{}{}{:02}'{:02}",
            dt.format("%Y%m%d%H%M%S"),
            sign,
            offset_abs / 3600,
            (offset_abs % 3600) / 60,
        ));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(format!("D:{}", dt.format("%Y%m%d%H%M%S")));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, author: &str, text: &str, replies: Vec<Note>) -> Note {
        Note {
            id: id.to_string(),
            author: author.to_string(),
            title: String::new(),
            text: text.to_string(),
            timestamp: "2026-08-07 11:24".to_string(),
            replies,
        }
    }

    /// One-page PDF whose /Annots holds the given annotation dictionaries.
    fn pdf_with_annots(annots: Vec<Dictionary>) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let annot_refs: Vec<Object> = annots
            .into_iter()
            .map(|d| Object::Reference(doc.add_object(d)))
            .collect();
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Annots" => Object::Array(annot_refs),
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    fn marker_link(id: &str, rect: [i64; 4]) -> Dictionary {
        dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "Rect" => rect.iter().map(|v| Object::Integer(*v)).collect::<Vec<_>>(),
            "A" => dictionary! {
                "Type" => "Action",
                "S" => "URI",
                "URI" => Object::string_literal(format!("{MARKER_SCHEME}{id}")),
            },
        }
    }

    fn external_link(url: &str) -> Dictionary {
        dictionary! {
            "Type" => "Annot",
            "Subtype" => "Link",
            "Rect" => vec![0.into(), 0.into(), 10.into(), 10.into()],
            "A" => dictionary! {
                "Type" => "Action",
                "S" => "URI",
                "URI" => Object::string_literal(url),
            },
        }
    }

    /// All /Text annotation dictionaries of the first page, in array order,
    /// paired with their object ids.
    fn text_annotations(pdf: &[u8]) -> Vec<(ObjectId, Dictionary)> {
        let doc = Document::load_mem(pdf).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        page_annotation_entries(&doc, page_id)
            .iter()
            .filter_map(|entry| match entry {
                Object::Reference(id) => match doc.get_object(*id) {
                    Ok(Object::Dictionary(d)) => Some((*id, d.clone())),
                    _ => None,
                },
                _ => None,
            })
            .filter(|(_, d)| matches!(d.get(b"Subtype"), Ok(Object::Name(n)) if n == b"Text"))
            .collect()
    }

    #[test]
    fn reply_tree_becomes_single_parent_irt_chain() {
        let tree = note(
            "root",
            "Admin",
            "Top",
            vec![
                note(
                    "r1",
                    "User 1",
                    "Reply 1",
                    vec![note("r11", "User 3", "Reply to reply", vec![])],
                ),
                note("r2", "User 2", "Reply 2", vec![]),
            ],
        );
        let pdf = pdf_with_annots(vec![marker_link("root", [100, 700, 120, 720])]);
        let out = attach_notes(&pdf, &[tree], None).unwrap();

        let texts = text_annotations(&out);
        // R replies + 1 root = 4 sticky annotations, depth-first order.
        assert_eq!(texts.len(), 4);

        let contents: Vec<String> = texts
            .iter()
            .map(|(_, d)| match d.get(b"Contents") {
                Ok(Object::String(bytes, _)) => String::from_utf8_lossy(bytes).into_owned(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(contents, vec!["Top", "Reply 1", "Reply to reply", "Reply 2"]);

        let irt_of = |d: &Dictionary| match d.get(b"IRT") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        };
        let (root_id, root_dict) = &texts[0];
        let (reply1_id, reply1_dict) = &texts[1];
        let (_, nested_dict) = &texts[2];
        let (_, reply2_dict) = &texts[3];

        assert_eq!(irt_of(root_dict), None);
        assert_eq!(irt_of(reply1_dict), Some(*root_id));
        assert_eq!(irt_of(nested_dict), Some(*reply1_id));
        assert_eq!(irt_of(reply2_dict), Some(*root_id));

        // Replies carry the reply-type marker.
        assert!(matches!(reply1_dict.get(b"RT"), Ok(Object::Name(n)) if n == b"R"));
        // Author and date survive.
        assert!(matches!(root_dict.get(b"T"), Ok(Object::String(b, _)) if b == b"Admin"));
        assert!(
            matches!(root_dict.get(b"CreationDate"), Ok(Object::String(b, _)) if b.starts_with(b"D:20260807112400"))
        );
    }

    #[test]
    fn non_marker_annotations_are_preserved() {
        let pdf = pdf_with_annots(vec![
            external_link("https://example.com/"),
            marker_link("n1", [10, 10, 30, 30]),
        ]);
        let n1 = note("n1", "A", "text", vec![]);
        let out = attach_notes(&pdf, &[n1], None).unwrap();

        let doc = Document::load_mem(&out).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        let entries = page_annotation_entries(&doc, page_id);

        let mut links = 0;
        let mut texts = 0;
        for entry in &entries {
            let dict = resolve_dict(&doc, entry).unwrap();
            match dict.get(b"Subtype") {
                Ok(Object::Name(n)) if n == b"Link" => links += 1,
                Ok(Object::Name(n)) if n == b"Text" => texts += 1,
                _ => {}
            }
        }
        assert_eq!(links, 1, "external link must survive");
        assert_eq!(texts, 1);
    }

    #[test]
    fn unmatched_marker_scheme_link_is_left_alone() {
        // Marker-scheme link whose id has no corresponding note.
        let pdf = pdf_with_annots(vec![marker_link("ghost", [10, 10, 30, 30])]);
        let n1 = note("other", "A", "text", vec![]);
        let out = attach_notes(&pdf, &[n1], None).unwrap();
        let doc = Document::load_mem(&out).unwrap();
        let page_id = *doc.get_pages().values().next().unwrap();
        assert_eq!(page_annotation_entries(&doc, page_id).len(), 1);
    }

    #[test]
    fn empty_note_list_returns_input_unchanged() {
        let pdf = pdf_with_annots(vec![marker_link("n1", [10, 10, 30, 30])]);
        let out = attach_notes(&pdf, &[], None).unwrap();
        assert_eq!(out, pdf);
    }

    #[test]
    fn icon_appearance_is_attached_when_available() {
        use image::{Rgba, RgbaImage};
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([255, 200, 0, 128])))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let icon = NoteIcon::from_png_bytes(&png).unwrap();
        assert!(icon.alpha.is_some());

        let pdf = pdf_with_annots(vec![marker_link("n1", [100, 700, 120, 720])]);
        let n1 = note("n1", "A", "text", vec![]);
        let out = attach_notes(&pdf, &[n1], Some(&icon)).unwrap();

        let texts = text_annotations(&out);
        assert_eq!(texts.len(), 1);
        let (_, dict) = &texts[0];
        let ap = match dict.get(b"AP") {
            Ok(Object::Dictionary(d)) => d.clone(),
            other => panic!("expected /AP dictionary, got {other:?}"),
        };
        assert!(matches!(ap.get(b"N"), Ok(Object::Reference(_))));
    }

    #[test]
    fn title_sets_subject_and_empty_title_omits_it() {
        let pdf = pdf_with_annots(vec![marker_link("n1", [0, 0, 20, 20])]);
        let mut titled = note("n1", "A", "text", vec![]);
        titled.title = "Heads up".to_string();
        let out = attach_notes(&pdf, &[titled], None).unwrap();
        let (_, dict) = &text_annotations(&out)[0];
        assert!(matches!(dict.get(b"Subj"), Ok(Object::String(b, _)) if b == b"Heads up"));

        let pdf2 = pdf_with_annots(vec![marker_link("n2", [0, 0, 20, 20])]);
        let untitled = note("n2", "A", "text", vec![]);
        let out2 = attach_notes(&pdf2, &[untitled], None).unwrap();
        let (_, dict2) = &text_annotations(&out2)[0];
        assert!(dict2.get(b"Subj").is_err());
    }

    #[test]
    fn unicode_strings_become_utf16be() {
        match pdf_text_string("Grüße") {
            Object::String(bytes, StringFormat::Hexadecimal) => {
                assert_eq!(&bytes[..2], &[0xfe, 0xff]);
            }
            other => panic!("expected hexadecimal string, got {other:?}"),
        }
        match pdf_text_string("plain") {
            Object::String(bytes, StringFormat::Literal) => assert_eq!(bytes, b"plain"),
            other => panic!("expected literal string, got {other:?}"),
        }
    }

    #[test]
    fn pdf_date_formats() {
        assert_eq!(
            format_pdf_date("2026-08-07 11:24"),
            Some("D:20260807112400".to_string())
        );
        assert_eq!(
            format_pdf_date("2026-08-07 11:24:30"),
            Some("D:20260807112430".to_string())
        );
        assert_eq!(
            format_pdf_date("2026-08-07T11:24:30"),
            Some("D:20260807112430".to_string())
        );
        assert_eq!(
            format_pdf_date("2026-08-07T11:24:30+02:00"),
            Some("D:20260807112430+02'00".to_string())
        );
        assert_eq!(
            format_pdf_date("2026-08-07T11:24:30Z"),
            Some("D:20260807112430+00'00".to_string())
        );
        assert_eq!(format_pdf_date(""), None);
        assert_eq!(format_pdf_date("next tuesday"), None);
    }
}
