//! End-to-end pipeline tests.
//!
//! The render backend is driven by a mock engine that produces real PNGs at
//! the requested viewport size, and the external PDF engine is a fake that
//! does exactly what the pipeline relies on a real engine to do: turn
//! marker links into `/Link` annotations with `/URI` actions. Everything in
//! between — extraction, dimension resolution, rendering, cropping,
//! splicing, annotation synthesis — is the real code.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{ImageFormat, Rgba, RgbaImage};
use inkpress::{
    BackendConfig, ConvertOptions, Converter, EngineError, OfficeConverter, PdfEngine,
    PdfEngineError, PdfRequest, RasterEngine, RenderBackend, RenderRequest,
};
use lopdf::{dictionary, Document, Object};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ── Mock raster engine ───────────────────────────────────────────────────

/// Produces a solid PNG at exactly the requested viewport size.
#[derive(Default)]
struct PngEngine {
    renders: AtomicUsize,
}

#[async_trait]
impl RasterEngine for PngEngine {
    async fn launch(&self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn shutdown(&self) -> Result<(), EngineError> {
        Ok(())
    }
    async fn is_connected(&self) -> bool {
        true
    }
    async fn version(&self) -> Option<String> {
        Some("PngEngine/1.0".into())
    }
    async fn render(&self, request: &RenderRequest) -> Result<Vec<u8>, EngineError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let img = RgbaImage::from_pixel(request.width, request.height, Rgba([10, 20, 30, 255]));
        let mut out = Vec::new();
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| EngineError::NonZeroExit {
                code: None,
                stderr: e.to_string(),
            })?;
        Ok(out)
    }
}

// ── Fake PDF engine ──────────────────────────────────────────────────────

/// Implements the engine-side contract the post-processor depends on:
/// every `<a href="inkpress-note://…">` in the HTML becomes a `/Link`
/// annotation with a `/URI` action on a one-page PDF.
#[derive(Default)]
struct LinkingPdfEngine {
    seen_html: Mutex<Option<String>>,
    seen_request: Mutex<Option<PdfRequest>>,
}

#[async_trait]
impl PdfEngine for LinkingPdfEngine {
    async fn render_pdf(&self, html: &str, request: &PdfRequest) -> Result<Vec<u8>, PdfEngineError> {
        *self.seen_html.lock().unwrap() = Some(html.to_string());
        *self.seen_request.lock().unwrap() = Some(request.clone());

        let marker = regex::Regex::new(r#"href="(inkpress-note://[^"]+)""#).unwrap();
        let uris: Vec<String> = marker
            .captures_iter(html)
            .map(|c| c[1].to_string())
            .collect();

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let annots: Vec<Object> = uris
            .iter()
            .enumerate()
            .map(|(i, uri)| {
                let y = 700 - (i as i64) * 30;
                let dict = dictionary! {
                    "Type" => "Annot",
                    "Subtype" => "Link",
                    "Rect" => vec![
                        100.into(),
                        y.into(),
                        120.into(),
                        (y + 20).into(),
                    ],
                    "A" => dictionary! {
                        "Type" => "Action",
                        "S" => "URI",
                        "URI" => Object::string_literal(uri.as_str()),
                    },
                };
                Object::Reference(doc.add_object(dict))
            })
            .collect();

        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => Object::Reference(pages_id),
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Annots" => Object::Array(annots),
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
        doc.save_to(&mut out)?;
        Ok(out)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

async fn running_converter(options: ConvertOptions) -> (Converter, Arc<RenderBackend>, Arc<PngEngine>) {
    let engine = Arc::new(PngEngine::default());
    let backend = Arc::new(RenderBackend::new(engine.clone(), BackendConfig::default()));
    backend.start().await.unwrap();
    let office = Arc::new(OfficeConverter::unavailable());
    let converter = Converter::new(backend.clone(), office, options);
    (converter, backend, engine)
}

fn b64(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

fn count_annotations_by_subtype(pdf: &[u8], subtype: &[u8]) -> usize {
    let doc = Document::load_mem(pdf).unwrap();
    let mut count = 0;
    for page_id in doc.get_pages().values().copied() {
        let page = doc.get_dictionary(page_id).unwrap();
        let Ok(annots) = page.get(b"Annots") else { continue };
        let entries = match annots {
            Object::Array(entries) => entries.clone(),
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(Object::Array(entries)) => entries.clone(),
                _ => continue,
            },
            _ => continue,
        };
        for entry in entries {
            let dict = match entry {
                Object::Dictionary(d) => d,
                Object::Reference(id) => match doc.get_object(id) {
                    Ok(Object::Dictionary(d)) => d.clone(),
                    _ => continue,
                },
                _ => continue,
            };
            if matches!(dict.get(b"Subtype"), Ok(Object::Name(n)) if n == subtype) {
                count += 1;
            }
        }
    }
    count
}

const NOTE_HTML: &str = r#"
    <div class="inkpress-note">
        <div class="inkpress-note-time">2026-08-07 11:24</div>
        <div class="inkpress-note-author">Admin</div>
        <div class="inkpress-note-text">Looks wrong</div>
        <div class="inkpress-note">
            <div class="inkpress-note-author">Reviewer</div>
            <div class="inkpress-note-text">Agreed</div>
        </div>
    </div>
"#;

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn preprocess_normalizes_svgs_and_extracts_notes() {
    let (converter, backend, engine) = running_converter(ConvertOptions::default()).await;

    let svg_payload = b64(r#"<svg width="40" height="20"></svg>"#);
    let png_payload = b64("fake png bytes");
    let html = format!(
        r#"<p>before</p>
           <svg viewBox="0 0 300 150"></svg>
           <img src="data:image/svg+xml;base64,{svg_payload}">
           <img src="data:image/png;base64,{png_payload}">
           {NOTE_HTML}"#
    );

    let result = converter.preprocess(&html).await.unwrap();

    // Inline SVG and the data-URI SVG both rendered; the PNG stayed put.
    assert_eq!(result.stats.inline_svgs_rewritten, 1);
    assert_eq!(result.stats.images_converted, 2);
    assert_eq!(engine.renders.load(Ordering::SeqCst), 2);
    assert!(!result.html.contains("<svg"), "inline svg must be gone");
    assert!(result.html.contains("data:image/png;base64,"));
    assert!(
        result.html.contains(&png_payload),
        "explicit raster payload must be untouched"
    );

    // The resolved vector size is propagated into layout.
    assert!(result.html.contains(r#"width="300px""#), "got: {}", result.html);
    assert!(result.html.contains(r#"width="40px""#), "got: {}", result.html);

    // Note markup became a marker link and a parsed tree.
    assert_eq!(result.notes.len(), 1);
    assert_eq!(result.notes[0].replies.len(), 1);
    assert!(result.html.contains("inkpress-note://"));
    assert!(!result.html.contains("inkpress-note\""));

    backend.stop().await.unwrap();
}

#[tokio::test]
async fn full_conversion_produces_nested_sticky_annotations() {
    let (converter, backend, _engine) = running_converter(ConvertOptions::default()).await;
    let pdf_engine = LinkingPdfEngine::default();
    let workspace = tempfile::tempdir().unwrap();

    let html = format!(r#"<svg viewBox="0 0 80 40"></svg>{NOTE_HTML}"#);
    let output = converter
        .convert(&html, &[], workspace.path(), &pdf_engine)
        .await
        .unwrap();

    assert_eq!(output.notes.len(), 1);
    assert_eq!(output.notes[0].annotation_count(), 2);

    // The marker /Link was replaced by exactly R+1 = 2 /Text annotations.
    assert_eq!(count_annotations_by_subtype(&output.pdf, b"Text"), 2);
    assert_eq!(count_annotations_by_subtype(&output.pdf, b"Link"), 0);

    // Reply chain: the reply's /IRT points at the root annotation.
    let doc = Document::load_mem(&output.pdf).unwrap();
    let page_id = *doc.get_pages().values().next().unwrap();
    let page = doc.get_dictionary(page_id).unwrap();
    let annots = match page.get(b"Annots").unwrap() {
        Object::Array(entries) => entries.clone(),
        other => panic!("expected direct annots array, got {other:?}"),
    };
    let ids: Vec<_> = annots
        .iter()
        .map(|o| match o {
            Object::Reference(id) => *id,
            other => panic!("expected references, got {other:?}"),
        })
        .collect();
    let root = doc.get_dictionary(ids[0]).unwrap();
    let reply = doc.get_dictionary(ids[1]).unwrap();
    assert!(root.get(b"IRT").is_err());
    assert!(matches!(reply.get(b"IRT"), Ok(Object::Reference(id)) if *id == ids[0]));
    assert!(
        matches!(root.get(b"CreationDate"), Ok(Object::String(b, _)) if b.starts_with(b"D:20260807"))
    );

    backend.stop().await.unwrap();
}

#[tokio::test]
async fn stopped_backend_degrades_to_original_images() {
    let (converter, backend, engine) = running_converter(ConvertOptions::default()).await;
    backend.stop().await.unwrap();

    let pdf_engine = LinkingPdfEngine::default();
    let workspace = tempfile::tempdir().unwrap();
    let html = r#"<svg viewBox="0 0 10 10"></svg><p>text</p>"#;

    let output = converter
        .convert(html, &[], workspace.path(), &pdf_engine)
        .await
        .unwrap();

    // No render happened, the document still became a PDF.
    assert_eq!(engine.renders.load(Ordering::SeqCst), 0);
    assert_eq!(output.stats.images_converted, 0);
    assert!(output.stats.images_skipped >= 1);
    assert!(!output.pdf.is_empty());

    // The pre-render form (SVG data URI) went to the engine unchanged.
    let seen = pdf_engine.seen_html.lock().unwrap().clone().unwrap();
    assert!(seen.contains("data:image/svg+xml;base64,"), "got: {seen}");
}

#[tokio::test]
async fn fail_on_image_error_escalates_backend_failures() {
    let options = ConvertOptions::builder()
        .fail_on_image_error(true)
        .build()
        .unwrap();
    let (converter, backend, _engine) = running_converter(options).await;
    backend.stop().await.unwrap();

    let pdf_engine = LinkingPdfEngine::default();
    let workspace = tempfile::tempdir().unwrap();
    let err = converter
        .convert(r#"<svg viewBox="0 0 10 10"></svg>"#, &[], workspace.path(), &pdf_engine)
        .await
        .unwrap_err();
    assert!(matches!(err, inkpress::Error::ImageConversionRequired(_)));
}

#[tokio::test]
async fn raster_data_uris_never_reach_the_render_path() {
    let (converter, backend, engine) = running_converter(ConvertOptions::default()).await;

    // Valid SVG text labelled as PNG: the denylist wins over content.
    let payload = b64(r#"<svg width="5" height="5"></svg>"#);
    let html = format!(r#"<img src="data:image/png;base64,{payload}">"#);
    let result = converter.preprocess(&html).await.unwrap();

    assert_eq!(engine.renders.load(Ordering::SeqCst), 0);
    assert_eq!(result.stats.images_converted, 0);
    assert_eq!(result.stats.images_skipped, 1);

    backend.stop().await.unwrap();
}

#[tokio::test]
async fn attachments_are_split_into_links_and_embeds() {
    let (converter, backend, _engine) = running_converter(ConvertOptions::default()).await;
    let pdf_engine = LinkingPdfEngine::default();
    let workspace = tempfile::tempdir().unwrap();

    let uploads = vec![
        inkpress::Upload {
            basename: "linked.txt".into(),
            bytes: b"linked content".to_vec(),
        },
        inkpress::Upload {
            basename: "embedded.bin".into(),
            bytes: b"embedded content".to_vec(),
        },
    ];
    let html = r#"<a rel="attachment" href="linked.txt">the file</a>"#;

    let output = converter
        .convert(html, &uploads, workspace.path(), &pdf_engine)
        .await
        .unwrap();
    assert_eq!(output.stats.attachments_embedded, 1);

    let request = pdf_engine.seen_request.lock().unwrap().clone().unwrap();
    assert_eq!(request.attachments.len(), 1);
    assert_eq!(request.attachments[0].basename, "embedded.bin");
    assert!(request.attachments[0].path.exists());

    let seen = pdf_engine.seen_html.lock().unwrap().clone().unwrap();
    assert!(seen.contains("href=\"file://"), "got: {seen}");

    backend.stop().await.unwrap();
}

#[tokio::test]
async fn preprocessing_twice_is_stable() {
    let (converter, backend, _engine) = running_converter(ConvertOptions::default()).await;

    let html = r#"<svg viewBox="0 0 20 10"></svg>"#;
    let first = converter.preprocess(html).await.unwrap();
    let second = converter.preprocess(&first.html).await.unwrap();

    // The PNG produced by pass one is an explicit raster type now; pass two
    // must not touch it.
    assert_eq!(second.stats.inline_svgs_rewritten, 0);
    assert_eq!(second.stats.images_converted, 0);

    backend.stop().await.unwrap();
}
