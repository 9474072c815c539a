//! Document pipeline stages.
//!
//! Each stage takes the parsed document, mutates only the nodes it owns and
//! reports what it did; a stage never fails the document for one bad image.
//! Order matters and is fixed by [`crate::convert::Converter`]:
//!
//! ```text
//! notes     extract note trees, leave marker links
//! extract   inline <svg> → <img data:image/svg+xml;base64,…>
//! raster    data-URI SVGs → rendered PNG (via the render backend)
//! vsdx      data-URI VSDX → PNG (via the office subprocess)
//! ```

pub mod extract;
pub mod notes;
pub mod raster;
pub mod vsdx;

pub use extract::{scan_svg_candidates, DataUri, EmbeddedImage, ScanReport};
pub use notes::Note;
pub use raster::StageReport;
