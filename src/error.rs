//! Error types for the inkpress library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Error`] — **Fatal**: the conversion cannot proceed at all (the PDF
//!   engine failed, the generated PDF is unparseable, I/O on the request
//!   workspace failed). Returned as `Err(Error)` from the top-level
//!   `Converter` entry points.
//!
//! * [`SkipReason`] — **Non-fatal**: a single embedded image could not be
//!   converted and its node is left in pre-render form. Every skip path is
//!   an explicit value rather than a caught exception, so the degradation
//!   policy is a testable branch, not a side effect.
//!
//! Component-level errors ([`BackendError`], [`EngineError`], [`VsdxError`],
//! [`UnitError`], [`AnnotError`]) stay close to the subsystem that produces
//! them and are wrapped into [`Error`] only where they become fatal.

use thiserror::Error;

/// All fatal errors returned by the inkpress library.
///
/// Per-image failures use [`SkipReason`] and are recorded in
/// [`crate::convert::ConversionStats`] rather than propagated here.
#[derive(Debug, Error)]
pub enum Error {
    /// Builder validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The external HTML→PDF engine failed to produce a document.
    #[error("PDF engine failed: {0}")]
    PdfEngine(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The render backend failed and `fail_on_image_error` is set.
    #[error("image conversion failed and fail_on_image_error is set: {0}")]
    ImageConversionRequired(String),

    /// Post-processing the generated PDF failed structurally.
    #[error(transparent)]
    Annotation(#[from] AnnotError),

    /// I/O on the request-scoped workspace (attachment directory) failed.
    #[error("request workspace I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a single embedded image was left unchanged.
///
/// Content-shaped reasons (everything up to `DimensionsUnresolved`) are
/// normal and logged at debug level; backend-shaped reasons are logged at
/// warn and optionally escalated via `fail_on_image_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SkipReason {
    /// Content type is in the explicit raster denylist.
    #[error("raster content type {0} is never treated as an SVG candidate")]
    RasterContentType(String),

    /// The data-URI payload is not valid base64.
    #[error("payload is not valid base64")]
    UndecodableBase64,

    /// Decoded bytes contain a NUL byte — binary, not markup.
    #[error("payload is binary (contains NUL bytes)")]
    BinaryPayload,

    /// Decoded bytes are not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    /// The payload does not parse as well-formed XML.
    #[error("payload is not well-formed XML")]
    MalformedXml,

    /// Well-formed XML whose root element is not `svg`.
    #[error("XML root element is {0:?}, not svg")]
    NotSvg(String),

    /// Neither attributes nor viewBox yield both pixel dimensions.
    #[error("width/height could not be resolved to pixels")]
    DimensionsUnresolved,

    /// Relative units used without a viewBox (surfaced by the resolver,
    /// degraded here).
    #[error(transparent)]
    Unit(#[from] UnitError),

    /// The render backend failed after retries.
    #[error("render backend failed: {0}")]
    RenderFailed(String),

    /// The rendered raster could not be cropped to the requested box.
    #[error("rendered raster could not be cropped: {0}")]
    CropFailed(String),

    /// The backend returned output identical to the input payload.
    #[error("render produced unchanged output")]
    UnchangedOutput,

    /// No diagram-capable office subprocess on this host.
    #[error("office subprocess unavailable, VSDX conversion disabled")]
    VsdxUnavailable,

    /// VSDX payload failed structural validation or conversion.
    #[error("VSDX conversion failed: {0}")]
    Vsdx(String),
}

impl SkipReason {
    /// Whether this skip came from the render backend (as opposed to the
    /// content itself). Only backend skips honour `fail_on_image_error`.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, SkipReason::RenderFailed(_))
    }
}

/// Errors from the render backend manager.
#[derive(Debug, Error)]
pub enum BackendError {
    /// `convert_to_raster` was called before `start()`.
    #[error("render backend not started — call start() first")]
    NotStarted,

    /// A single render attempt exceeded the configured timeout.
    #[error("render timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The backend could not be restarted between attempts.
    #[error("backend restart failed after {context}: {source}")]
    RestartFailed {
        context: &'static str,
        #[source]
        source: EngineError,
    },

    /// All attempts exhausted; wraps the last failure.
    #[error("raster conversion failed after {attempts} attempts: {last}")]
    ConversionFailed { attempts: u32, last: String },

    /// The engine failed to launch.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Errors from a concrete [`crate::backend::RasterEngine`] implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No usable executable was configured or found.
    #[error("renderer executable not found: {0}")]
    ExecutableNotFound(String),

    /// Spawning or waiting on the subprocess failed.
    #[error("subprocess I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The subprocess exited non-zero.
    #[error("renderer exited with {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    /// The subprocess exited cleanly but produced no output file.
    #[error("renderer produced no output file")]
    MissingOutput,

    /// The engine is not launched.
    #[error("renderer process is not running")]
    NotRunning,
}

/// Errors from the VSDX conversion path.
#[derive(Debug, Error)]
pub enum VsdxError {
    /// Payload does not start with the ZIP local-file-header magic — the
    /// file is structurally corrupt, distinct from a conversion failure.
    #[error("VSDX payload missing ZIP magic, got {head:02x?}")]
    Corrupted { head: Vec<u8> },

    /// The office subprocess is not available on this host.
    #[error("office subprocess unavailable")]
    Unavailable,

    /// The office subprocess failed or produced no output.
    #[error("office conversion failed: {0}")]
    ConversionFailed(String),

    /// The office subprocess exceeded its timeout.
    #[error("office conversion timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Contract violation in the unit resolver: relative units require a
/// viewBox, and callers must have validated its presence first.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitError {
    #[error("{unit} units require a viewBox to be defined")]
    RelativeWithoutViewBox { unit: String },
}

/// Errors from PDF annotation post-processing.
#[derive(Debug, Error)]
pub enum AnnotError {
    /// The generated PDF could not be parsed or re-serialized.
    #[error("PDF structure error: {0}")]
    Pdf(#[from] lopdf::Error),

    /// The PDF could not be written back to bytes.
    #[error("PDF serialization failed: {0}")]
    Write(String),
}
