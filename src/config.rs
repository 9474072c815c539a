//! Conversion options.
//!
//! All per-request behaviour is controlled through [`ConvertOptions`],
//! built via its builder. The render backend carries its own
//! [`crate::backend::BackendConfig`]; options here are the per-document
//! knobs layered on top.

use crate::error::Error;
use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

/// Options for one conversion request.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertOptions {
    /// Base URL used by the PDF engine to resolve relative resources.
    pub base_url: Option<String>,

    /// CSS media type hint forwarded to the PDF engine. Default `"print"`.
    pub media_type: String,

    /// Text encoding label forwarded to the PDF engine. Default `"utf-8"`.
    pub encoding: String,

    /// Per-request device-scale-factor override. Range 1.0–10.0; `None`
    /// uses the backend default.
    pub scale_factor: Option<f64>,

    /// Extra pixels of render height compensating the headless browser's
    /// bottom-edge clipping, cropped off afterwards. Range 0–1000, default
    /// 100. A backend quirk knob, not semantics.
    pub clip_compensation_px: u32,

    /// Treat a render-backend failure as a request failure instead of
    /// degrading to the original image. Default `false`: best effort,
    /// never fail the document for one image.
    pub fail_on_image_error: bool,

    /// PNG icon for sticky-note appearance streams. `None` (default)
    /// produces plain annotations.
    pub note_icon: Option<PathBuf>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            media_type: "print".to_string(),
            encoding: "utf-8".to_string(),
            scale_factor: None,
            clip_compensation_px: 100,
            fail_on_image_error: false,
            note_icon: None,
        }
    }
}

impl ConvertOptions {
    pub fn builder() -> ConvertOptionsBuilder {
        ConvertOptionsBuilder {
            options: Self::default(),
        }
    }
}

/// Builder for [`ConvertOptions`].
#[derive(Debug)]
pub struct ConvertOptionsBuilder {
    options: ConvertOptions,
}

impl ConvertOptionsBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.options.base_url = Some(url.into());
        self
    }

    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.options.media_type = media_type.into();
        self
    }

    pub fn encoding(mut self, encoding: impl Into<String>) -> Self {
        self.options.encoding = encoding.into();
        self
    }

    /// Out-of-range values warn and fall back to the backend default.
    pub fn scale_factor(mut self, factor: f64) -> Self {
        if (1.0..=10.0).contains(&factor) {
            self.options.scale_factor = Some(factor);
        } else {
            warn!(factor, "scale_factor must be between 1.0 and 10.0, ignoring override");
            self.options.scale_factor = None;
        }
        self
    }

    /// Out-of-range values warn and fall back to the default of 100.
    pub fn clip_compensation_px(mut self, px: u32) -> Self {
        if px <= 1000 {
            self.options.clip_compensation_px = px;
        } else {
            warn!(px, "clip_compensation_px must be between 0 and 1000, using default 100");
            self.options.clip_compensation_px = 100;
        }
        self
    }

    pub fn fail_on_image_error(mut self, fail: bool) -> Self {
        self.options.fail_on_image_error = fail;
        self
    }

    pub fn note_icon(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.note_icon = Some(path.into());
        self
    }

    pub fn build(self) -> Result<ConvertOptions, Error> {
        let o = &self.options;
        if o.media_type.trim().is_empty() {
            return Err(Error::InvalidConfig("media_type must not be empty".into()));
        }
        if o.encoding.trim().is_empty() {
            return Err(Error::InvalidConfig("encoding must not be empty".into()));
        }
        Ok(self.options)
    }
}
