//! CSS length and SVG viewBox resolution.
//!
//! Pure functions converting length strings with unit suffixes into integer
//! pixel counts at the 96-DPI CSS baseline. Values round **up** to the next
//! whole pixel so the rendered raster surface is never smaller than the
//! declared box.
//!
//! Relative units (`vw`, `vh`, `%`) resolve against a viewBox extent. Using
//! them without a viewBox is a contract violation surfaced as
//! [`UnitError::RelativeWithoutViewBox`], never silently defaulted — the
//! pipeline above catches it and leaves the image untouched.

use crate::error::UnitError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Units that resolve against a viewBox extent rather than a fixed ratio.
pub const RELATIVE_UNITS: [&str; 3] = ["vw", "vh", "%"];

/// `<value><unit?>` attribute grammar: an optionally negative decimal number
/// followed by an optional alphabetic or `%` unit. Anything else is not a
/// length.
static LENGTH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<value>-?\d+(?:\.\d+)?)(?P<unit>[a-zA-Z%]+)?$").unwrap());

/// A parsed CSS length: numeric value plus optional unit suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct Length {
    pub value: f64,
    pub unit: Option<String>,
}

impl Length {
    /// Parse an attribute value like `"120"`, `"12.5pt"` or `"100vw"`.
    ///
    /// Returns `None` for anything outside the length grammar (e.g. `"auto"`,
    /// `"calc(100% - 2px)"`, empty strings).
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = LENGTH_RE.captures(raw.trim())?;
        let value: f64 = caps.name("value")?.as_str().parse().ok()?;
        let unit = caps.name("unit").map(|m| m.as_str().to_ascii_lowercase());
        Some(Length { value, unit })
    }

    /// Whether the unit requires a viewBox to resolve.
    pub fn is_relative(&self) -> bool {
        self.unit
            .as_deref()
            .is_some_and(|u| RELATIVE_UNITS.contains(&u))
    }
}

/// Pixels-per-unit ratio at 96 DPI. Unknown or absent units behave like `px`.
pub fn px_ratio(unit: Option<&str>) -> f64 {
    match unit {
        Some("px") | None => 1.0,
        Some("pt") => 4.0 / 3.0,
        Some("in") => 96.0,
        Some("cm") => 96.0 / 2.54,
        Some("mm") => 96.0 / 25.4,
        Some("pc") => 16.0,
        Some("ex") => 8.0,
        Some(_) => 1.0,
    }
}

/// Resolve a length to an integer pixel count.
///
/// * Absolute (or unknown) units: `ceil(value × ratio)`; non-positive
///   results are treated as malformed and yield `Ok(None)`.
/// * Relative units: `ceil(value / 100 × viewbox_extent)`; the matching
///   viewBox extent is **required** and its absence is a hard error.
pub fn resolve_px(length: &Length, viewbox_extent: Option<f64>) -> Result<Option<u32>, UnitError> {
    let px = if length.is_relative() {
        let unit = length.unit.clone().unwrap_or_default();
        let extent = viewbox_extent.ok_or(UnitError::RelativeWithoutViewBox { unit })?;
        (length.value / 100.0 * extent).ceil()
    } else {
        (length.value * px_ratio(length.unit.as_deref())).ceil()
    };

    if px.is_finite() && px > 0.0 {
        Ok(Some(px as u32))
    } else {
        Ok(None)
    }
}

/// An SVG viewBox: `min-x min-y width height`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewBox {
    pub min_x: f64,
    pub min_y: f64,
    pub width: f64,
    pub height: f64,
}

impl ViewBox {
    /// Parse a viewBox attribute value.
    ///
    /// Tokens may be separated by whitespace and/or commas. Any token count
    /// other than four, or any non-numeric token, means "not present":
    /// a missing viewBox is a normal, recoverable condition, distinct from
    /// the relative-unit contract violation.
    pub fn parse(raw: &str) -> Option<Self> {
        let tokens: Vec<&str> = raw
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() != 4 {
            return None;
        }
        let nums: Vec<f64> = tokens
            .iter()
            .map(|t| t.parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        if nums.iter().any(|n| !n.is_finite()) {
            return None;
        }
        Some(ViewBox {
            min_x: nums[0],
            min_y: nums[1],
            width: nums[2],
            height: nums[3],
        })
    }
}
