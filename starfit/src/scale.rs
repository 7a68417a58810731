//! Angular image scale resolution.
//!
//! FWHM values are measured in pixels; reporting them in arcseconds needs the
//! image scale. The scale comes either from the standard acquisition keywords
//! (`FOCALLEN` in mm, `XPIXSZ`/`YPIXSZ` in micrometers), from a custom header
//! keyword carrying arcseconds per pixel directly, or from a literal value.
//! Header keywords are passed in as a name-to-value map; reading them from a
//! file is the caller's business.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::StarfitError;

/// Where the angular image scale comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScaleMode {
    /// No angular scale; sizes stay in pixels.
    Pixels,
    /// Compute from `FOCALLEN` and `XPIXSZ`/`YPIXSZ`. `YPIXSZ` falls back to
    /// `XPIXSZ` when absent.
    StandardKeywords,
    /// Read arcseconds per pixel from the named keyword.
    CustomKeyword(String),
    /// Use this many arcseconds per pixel on both axes.
    LiteralValue(f64),
}

impl Default for ScaleMode {
    fn default() -> Self {
        ScaleMode::Pixels
    }
}

/// Arcseconds per pixel subtended by a square pixel of `pixel_size`
/// micrometers at `focal_length` millimeters.
fn keyword_scale(pixel_size: f64, focal_length: f64) -> f64 {
    3.6 * (2.0 * pixel_size.atan2(2.0 * focal_length)).to_degrees()
}

/// Resolve a scale mode to `(x_scale, y_scale)` in arcseconds per pixel.
///
/// A zero scale on either axis means "pixels": downstream consumers fall back
/// to pixel units unless both scales are positive. Standard keywords that are
/// missing or non-positive resolve to zero rather than failing, matching how
/// frames without acquisition metadata are handled.
///
/// # Errors
/// `BadScaleKeyword` when a custom keyword is absent or non-positive.
pub fn resolve_scale(
    mode: &ScaleMode,
    keywords: &HashMap<String, f64>,
) -> Result<(f64, f64), StarfitError> {
    match mode {
        ScaleMode::Pixels => Ok((0.0, 0.0)),
        ScaleMode::StandardKeywords => {
            let focal = keywords.get("FOCALLEN").copied().unwrap_or(0.0);
            let x_pix = keywords.get("XPIXSZ").copied().unwrap_or(0.0);
            let y_pix = keywords.get("YPIXSZ").copied().unwrap_or(x_pix);
            if focal <= 0.0 || x_pix <= 0.0 {
                return Ok((0.0, 0.0));
            }
            Ok((keyword_scale(x_pix, focal), keyword_scale(y_pix, focal)))
        }
        ScaleMode::CustomKeyword(name) => {
            let value = keywords
                .get(name)
                .copied()
                .ok_or_else(|| StarfitError::BadScaleKeyword(name.clone()))?;
            if value <= 0.0 {
                return Err(StarfitError::BadScaleKeyword(name.clone()));
            }
            Ok((value, value))
        }
        ScaleMode::LiteralValue(value) => {
            if *value > 0.0 {
                Ok((*value, *value))
            } else {
                Ok((0.0, 0.0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn keywords(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn test_pixels_mode_is_unscaled() {
        assert_eq!(
            resolve_scale(&ScaleMode::Pixels, &HashMap::new()).unwrap(),
            (0.0, 0.0)
        );
    }

    #[test]
    fn test_standard_keywords() {
        // 5.4 um pixels at 1000 mm: ~1.1139 arcsec/px
        let kw = keywords(&[("FOCALLEN", 1000.0), ("XPIXSZ", 5.4)]);
        let (x, y) = resolve_scale(&ScaleMode::StandardKeywords, &kw).unwrap();
        assert_relative_eq!(x, 1.11383, epsilon = 1e-4);
        // YPIXSZ falls back to XPIXSZ
        assert_eq!(x, y);

        let kw = keywords(&[("FOCALLEN", 1000.0), ("XPIXSZ", 5.4), ("YPIXSZ", 10.8)]);
        let (x, y) = resolve_scale(&ScaleMode::StandardKeywords, &kw).unwrap();
        assert_relative_eq!(y, 2.0 * x, epsilon = 1e-6);
    }

    #[test]
    fn test_standard_keywords_missing_fall_back_to_pixels() {
        let kw = keywords(&[("XPIXSZ", 5.4)]);
        assert_eq!(
            resolve_scale(&ScaleMode::StandardKeywords, &kw).unwrap(),
            (0.0, 0.0)
        );
        assert_eq!(
            resolve_scale(&ScaleMode::StandardKeywords, &HashMap::new()).unwrap(),
            (0.0, 0.0)
        );
    }

    #[test]
    fn test_custom_keyword() {
        let kw = keywords(&[("PIXSCALE", 0.72)]);
        let mode = ScaleMode::CustomKeyword("PIXSCALE".into());
        assert_eq!(resolve_scale(&mode, &kw).unwrap(), (0.72, 0.72));

        let missing = ScaleMode::CustomKeyword("NOPE".into());
        assert!(matches!(
            resolve_scale(&missing, &kw),
            Err(StarfitError::BadScaleKeyword(name)) if name == "NOPE"
        ));

        let bad = keywords(&[("PIXSCALE", -1.0)]);
        assert!(resolve_scale(&mode, &bad).is_err());
    }

    #[test]
    fn test_literal_value() {
        assert_eq!(
            resolve_scale(&ScaleMode::LiteralValue(1.5), &HashMap::new()).unwrap(),
            (1.5, 1.5)
        );
        assert_eq!(
            resolve_scale(&ScaleMode::LiteralValue(0.0), &HashMap::new()).unwrap(),
            (0.0, 0.0)
        );
    }
}
