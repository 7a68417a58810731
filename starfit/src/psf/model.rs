//! PSF model families and their derived quantities.

use std::fmt;

use serde::{Deserialize, Serialize};

/// 2 * sqrt(2 * ln 2): FWHM of a unit-sigma Gaussian.
const GAUSSIAN_FWHM: f64 = 2.354_820_045_030_949_3;

/// Closed set of PSF model families.
///
/// `Moffat` fits the beta exponent as a free parameter; the numbered variants
/// fix it (`Moffat25` is beta = 2.5, `Moffat15` is beta = 1.5). A Lorentzian
/// profile is a Moffat with beta = 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PsfFunction {
    Gaussian,
    Moffat,
    Moffat10,
    Moffat8,
    Moffat6,
    Moffat4,
    Moffat25,
    Moffat15,
    Lorentzian,
}

impl PsfFunction {
    /// Fixed beta exponent, or `None` for Gaussian and variable-beta Moffat.
    pub fn fixed_beta(self) -> Option<f64> {
        match self {
            PsfFunction::Gaussian | PsfFunction::Moffat => None,
            PsfFunction::Moffat10 => Some(10.0),
            PsfFunction::Moffat8 => Some(8.0),
            PsfFunction::Moffat6 => Some(6.0),
            PsfFunction::Moffat4 => Some(4.0),
            PsfFunction::Moffat25 => Some(2.5),
            PsfFunction::Moffat15 => Some(1.5),
            PsfFunction::Lorentzian => Some(1.0),
        }
    }

    /// True for every member of the Moffat family, including Lorentzian.
    pub fn is_moffat(self) -> bool {
        self != PsfFunction::Gaussian
    }

    /// Display name, as used in exports.
    pub fn name(self) -> &'static str {
        match self {
            PsfFunction::Gaussian => "Gaussian",
            PsfFunction::Moffat => "Moffat",
            PsfFunction::Moffat10 => "Moffat10",
            PsfFunction::Moffat8 => "Moffat8",
            PsfFunction::Moffat6 => "Moffat6",
            PsfFunction::Moffat4 => "Moffat4",
            PsfFunction::Moffat25 => "Moffat2.5",
            PsfFunction::Moffat15 => "Moffat1.5",
            PsfFunction::Lorentzian => "Lorentzian",
        }
    }

    /// Fixed-beta fallback cascade for the automatic model selector, ordered
    /// from heaviest to lightest wings.
    pub fn fixed_beta_cascade() -> [PsfFunction; 7] {
        [
            PsfFunction::Moffat10,
            PsfFunction::Moffat8,
            PsfFunction::Moffat6,
            PsfFunction::Moffat4,
            PsfFunction::Moffat25,
            PsfFunction::Moffat15,
            PsfFunction::Lorentzian,
        ]
    }
}

impl fmt::Display for PsfFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full width at half maximum for a profile with the given sigma and beta.
///
/// Gaussian: `2 * sqrt(2 * ln 2) * sigma`. Moffat family:
/// `2 * sigma * sqrt(2^(1/beta) - 1)`. `beta` is ignored for Gaussian.
pub fn fwhm(function: PsfFunction, sigma: f64, beta: f64) -> f64 {
    match function {
        PsfFunction::Gaussian => GAUSSIAN_FWHM * sigma,
        _ => 2.0 * sigma * (2.0_f64.powf(1.0 / beta) - 1.0).sqrt(),
    }
}
