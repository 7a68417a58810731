//! Model selection over one detected star.
//!
//! Two modes: automatic, which races a Gaussian against the Moffat family and
//! keeps the single best fit by normalized absolute deviation, and explicit,
//! which fits every enabled model and keeps each one that converges.

use log::debug;

use crate::detect::locator::Detection;
use crate::frame::Frame;
use crate::psf::fit::{fit_psf, PsfResult};
use crate::psf::model::PsfFunction;

/// Which models to fit for each star.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsfOptions {
    /// Automatic selection: fit Gaussian and variable-beta Moffat, fall back
    /// to the fixed-beta cascade when the variable fit diverges, and keep the
    /// single fit with the smallest normalized absolute deviation. When set,
    /// the per-function flags below are ignored.
    pub auto_psf: bool,
    pub gaussian: bool,
    pub moffat: bool,
    pub moffat10: bool,
    pub moffat8: bool,
    pub moffat6: bool,
    pub moffat4: bool,
    pub moffat25: bool,
    pub moffat15: bool,
    pub lorentzian: bool,
    /// Prescribe circular profiles for every fit.
    pub circular: bool,
}

impl Default for PsfOptions {
    fn default() -> Self {
        Self {
            auto_psf: true,
            gaussian: true,
            moffat: false,
            moffat10: false,
            moffat8: false,
            moffat6: false,
            moffat4: false,
            moffat25: false,
            moffat15: false,
            lorentzian: false,
            circular: false,
        }
    }
}

impl PsfOptions {
    fn enabled_functions(&self) -> Vec<PsfFunction> {
        let flags = [
            (self.gaussian, PsfFunction::Gaussian),
            (self.moffat, PsfFunction::Moffat),
            (self.moffat10, PsfFunction::Moffat10),
            (self.moffat8, PsfFunction::Moffat8),
            (self.moffat6, PsfFunction::Moffat6),
            (self.moffat4, PsfFunction::Moffat4),
            (self.moffat25, PsfFunction::Moffat25),
            (self.moffat15, PsfFunction::Moffat15),
            (self.lorentzian, PsfFunction::Lorentzian),
        ];
        flags
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, f)| *f)
            .collect()
    }
}

/// Fit the configured models to one detection.
///
/// The detection must be valid; callers gate on [`Detection::is_detected`].
/// Only converged fits are returned: automatic mode yields at most one,
/// explicit mode at most one per enabled model. A star on which nothing
/// converges ends up with an empty list.
pub fn fit_models(
    frame: &Frame,
    channel: usize,
    detection: &Detection,
    options: &PsfOptions,
) -> Vec<PsfResult> {
    let (x, y, rect) = (detection.x, detection.y, detection.rect);

    if options.auto_psf {
        let mut candidates = vec![
            fit_psf(frame, channel, x, y, rect, PsfFunction::Gaussian, options.circular),
            fit_psf(frame, channel, x, y, rect, PsfFunction::Moffat, options.circular),
        ];
        if !candidates[1].is_fitted() {
            // The free-beta fit diverged; sweep the fixed exponents instead.
            debug!(
                "variable-beta fit failed ({:?}), sweeping fixed exponents",
                candidates[1].status
            );
            for function in PsfFunction::fixed_beta_cascade() {
                candidates.push(fit_psf(frame, channel, x, y, rect, function, options.circular));
            }
        }

        return candidates
            .iter()
            .filter(|p| p.is_fitted())
            .min_by(|a, b| a.mad.total_cmp(&b.mad))
            .cloned()
            .into_iter()
            .collect();
    }

    options
        .enabled_functions()
        .iter()
        .map(|&function| fit_psf(frame, channel, x, y, rect, function, options.circular))
        .filter(|psf| psf.is_fitted())
        .collect()
}
