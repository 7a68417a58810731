//! The star list: add, remove, refit, sort, average.
//!
//! A [`StarCollection`] owns every star measured on one view, hands out
//! stable numeric ids, and runs the bulk refit operations over worker threads
//! when the list is large enough to be worth splitting.

use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::detect::locator::{detect, Detection, DetectorConfig};
use crate::error::StarfitError;
use crate::frame::Frame;
use crate::psf::fit::{fit_psf, FitStatus, PsfResult};
use crate::psf::model::{fwhm, PsfFunction};
use crate::psf::select::{fit_models, PsfOptions};

/// Minimum stars per worker for the bulk refit operations.
const STARS_PER_WORKER: usize = 4;

/// Plate solution mapping image coordinates to celestial ones.
///
/// Implementations come from outside this crate; when one is attached to a
/// collection, every fitted center also carries its celestial position.
pub trait AstrometricSolution: Send + Sync {
    /// Celestial coordinates (right ascension, declination, degrees) of an
    /// image position, or `None` outside the solution's validity region.
    fn image_to_celestial(&self, x: f64, y: f64) -> Option<(f64, f64)>;
}

/// One measured star: its detection and the PSFs fitted to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Star {
    /// Collection-unique id, never reused after removal.
    pub id: u32,
    pub detection: Detection,
    pub psfs: Vec<PsfResult>,
}

impl Star {
    /// Barycenter x, image coordinates.
    pub fn x(&self) -> f64 {
        self.detection.x
    }

    /// Barycenter y, image coordinates.
    pub fn y(&self) -> f64 {
        self.detection.y
    }

    /// True when the detection converged.
    pub fn is_detected(&self) -> bool {
        self.detection.is_detected()
    }
}

/// Sort keys for [`StarCollection::sort_stars`].
///
/// Every criterion except `Id` reduces over the star's fitted PSFs with a
/// minimum; stars without PSFs sort as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortingCriterion {
    Id,
    Background,
    Amplitude,
    Sigma,
    AspectRatio,
    Theta,
    AbsTheta,
    Beta,
    Mad,
}

/// Parameter averages over a set of fitted PSFs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfAverage {
    /// `Gaussian`, or `Moffat` for any mix of the Moffat family.
    pub function: PsfFunction,
    /// Number of PSFs averaged.
    pub n: usize,
    pub b: f64,
    pub a: f64,
    pub sx: f64,
    pub sy: f64,
    /// Mean signed rotation angle, degrees.
    pub theta: f64,
    /// Mean beta; 0 for Gaussian.
    pub beta: f64,
    pub mad: f64,
    /// FWHM of the averaged profile, pixels, major axis.
    pub fwhm_x: f64,
    /// FWHM of the averaged profile, pixels, minor axis.
    pub fwhm_y: f64,
}

/// All stars measured on one view.
pub struct StarCollection {
    /// Identifier of the source view, used in exports.
    pub view_id: String,
    x_scale: f64,
    y_scale: f64,
    stars: Vec<Star>,
    next_id: u32,
    astrometry: Option<Arc<dyn AstrometricSolution>>,
}

impl StarCollection {
    pub fn new(view_id: impl Into<String>) -> Self {
        Self {
            view_id: view_id.into(),
            x_scale: 0.0,
            y_scale: 0.0,
            stars: Vec::new(),
            next_id: 1,
            astrometry: None,
        }
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    /// Angular scale in arcseconds per pixel; `(0, 0)` means pixel units.
    pub fn scale(&self) -> (f64, f64) {
        (self.x_scale, self.y_scale)
    }

    pub fn set_scale(&mut self, x_scale: f64, y_scale: f64) {
        self.x_scale = x_scale;
        self.y_scale = y_scale;
    }

    /// Attach or detach a plate solution and refresh every fitted center's
    /// celestial coordinates.
    pub fn set_astrometry(&mut self, astrometry: Option<Arc<dyn AstrometricSolution>>) {
        self.astrometry = astrometry;
        for star in &mut self.stars {
            for psf in &mut star.psfs {
                psf.q0 = celestial(self.astrometry.as_deref(), psf);
            }
        }
    }

    /// Look up one star.
    ///
    /// # Errors
    /// `UnknownStarId` when no star carries `id`.
    pub fn star(&self, id: u32) -> Result<&Star, StarfitError> {
        self.stars
            .iter()
            .find(|s| s.id == id)
            .ok_or(StarfitError::UnknownStarId(id))
    }

    /// Detect a star around a seed position and fit the configured models.
    ///
    /// Returns the new star's id, or `None` when detection fails; a failed
    /// candidate is not kept.
    pub fn add_star(
        &mut self,
        frame: &Frame,
        channel: usize,
        seed_x: f64,
        seed_y: f64,
        detector: &DetectorConfig,
        options: &PsfOptions,
    ) -> Option<u32> {
        let detection = detect(frame, channel, seed_x, seed_y, detector);
        if !detection.is_detected() {
            debug!(
                "candidate at ({seed_x:.1}, {seed_y:.1}) rejected: {}",
                detection.status.message()
            );
            return None;
        }

        let mut psfs = fit_models(frame, channel, &detection, options);
        for psf in &mut psfs {
            psf.q0 = celestial(self.astrometry.as_deref(), psf);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.stars.push(Star {
            id,
            detection,
            psfs,
        });
        Some(id)
    }

    /// Fit one more model to an existing star and append it when it
    /// converges. Returns whether the fit was kept.
    ///
    /// # Errors
    /// `UnknownStarId` when no star carries `id`.
    pub fn add_psf(
        &mut self,
        frame: &Frame,
        id: u32,
        function: PsfFunction,
        circular: bool,
    ) -> Result<bool, StarfitError> {
        let astrometry = self.astrometry.clone();
        let star = self
            .stars
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StarfitError::UnknownStarId(id))?;

        let det = star.detection;
        let mut psf = fit_psf(frame, det.channel, det.x, det.y, det.rect, function, circular);
        if !psf.is_fitted() {
            return Ok(false);
        }
        psf.q0 = celestial(astrometry.as_deref(), &psf);
        star.psfs.push(psf);
        Ok(true)
    }

    /// Drop one PSF from a star; an out-of-range index is a no-op. The star
    /// itself stays, possibly with an empty PSF list.
    ///
    /// # Errors
    /// `UnknownStarId` when no star carries `id`.
    pub fn remove_psf(&mut self, id: u32, index: usize) -> Result<(), StarfitError> {
        let star = self
            .stars
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StarfitError::UnknownStarId(id))?;
        if index < star.psfs.len() {
            star.psfs.remove(index);
        }
        Ok(())
    }

    /// Remove the stars with the given ids; unknown ids are ignored.
    /// Returns the ids actually removed.
    pub fn remove_stars(&mut self, ids: &[u32]) -> Vec<u32> {
        let mut removed = Vec::new();
        self.stars.retain(|s| {
            if ids.contains(&s.id) {
                removed.push(s.id);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Re-run detection and model selection from scratch for every star,
    /// replacing all its PSFs. A star whose re-detection fails carries the
    /// failed status and ends up with no PSFs. Returns the ids of the stars
    /// touched.
    pub fn regenerate(
        &mut self,
        frame: &Frame,
        detector: &DetectorConfig,
        options: &PsfOptions,
    ) -> Vec<u32> {
        let astrometry = self.astrometry.clone();
        self.for_each_star(|star| {
            let detection = detect(
                frame,
                star.detection.channel,
                star.detection.x,
                star.detection.y,
                detector,
            );
            if !detection.is_detected() {
                warn!(
                    "star {}: redetection failed: {}",
                    star.id,
                    detection.status.message()
                );
                star.detection.status = detection.status;
                star.psfs.clear();
                return;
            }

            star.detection = detection;
            star.psfs = fit_models(frame, detection.channel, &detection, options);
            for psf in &mut star.psfs {
                psf.q0 = celestial(astrometry.as_deref(), psf);
            }
        });
        info!("regenerated {} stars", self.stars.len());
        self.stars.iter().map(|s| s.id).collect()
    }

    /// Re-detect every star from its current position and refit its existing
    /// PSF models in place.
    ///
    /// A star whose re-detection fails keeps its parameters but carries the
    /// failed detection status, and its PSFs drop to `NotFitted`. A PSF whose
    /// refit fails likewise keeps its old parameters under the new status.
    /// Returns the ids of the stars touched.
    pub fn recalculate(&mut self, frame: &Frame, detector: &DetectorConfig) -> Vec<u32> {
        let astrometry = self.astrometry.clone();
        self.for_each_star(|star| {
            let config = DetectorConfig {
                search_radius: star.detection.rect.width() / 2,
                ..*detector
            };
            let detection = detect(
                frame,
                star.detection.channel,
                star.detection.x,
                star.detection.y,
                &config,
            );

            if !detection.is_detected() {
                warn!(
                    "star {}: redetection failed: {}",
                    star.id,
                    detection.status.message()
                );
                star.detection.status = detection.status;
                for psf in &mut star.psfs {
                    psf.status = FitStatus::NotFitted;
                }
                return;
            }

            star.detection = detection;
            for psf in &mut star.psfs {
                let refit = fit_psf(
                    frame,
                    detection.channel,
                    detection.x,
                    detection.y,
                    detection.rect,
                    psf.function,
                    psf.circular,
                );
                if refit.is_fitted() {
                    *psf = refit;
                    psf.q0 = celestial(astrometry.as_deref(), psf);
                } else {
                    psf.status = refit.status;
                }
            }
        });
        info!("recalculated {} stars", self.stars.len());
        self.stars.iter().map(|s| s.id).collect()
    }

    /// Stable sort by the given criterion.
    ///
    /// `signed_angles` only affects [`SortingCriterion::Theta`], which then
    /// compares angles folded into `(-90, 90]`.
    pub fn sort_stars(&mut self, criterion: SortingCriterion, signed_angles: bool) {
        self.stars.sort_by(|a, b| {
            sorting_value(a, criterion, signed_angles)
                .total_cmp(&sorting_value(b, criterion, signed_angles))
        });
    }

    /// Average the fitted PSF parameters over the given stars.
    ///
    /// Only converged PSFs participate. The mix must stay within one model
    /// family: Gaussian averages with Gaussian, any Moffat variant with any
    /// other.
    ///
    /// # Errors
    /// `UnknownStarId` for an id not in the collection,
    /// `IncongruentPsfFunctions` when Gaussian and Moffat fits are mixed,
    /// `InsufficientPsfData` when no converged PSF is found.
    pub fn average_psfs(&self, ids: &[u32]) -> Result<PsfAverage, StarfitError> {
        let mut family: Option<PsfFunction> = None;
        let mut n = 0usize;
        let (mut b, mut a, mut sx, mut sy) = (0.0, 0.0, 0.0, 0.0);
        let (mut theta, mut beta, mut mad) = (0.0, 0.0, 0.0);

        for &id in ids {
            let star = self.star(id)?;
            for psf in star.psfs.iter().filter(|p| p.is_fitted()) {
                let psf_family = if psf.function.is_moffat() {
                    PsfFunction::Moffat
                } else {
                    PsfFunction::Gaussian
                };
                match family {
                    None => family = Some(psf_family),
                    Some(f) if f != psf_family => {
                        return Err(StarfitError::IncongruentPsfFunctions)
                    }
                    Some(_) => {}
                }

                n += 1;
                b += psf.b;
                a += psf.a;
                sx += psf.sx;
                sy += psf.sy;
                theta += psf.display_theta(true);
                beta += psf.beta;
                mad += psf.mad;
            }
        }

        let function = family.ok_or(StarfitError::InsufficientPsfData)?;
        let n_f = n as f64;
        let (sx, sy, beta) = (sx / n_f, sy / n_f, beta / n_f);
        Ok(PsfAverage {
            function,
            n,
            b: b / n_f,
            a: a / n_f,
            sx,
            sy,
            theta: theta / n_f,
            beta,
            mad: mad / n_f,
            fwhm_x: fwhm(function, sx, beta),
            fwhm_y: fwhm(function, sy, beta),
        })
    }

    /// Run `op` over every star, in parallel when the list is large enough.
    ///
    /// Workers get contiguous chunks; a list shorter than one chunk per
    /// worker stays on the calling thread.
    fn for_each_star<F>(&mut self, op: F)
    where
        F: Fn(&mut Star) + Send + Sync,
    {
        let len = self.stars.len();
        if len == 0 {
            return;
        }
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = parallelism.min(len / STARS_PER_WORKER).max(1);
        if workers == 1 {
            for star in &mut self.stars {
                op(star);
            }
            return;
        }
        let chunk = len.div_ceil(workers);
        self.stars
            .par_chunks_mut(chunk)
            .for_each(|stars| stars.iter_mut().for_each(&op));
    }
}

fn celestial(astrometry: Option<&dyn AstrometricSolution>, psf: &PsfResult) -> Option<(f64, f64)> {
    if !psf.is_fitted() {
        return None;
    }
    astrometry.and_then(|a| a.image_to_celestial(psf.cx, psf.cy))
}

/// Scalar sort key of one star.
///
/// Reduces over the star's PSFs with a minimum; a star without PSFs is zero
/// under every criterion except `Id`.
pub fn sorting_value(star: &Star, criterion: SortingCriterion, signed_angles: bool) -> f64 {
    if criterion == SortingCriterion::Id {
        return f64::from(star.id);
    }
    if star.psfs.is_empty() {
        return 0.0;
    }

    let min_over = |f: &dyn Fn(&PsfResult) -> f64| {
        star.psfs
            .iter()
            .map(f)
            .fold(f64::INFINITY, f64::min)
    };

    match criterion {
        SortingCriterion::Id => unreachable!(),
        SortingCriterion::Background => min_over(&|p| p.b),
        SortingCriterion::Amplitude => min_over(&|p| p.a),
        SortingCriterion::Sigma => min_over(&|p| p.sx.max(p.sy)),
        SortingCriterion::AspectRatio => min_over(&|p| p.sy / p.sx),
        SortingCriterion::Theta => min_over(&|p| p.display_theta(signed_angles)),
        SortingCriterion::AbsTheta => min_over(&|p| p.theta),
        SortingCriterion::Beta => {
            let v = star
                .psfs
                .iter()
                .filter(|p| p.function.is_moffat())
                .map(|p| p.beta)
                .fold(f64::INFINITY, f64::min);
            if v.is_finite() {
                v
            } else {
                0.0
            }
        }
        SortingCriterion::Mad => min_over(&|p| p.mad),
    }
}
