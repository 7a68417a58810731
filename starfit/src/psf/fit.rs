//! Nonlinear least-squares PSF fitting.
//!
//! One [`fit_psf`] call fits a single model family (circular or elliptical)
//! to the pixels of a sampling rectangle with a Levenberg-Marquardt solver
//! using finite-difference Jacobians. Parameter validity guards reject steps
//! into meaningless regions (negative background or amplitude, runaway beta)
//! by invalidating the trial step rather than clamping.
//!
//! Fitted sigmas are canonicalized afterwards: `sx` is forced positive,
//! elliptical fits swap axes so `sx >= sy`, and the rotation angle - which
//! the minimizer cannot pin down unambiguously - is resolved by testing the
//! four equivalent orientations against the sampled pixels.

use std::cell::Cell;

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::frame::{slice_median, Frame};
use crate::psf::model::{fwhm, PsfFunction};
use crate::rect::Rect;

/// Relative tolerance on the sum of squares, as used by the solver.
const FIT_TOLERANCE: f64 = 1.0e-8;

/// Finite-difference relative step (square root of machine epsilon).
const FD_STEP: f64 = 1.49e-8;

/// Largest damping factor before the solver gives up on improving.
const LAMBDA_MAX: f64 = 1.0e12;

/// Maximum relative beta change per evaluation for variable-beta fits.
const BETA_RATCHET: f64 = 0.05;

/// Outcome of one fit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// The fitter has not run.
    NotFitted,
    /// Converged within tolerance.
    FittedOk,
    /// Improper inputs: degenerate rectangle or too few samples.
    BadParameters,
    /// The gradient vanished without any meaningful reduction.
    NoSolution,
    /// The iteration budget ran out, or the solution failed the post-fit
    /// sanity checks (runaway beta, FWHM larger than the aperture).
    NoConvergence,
    /// The solver stalled before reaching the requested tolerance.
    InaccurateSolution,
    /// Reserved for internal failures.
    UnknownError,
}

impl FitStatus {
    /// True only for [`FitStatus::FittedOk`].
    pub fn is_fitted(self) -> bool {
        self == FitStatus::FittedOk
    }
}

/// One fitted PSF.
///
/// All geometry is in pixels and image coordinates; `theta` is in degrees in
/// `[0, 180)`. `beta` is 0 for Gaussian fits. Derived quantities (FWHM,
/// aspect ratio, eccentricity) are computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsfResult {
    pub function: PsfFunction,
    pub circular: bool,
    pub status: FitStatus,
    /// Local background level.
    pub b: f64,
    /// Peak amplitude above background.
    pub a: f64,
    /// Fitted center x, image coordinates.
    pub cx: f64,
    /// Fitted center y, image coordinates.
    pub cy: f64,
    /// Celestial coordinates of the center, when an astrometric solution is
    /// attached to the owning collection.
    pub q0: Option<(f64, f64)>,
    /// Sigma along the major axis. Equal to `sy` for circular fits.
    pub sx: f64,
    /// Sigma along the minor axis.
    pub sy: f64,
    /// Rotation angle in degrees, `[0, 180)`; 0 for circular fits.
    pub theta: f64,
    /// Moffat beta exponent; 0 for Gaussian.
    pub beta: f64,
    /// Mean absolute difference between model and samples, normalized by the
    /// fitted amplitude. Lower is better.
    pub mad: f64,
}

impl PsfResult {
    /// A failed fit with zeroed parameters.
    pub fn failed(function: PsfFunction, circular: bool, status: FitStatus) -> Self {
        Self {
            function,
            circular,
            status,
            b: 0.0,
            a: 0.0,
            cx: 0.0,
            cy: 0.0,
            q0: None,
            sx: 0.0,
            sy: 0.0,
            theta: 0.0,
            beta: 0.0,
            mad: 0.0,
        }
    }

    /// True only when the fit converged.
    pub fn is_fitted(&self) -> bool {
        self.status.is_fitted()
    }

    /// FWHM along the major axis, pixels.
    pub fn fwhm_x(&self) -> f64 {
        fwhm(self.function, self.sx, self.beta)
    }

    /// FWHM along the minor axis, pixels.
    pub fn fwhm_y(&self) -> f64 {
        fwhm(self.function, self.sy, self.beta)
    }

    /// Minor-to-major sigma ratio, in `(0, 1]`.
    pub fn aspect_ratio(&self) -> f64 {
        self.sy / self.sx
    }

    /// Eccentricity of the fitted ellipse, 0 for a circular profile.
    pub fn eccentricity(&self) -> f64 {
        let r = self.aspect_ratio();
        (1.0 - r * r).max(0.0).sqrt()
    }

    /// Rotation angle for display: with `signed` set, angles above 90 degrees
    /// are remapped to `theta - 180`, keeping the result in `(-90, 90]`.
    pub fn display_theta(&self, signed: bool) -> f64 {
        if signed && self.theta > 90.0 {
            self.theta - 180.0
        } else {
            self.theta
        }
    }
}

/// Everything one fit attempt needs: the sampled pixels, the model shape and
/// the variable-beta ratchet state.
struct FitProblem {
    samples: Array2<f64>,
    function: PsfFunction,
    circular: bool,
    /// Last accepted beta for variable-beta fits; evaluations drifting more
    /// than 5% from it are invalid.
    beta0: Cell<f64>,
}

impl FitProblem {
    fn variable_beta(&self) -> bool {
        self.function == PsfFunction::Moffat
    }

    fn n_params(&self) -> usize {
        let base = if self.circular { 5 } else { 7 };
        base + usize::from(self.variable_beta())
    }

    fn beta_of(&self, p: &DVector<f64>) -> f64 {
        match self.function.fixed_beta() {
            Some(beta) => beta,
            None => {
                if self.variable_beta() {
                    p[p.len() - 1]
                } else {
                    0.0
                }
            }
        }
    }

    /// Quadratic-form coefficients of the exponent/denominator. The Gaussian
    /// carries the conventional factor 2 in the sigma terms.
    fn quad_coeffs(&self, p: &DVector<f64>) -> (f64, f64, f64) {
        let k = if self.function == PsfFunction::Gaussian {
            2.0
        } else {
            1.0
        };
        let sx = p[4];
        if self.circular {
            let q = 1.0 / (k * sx * sx);
            (q, 0.0, q)
        } else {
            let sy = p[5];
            let theta = p[6];
            let (st, ct) = theta.sin_cos();
            let sct = st * ct;
            let st2 = st * st;
            let ct2 = ct * ct;
            let ksx2 = k * sx * sx;
            let ksy2 = k * sy * sy;
            (
                ct2 / ksx2 + st2 / ksy2,
                sct / ksy2 - sct / ksx2,
                st2 / ksx2 + ct2 / ksy2,
            )
        }
    }

    fn profile(&self, q: f64, beta: f64) -> f64 {
        if self.function == PsfFunction::Gaussian {
            (-q).exp()
        } else {
            (1.0 + q).powf(-beta)
        }
    }

    /// Residual vector `model - sample`, or `None` when the parameters are
    /// outside the valid region.
    fn residuals(&self, p: &DVector<f64>) -> Option<DVector<f64>> {
        let b = p[0];
        let a = p[1];
        if b < 0.0 || a < 0.0 {
            return None;
        }
        let beta = self.beta_of(p);
        if self.variable_beta() {
            let prev = self.beta0.get();
            if beta < 0.0 || beta > 10.0 || ((beta - prev) / prev).abs() > BETA_RATCHET {
                return None;
            }
            self.beta0.set(beta);
        }

        let (p1, p2, p3) = self.quad_coeffs(p);
        let (cx, cy) = (p[2], p[3]);
        let (h, w) = self.samples.dim();
        let mut out = DVector::zeros(h * w);
        let mut i = 0;
        for y in 0..h {
            let dy = y as f64 - cy;
            let two_p2_dy = 2.0 * p2 * dy;
            let p3_dy2 = p3 * dy * dy;
            for x in 0..w {
                let dx = x as f64 - cx;
                let q = p1 * dx * dx + two_p2_dy * dx + p3_dy2;
                let v = b + a * self.profile(q, beta) - self.samples[[y, x]];
                if !v.is_finite() {
                    return None;
                }
                out[i] = v;
                i += 1;
            }
        }
        Some(out)
    }

    /// Sum of absolute differences between the model and the samples.
    fn absolute_deviation(&self, p: &DVector<f64>) -> f64 {
        let b = p[0];
        let a = p[1];
        let beta = self.beta_of(p);
        let (p1, p2, p3) = self.quad_coeffs(p);
        let (cx, cy) = (p[2], p[3]);
        let (h, w) = self.samples.dim();
        let mut adev = 0.0;
        for y in 0..h {
            let dy = y as f64 - cy;
            let two_p2_dy = 2.0 * p2 * dy;
            let p3_dy2 = p3 * dy * dy;
            for x in 0..w {
                let dx = x as f64 - cx;
                let q = p1 * dx * dx + two_p2_dy * dx + p3_dy2;
                adev += (self.samples[[y, x]] - b - a * self.profile(q, beta)).abs();
            }
        }
        adev
    }
}

enum LmOutcome {
    Converged,
    SmallGradient,
    Stalled,
    ExhaustedEvals,
    InvalidStart,
}

/// Damped least squares with numeric Jacobians.
///
/// The evaluation budget mirrors the classic `lmdif1` limit of
/// `100 * (n + 1)` function calls.
fn levenberg_marquardt(problem: &FitProblem, mut p: DVector<f64>) -> (DVector<f64>, LmOutcome) {
    let n = p.len();
    let max_evals = 100 * (n + 1);

    let Some(mut r) = problem.residuals(&p) else {
        return (p, LmOutcome::InvalidStart);
    };
    let mut evals = 1;
    let mut cost = r.norm_squared();
    let initial_cost = cost;
    let mut lambda = 1.0e-3;

    loop {
        // Finite-difference Jacobian around the current point
        let m = r.len();
        let mut jac = DMatrix::zeros(m, n);
        for k in 0..n {
            let step = FD_STEP * p[k].abs().max(FD_STEP);
            let mut forward = p.clone();
            forward[k] += step;
            evals += 1;
            let col = match problem.residuals(&forward) {
                Some(rk) => (rk - &r) / step,
                None => {
                    let mut backward = p.clone();
                    backward[k] -= step;
                    evals += 1;
                    match problem.residuals(&backward) {
                        Some(rk) => (&r - rk) / step,
                        None => DVector::zeros(m),
                    }
                }
            };
            jac.set_column(k, &col);
        }

        let jtj = jac.transpose() * &jac;
        let jtr = jac.transpose() * &r;

        if jtr.amax() <= 1.0e-14 * (1.0 + cost) {
            // Gradient numerically zero
            return if cost < initial_cost || cost <= f64::EPSILON {
                (p, LmOutcome::Converged)
            } else {
                (p, LmOutcome::SmallGradient)
            };
        }

        // Try increasingly damped steps until one reduces the cost
        let mut accepted = false;
        while lambda <= LAMBDA_MAX {
            let mut damped = jtj.clone();
            for i in 0..n {
                damped[(i, i)] += lambda * jtj[(i, i)].max(1.0e-12);
            }
            let Some(chol) = damped.cholesky() else {
                lambda *= 10.0;
                continue;
            };
            let delta = chol.solve(&(-&jtr));
            let trial = &p + &delta;

            evals += 1;
            if let Some(trial_r) = problem.residuals(&trial) {
                let trial_cost = trial_r.norm_squared();
                if trial_cost < cost {
                    let reduction = (cost - trial_cost) / cost.max(f64::MIN_POSITIVE);
                    let step_small =
                        delta.norm() <= FIT_TOLERANCE * (p.norm() + FIT_TOLERANCE);
                    p = trial;
                    r = trial_r;
                    cost = trial_cost;
                    lambda = (lambda * 0.1).max(1.0e-12);
                    accepted = true;
                    if reduction <= FIT_TOLERANCE || step_small || cost <= f64::MIN_POSITIVE {
                        return (p, LmOutcome::Converged);
                    }
                    break;
                }
            }
            lambda *= 10.0;
            if evals >= max_evals {
                return (p, LmOutcome::ExhaustedEvals);
            }
        }

        if !accepted {
            return (p, LmOutcome::Stalled);
        }
        if evals >= max_evals {
            return (p, LmOutcome::ExhaustedEvals);
        }
    }
}

fn outcome_status(outcome: LmOutcome) -> FitStatus {
    match outcome {
        LmOutcome::Converged => FitStatus::FittedOk,
        LmOutcome::SmallGradient => FitStatus::NoSolution,
        LmOutcome::Stalled => FitStatus::InaccurateSolution,
        LmOutcome::ExhaustedEvals => FitStatus::NoConvergence,
        LmOutcome::InvalidStart => FitStatus::BadParameters,
    }
}

/// Fit one PSF model to the pixels of `rect` around the position `(x, y)`.
///
/// The rectangle is clipped to the frame; fitted coordinates are reported in
/// image coordinates. A failed fit carries its status and zeroed parameters.
///
/// # Arguments
/// * `frame`, `channel` - Source pixels
/// * `x`, `y` - Detected barycenter, used as the initial center estimate
/// * `rect` - Sampling rectangle (typically the detection aperture)
/// * `function` - Model family to fit
/// * `circular` - Prescribe a circular profile instead of an elliptical one
pub fn fit_psf(
    frame: &Frame,
    channel: usize,
    x: f64,
    y: f64,
    rect: Rect,
    function: PsfFunction,
    circular: bool,
) -> PsfResult {
    let Some(clipped) = rect.intersection(&frame.bounds()) else {
        return PsfResult::failed(function, circular, FitStatus::BadParameters);
    };
    let Some(window) = frame.window(channel, clipped) else {
        return PsfResult::failed(function, circular, FitStatus::BadParameters);
    };
    let samples = window.to_owned();
    let (h, w) = samples.dim();
    let m = h * w;

    let problem = FitProblem {
        samples,
        function,
        circular,
        beta0: Cell::new(3.0),
    };
    let n = problem.n_params();
    if m <= n {
        return PsfResult::failed(function, circular, FitStatus::BadParameters);
    }

    // Initial estimates: background from the border medians, amplitude from
    // the peak, sigma from the aperture size.
    let mut top: Vec<f64> = problem.samples.row(0).to_vec();
    let mut bottom: Vec<f64> = problem.samples.row(h - 1).to_vec();
    let mut left: Vec<f64> = problem.samples.column(0).to_vec();
    let mut right: Vec<f64> = problem.samples.column(w - 1).to_vec();
    let b0 = (slice_median(&mut top)
        + slice_median(&mut bottom)
        + slice_median(&mut left)
        + slice_median(&mut right))
        / 4.0;
    let peak = problem
        .samples
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let s0 = 0.15 * rect.width() as f64;

    let mut p0 = DVector::zeros(n);
    p0[0] = b0.max(0.0);
    p0[1] = (peak - b0).max(0.0);
    p0[2] = x - clipped.x0 as f64;
    p0[3] = y - clipped.y0 as f64;
    p0[4] = s0;
    if !circular {
        p0[5] = s0;
        p0[6] = 0.0;
    }
    if problem.variable_beta() {
        p0[n - 1] = 3.0;
    }

    let (mut p, outcome) = levenberg_marquardt(&problem, p0);
    let mut status = outcome_status(outcome);
    let beta = problem.beta_of(&p);

    if status.is_fitted() && function == PsfFunction::Moffat && beta > 9.99 {
        status = FitStatus::NoConvergence;
    }

    if status.is_fitted() {
        p[4] = p[4].abs();
        if !circular {
            p[5] = p[5].abs();
            if p[4] < p[5] {
                p.swap_rows(4, 5);
            }
        }
        if fwhm(function, p[4], beta) > rect.width() as f64 {
            status = FitStatus::NoConvergence;
        }
    }

    if !status.is_fitted() {
        return PsfResult::failed(function, circular, status);
    }

    let m = m as f64;
    let a = p[1];
    let mut result = PsfResult {
        function,
        circular,
        status,
        b: p[0].max(0.0),
        a,
        cx: clipped.x0 as f64 + p[2],
        cy: clipped.y0 as f64 + p[3],
        q0: None,
        sx: p[4],
        sy: if circular { p[4] } else { p[5] },
        theta: 0.0,
        beta: if function == PsfFunction::Gaussian {
            0.0
        } else {
            beta
        },
        mad: 0.0,
    };

    if circular || (result.sx - result.sy).abs() < 0.01 {
        // Circular, prescribed or incidental
        result.mad = problem.absolute_deviation(&p) / m / a;
    } else {
        // The minimizer cannot determine the rotation angle unambiguously.
        // Constrain it to the first quadrant, then test the four equivalent
        // orientations and keep the one that best matches the samples.
        let mut theta = p[6];
        theta = theta.sin().atan2(theta.cos());
        if theta < 0.0 {
            theta += std::f64::consts::PI;
        }
        if theta > std::f64::consts::FRAC_PI_2 {
            theta -= std::f64::consts::FRAC_PI_2;
        }

        let candidates = [
            theta,
            std::f64::consts::FRAC_PI_2 - theta,
            std::f64::consts::FRAC_PI_2 + theta,
            std::f64::consts::PI - theta,
        ];
        let mut best = candidates[0];
        let mut best_dev = f64::INFINITY;
        for &candidate in &candidates {
            p[6] = candidate;
            let dev = problem.absolute_deviation(&p);
            if dev < best_dev {
                best_dev = dev;
                best = candidate;
            }
        }
        result.theta = best.to_degrees();
        result.mad = best_dev / m / a;
    }

    result
}
