//! Star detection and PSF fitting for astronomical frames.
//!
//! The pipeline has two stages. Detection takes an approximate star position
//! and iterates a thresholded barycenter inside a shrinking search window
//! until it stabilizes. Fitting then models the pixels of the detection
//! aperture with a Gaussian or Moffat point spread function via damped least
//! squares, either for one prescribed model or racing the whole family and
//! keeping the best.
//!
//! [`StarCollection`] holds the measured stars of one view and layers the
//! bulk operations on top: batch refits (parallel over worker threads),
//! sorting, parameter averaging and CSV export.
//!
//! ```
//! use ndarray::Array2;
//! use starfit::{detect, fit_models, DetectorConfig, Frame, PsfOptions};
//!
//! let pixels = Array2::from_shape_fn((64, 64), |(r, c)| {
//!     let (dx, dy) = (c as f64 - 31.6, r as f64 - 32.2);
//!     0.1 + 0.8 * (-(dx * dx + dy * dy) / 8.0).exp()
//! });
//! let frame = Frame::from_array(pixels);
//!
//! let det = detect(&frame, 0, 32.0, 32.0, &DetectorConfig::default());
//! assert!(det.is_detected());
//!
//! let psfs = fit_models(&frame, 0, &det, &PsfOptions::default());
//! assert!(psfs[0].is_fitted());
//! assert!((psfs[0].cx - 31.6).abs() < 0.01);
//! ```

pub mod collection;
pub mod detect;
pub mod error;
pub mod export;
pub mod frame;
pub mod psf;
pub mod rect;
pub mod scale;

pub use collection::{
    AstrometricSolution, PsfAverage, SortingCriterion, Star, StarCollection,
};
pub use detect::{detect, expand_aperture, DetectStatus, Detection, DetectorConfig};
pub use error::StarfitError;
pub use export::export_csv;
pub use frame::Frame;
pub use psf::{fit_models, fit_psf, fwhm, FitStatus, PsfFunction, PsfOptions, PsfResult};
pub use rect::Rect;
pub use scale::{resolve_scale, ScaleMode};
