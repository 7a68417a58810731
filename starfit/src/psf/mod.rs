//! PSF models, fitting and model selection.

pub mod fit;
pub mod model;
pub mod select;

pub use fit::{fit_psf, FitStatus, PsfResult};
pub use model::{fwhm, PsfFunction};
pub use select::{fit_models, PsfOptions};
