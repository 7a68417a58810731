//! Star detection: window thresholding, region growth and the iterative
//! barycenter locator.

pub mod locator;
pub mod threshold;

pub use locator::{detect, expand_aperture, DetectStatus, Detection, DetectorConfig};
pub use threshold::{binarize, blur5};
