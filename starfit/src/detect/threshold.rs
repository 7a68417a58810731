//! Robust background/foreground separation over a local pixel window.
//!
//! The detection stage never thresholds a whole image: it works on the small
//! search window around a seed. The transform here is a pure function of the
//! window: optional fixed Gaussian blur for noise suppression, then a
//! truncate-and-rescale step that maps everything below `median + k * sigma`
//! to zero and stretches the surviving signal to fill `[0, 1]`.

use ndarray::{Array2, ArrayView2};

use crate::frame::{window_mean_stddev, window_median};

/// Separable 5-tap blur kernel, approximately a sigma = 1 px Gaussian.
const BLUR_TAPS: [f64; 5] = [0.01, 0.316228, 1.0, 0.316228, 0.01];

/// Apply the fixed 5-tap separable blur to a window.
///
/// Border samples are handled by clamping the tap index to the window, so a
/// constant window is a fixed point of the blur.
pub fn blur5(window: &ArrayView2<f64>) -> Array2<f64> {
    let norm: f64 = BLUR_TAPS.iter().sum();
    let (h, w) = window.dim();

    // Horizontal pass
    let mut tmp = Array2::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let mut acc = 0.0;
            for (k, tap) in BLUR_TAPS.iter().enumerate() {
                let cc = (c as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                acc += tap * window[[r, cc]];
            }
            tmp[[r, c]] = acc / norm;
        }
    }

    // Vertical pass
    let mut out = Array2::zeros((h, w));
    for r in 0..h {
        for c in 0..w {
            let mut acc = 0.0;
            for (k, tap) in BLUR_TAPS.iter().enumerate() {
                let rr = (r as isize + k as isize - 2).clamp(0, h as isize - 1) as usize;
                acc += tap * tmp[[rr, c]];
            }
            out[[r, c]] = acc / norm;
        }
    }
    out
}

/// Binarize a window against its robust background estimate.
///
/// Values below `median + k * sigma` are truncated, the remainder is clamped
/// to `[0, 1]` and rescaled so the surviving range fills `[0, 1]` exactly. A
/// window with no dynamic range above the threshold comes back all zero.
///
/// # Arguments
/// * `window` - Single-channel pixel window, nominally in `[0, 1]`
/// * `k` - Threshold in sigma units above the median
/// * `blur` - Whether to apply [`blur5`] first
pub fn binarize(window: &ArrayView2<f64>, k: f64, blur: bool) -> Array2<f64> {
    let src = if blur {
        blur5(window)
    } else {
        window.to_owned()
    };

    let median = window_median(&src.view());
    let (_, sigma) = window_mean_stddev(&src.view());
    let threshold = median + k * sigma;

    let clipped = src.mapv(|v| v.max(threshold).min(1.0));
    let lo = clipped.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = clipped.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !(hi - lo).is_normal() || hi <= lo {
        return Array2::zeros(src.dim());
    }
    clipped.mapv(|v| (v - lo) / (hi - lo))
}
