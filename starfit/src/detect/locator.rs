//! Iterative star localization.
//!
//! From a seed position and an initial search radius, the locator alternates
//! between thresholding a local window, flood-growing the connected region
//! around its brightest pixel, and recentering on the region barycenter. The
//! search radius tracks the region extent, so the window adapts to the star
//! size across iterations. The loop ends with a terminal [`DetectStatus`].

use log::trace;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::detect::threshold;
use crate::frame::{window_median, Frame};
use crate::rect::Rect;

/// Search radius bounds in pixels.
const MIN_RADIUS: i32 = 5;
const MAX_RADIUS: i32 = 127;

/// Barycenter movement below which an iteration counts as converged.
const CONVERGENCE_DELTA: f64 = 0.005;

/// Iteration cap; exceeding it yields [`DetectStatus::NoConvergence`].
const MAX_ITERATIONS: usize = 10;

/// Terminal outcome of one locator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectStatus {
    /// The locator has not run on this candidate.
    NotDetected,
    /// Converged to a stable barycenter inside the search window.
    DetectedOk,
    /// The thresholded window was flat, or the grown region had zero flux.
    NoSignificantData,
    /// Converged, but the region touches the search window edge; the star is
    /// plausible but likely clipped by the search box.
    CrossingEdges,
    /// The search box does not intersect the image at all.
    OutsideImage,
    /// The barycenter kept moving after the iteration cap.
    NoConvergence,
    /// Reserved for internal failures (e.g. invalid channel index).
    UnknownError,
}

impl DetectStatus {
    /// True only for [`DetectStatus::DetectedOk`].
    pub fn is_detected(self) -> bool {
        self == DetectStatus::DetectedOk
    }

    /// Human-readable status message.
    pub fn message(self) -> &'static str {
        match self {
            DetectStatus::NotDetected => "Not detected",
            DetectStatus::DetectedOk => "Detected Ok",
            DetectStatus::NoSignificantData => "No significant data",
            DetectStatus::CrossingEdges => "Crossing edges",
            DetectStatus::OutsideImage => "Outside image",
            DetectStatus::NoConvergence => "No convergence",
            DetectStatus::UnknownError => "Unknown error",
        }
    }
}

/// Detection stage configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Initial search box half-width in pixels, clamped to `[5, 127]`.
    pub search_radius: i32,
    /// Background threshold in sigma units above the window median.
    pub threshold: f64,
    /// Grow the sampling aperture after detection until the local median
    /// background stabilizes.
    pub auto_aperture: bool,
    /// Blur the window before thresholding for noise suppression.
    pub blur: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            search_radius: 8,
            threshold: 1.0,
            auto_aperture: true,
            blur: true,
        }
    }
}

/// One star candidate: refined position, adaptive radius, sampling rectangle
/// and terminal status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Detection {
    /// Barycenter x, image coordinates.
    pub x: f64,
    /// Barycenter y, image coordinates.
    pub y: f64,
    /// Search box half-width at the last accepted iteration.
    pub radius: i32,
    /// Sampling rectangle: `position ± radius`, possibly grown afterwards by
    /// the aperture expander.
    pub rect: Rect,
    /// Channel the candidate was detected on.
    pub channel: usize,
    /// Terminal outcome.
    pub status: DetectStatus,
}

impl Detection {
    /// True only when the locator converged cleanly.
    pub fn is_detected(&self) -> bool {
        self.status.is_detected()
    }
}

/// Flood-grown connected region accumulator.
struct Region {
    flux: f64,
    sum_x: f64,
    sum_y: f64,
    min_row: usize,
    min_col: usize,
    max_row: usize,
    max_col: usize,
}

impl Region {
    fn new(seed_row: usize, seed_col: usize) -> Self {
        Self {
            flux: 0.0,
            sum_x: 0.0,
            sum_y: 0.0,
            min_row: seed_row,
            min_col: seed_col,
            max_row: seed_row,
            max_col: seed_col,
        }
    }

    fn accumulate(&mut self, mask: &Array2<f64>, row: usize, xa: usize, xb: usize) {
        for col in xa..=xb {
            let v = mask[[row, col]];
            if v != 0.0 {
                self.flux += v;
                self.sum_x += col as f64 * v;
                self.sum_y += row as f64 * v;
                self.min_row = self.min_row.min(row);
                self.min_col = self.min_col.min(col);
                self.max_row = self.max_row.max(row);
                self.max_col = self.max_col.max(col);
            }
        }
    }

    fn width(&self) -> usize {
        self.max_col - self.min_col + 1
    }

    fn height(&self) -> usize {
        self.max_row - self.min_row + 1
    }
}

/// Nonzero run of `row` overlapping the previous row's run `[xa, xb]`,
/// extended left and right until a zero pixel. `None` ends the scan in that
/// direction.
fn row_run(mask: &Array2<f64>, row: usize, xa: usize, xb: usize) -> Option<(usize, usize)> {
    let r = mask.row(row);
    let first = (xa..=xb).find(|&c| r[c] != 0.0)?;
    let last = (first..=xb).rev().find(|&c| r[c] != 0.0).unwrap_or(first);

    let mut a = first;
    while a > 0 && r[a - 1] != 0.0 {
        a -= 1;
    }
    let mut b = last;
    while b + 1 < r.len() && r[b + 1] != 0.0 {
        b += 1;
    }
    Some((a, b))
}

/// Grow the connected region around the seed pixel, row by row in both
/// vertical directions, accumulating flux-weighted moments and the bounding
/// box of every visited nonzero pixel.
fn grow_region(mask: &Array2<f64>, seed_row: usize, seed_col: usize) -> Region {
    let h = mask.nrows();
    let mut region = Region::new(seed_row, seed_col);

    let Some((xa0, xb0)) = row_run(mask, seed_row, seed_col, seed_col) else {
        return region;
    };
    region.accumulate(mask, seed_row, xa0, xb0);

    let (mut xa, mut xb) = (xa0, xb0);
    for row in seed_row + 1..h {
        match row_run(mask, row, xa, xb) {
            Some((a, b)) => {
                region.accumulate(mask, row, a, b);
                xa = a;
                xb = b;
            }
            None => break,
        }
    }

    let (mut xa, mut xb) = (xa0, xb0);
    for row in (0..seed_row).rev() {
        match row_run(mask, row, xa, xb) {
            Some((a, b)) => {
                region.accumulate(mask, row, a, b);
                xa = a;
                xb = b;
            }
            None => break,
        }
    }

    region
}

/// Run the iterative locator from a seed position.
///
/// The returned [`Detection`] always carries the last position, radius and
/// rectangle the locator accepted, plus the terminal status. The source frame
/// is never mutated.
///
/// # Arguments
/// * `frame` - Source raster, read-only
/// * `channel` - Channel to detect on
/// * `seed_x`, `seed_y` - Approximate star position
/// * `config` - Radius, threshold and post-processing flags
pub fn detect(frame: &Frame, channel: usize, seed_x: f64, seed_y: f64, config: &DetectorConfig) -> Detection {
    let radius = config.search_radius.clamp(MIN_RADIUS, MAX_RADIUS);
    let mut det = Detection {
        x: seed_x,
        y: seed_y,
        radius,
        rect: Rect::centered_at(seed_x, seed_y, radius),
        channel,
        status: DetectStatus::NotDetected,
    };

    if frame.channel(channel).is_err() {
        det.status = DetectStatus::UnknownError;
        return det;
    }
    let bounds = frame.bounds();

    for iteration in 0..MAX_ITERATIONS {
        let search = Rect::centered_at(det.x, det.y, det.radius);
        det.rect = search;

        let Some(clipped) = search.intersection(&bounds) else {
            det.status = DetectStatus::OutsideImage;
            return det;
        };
        let Some(window) = frame.window(channel, clipped) else {
            det.status = DetectStatus::UnknownError;
            return det;
        };

        let mask = threshold::binarize(&window, config.threshold, config.blur);

        // Brightest pixel seeds the flood growth
        let mut peak = 0.0;
        let mut seed = (0usize, 0usize);
        for ((r, c), &v) in mask.indexed_iter() {
            if v > peak {
                peak = v;
                seed = (r, c);
            }
        }
        if peak <= 0.0 {
            det.status = DetectStatus::NoSignificantData;
            return det;
        }

        let region = grow_region(&mask, seed.0, seed.1);
        if region.flux <= 0.0 {
            det.status = DetectStatus::NoSignificantData;
            return det;
        }

        let nx = clipped.x0 as f64 + region.sum_x / region.flux;
        let ny = clipped.y0 as f64 + region.sum_y / region.flux;
        let next_radius =
            (region.width().max(region.height()) as i32).clamp(MIN_RADIUS, MAX_RADIUS);

        if next_radius != det.radius {
            // The window scale changed: restart the extraction at the new
            // radius before testing convergence.
            trace!(
                "locator iteration {}: radius {} -> {}",
                iteration,
                det.radius,
                next_radius
            );
            det.radius = next_radius;
            det.x = nx;
            det.y = ny;
            continue;
        }

        let dx = (nx - det.x).abs();
        let dy = (ny - det.y).abs();
        det.x = nx;
        det.y = ny;

        if dx < CONVERGENCE_DELTA && dy < CONVERGENCE_DELTA {
            let touches = region.min_row == 0
                || region.min_col == 0
                || region.max_row + 1 == mask.nrows()
                || region.max_col + 1 == mask.ncols();

            det.rect = Rect::centered_at(det.x, det.y, det.radius);
            det.status = if touches {
                DetectStatus::CrossingEdges
            } else {
                DetectStatus::DetectedOk
            };

            if det.is_detected() && config.auto_aperture {
                det.rect = expand_aperture(frame, channel, det.rect);
            }
            return det;
        }
    }

    det.status = DetectStatus::NoConvergence;
    det
}

/// Grow a sampling rectangle until its median stops decreasing by more than
/// 1% per one-pixel step. Finds the smallest aperture whose local background
/// has stabilized.
pub fn expand_aperture(frame: &Frame, channel: usize, rect: Rect) -> Rect {
    let bounds = frame.bounds();
    let mut current = rect;
    let mut median = match frame.window(channel, current) {
        Some(w) => window_median(&w),
        None => return rect,
    };

    loop {
        if current.intersection(&bounds) == Some(bounds) {
            // The aperture already covers the whole image.
            return current;
        }
        let next = current.inflated(1);
        let next_median = match frame.window(channel, next) {
            Some(w) => window_median(&w),
            None => return current,
        };
        if next_median < median && median - next_median > 0.01 * median {
            current = next;
            median = next_median;
        } else {
            return current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    /// Frame with one elliptical Gaussian star over a uniform background.
    fn gaussian_frame(
        width: usize,
        height: usize,
        cx: f64,
        cy: f64,
        sx: f64,
        sy: f64,
        background: f64,
        amplitude: f64,
    ) -> Frame {
        let pixels = Array2::from_shape_fn((height, width), |(r, c)| {
            let dx = c as f64 - cx;
            let dy = r as f64 - cy;
            background
                + amplitude
                    * (-(dx * dx / (2.0 * sx * sx) + dy * dy / (2.0 * sy * sy))).exp()
        });
        Frame::from_array(pixels)
    }

    fn no_aperture() -> DetectorConfig {
        DetectorConfig {
            auto_aperture: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_detects_centered_gaussian_within_tolerance() {
        let frame = gaussian_frame(64, 64, 32.3, 31.7, 2.0, 2.0, 0.1, 0.8);
        let det = detect(&frame, 0, 32.0, 32.0, &no_aperture());

        assert_eq!(det.status, DetectStatus::DetectedOk);
        assert!((det.x - 32.3).abs() < 0.01, "x = {}", det.x);
        assert!((det.y - 31.7).abs() < 0.01, "y = {}", det.y);
        // Bounding rect stays derived from position and radius
        assert_eq!(det.rect, Rect::centered_at(det.x, det.y, det.radius));
    }

    #[test]
    fn test_seed_far_from_star_still_converges() {
        let frame = gaussian_frame(64, 64, 30.0, 30.0, 2.0, 2.0, 0.05, 0.9);
        let det = detect(&frame, 0, 34.0, 27.0, &no_aperture());

        assert_eq!(det.status, DetectStatus::DetectedOk);
        assert_relative_eq!(det.x, 30.0, epsilon = 0.05);
        assert_relative_eq!(det.y, 30.0, epsilon = 0.05);
    }

    #[test]
    fn test_outside_image() {
        let frame = gaussian_frame(64, 64, 32.0, 32.0, 2.0, 2.0, 0.1, 0.8);
        let det = detect(&frame, 0, -200.0, -200.0, &no_aperture());
        assert_eq!(det.status, DetectStatus::OutsideImage);
        assert!(!det.is_detected());
    }

    #[test]
    fn test_flat_region_has_no_significant_data() {
        let frame = Frame::from_array(Array2::from_elem((64, 64), 0.2));
        let det = detect(&frame, 0, 32.0, 32.0, &no_aperture());
        assert_eq!(det.status, DetectStatus::NoSignificantData);
    }

    #[test]
    fn test_invalid_channel() {
        let frame = gaussian_frame(32, 32, 16.0, 16.0, 2.0, 2.0, 0.1, 0.8);
        let det = detect(&frame, 3, 16.0, 16.0, &no_aperture());
        assert_eq!(det.status, DetectStatus::UnknownError);
    }

    #[test]
    fn test_wide_star_near_corner_crosses_edges() {
        // Star partially outside the frame: the grown region runs into the
        // clipped window edge.
        let frame = gaussian_frame(64, 64, 2.0, 2.0, 3.0, 3.0, 0.05, 0.9);
        let det = detect(&frame, 0, 3.0, 3.0, &no_aperture());
        assert!(
            matches!(
                det.status,
                DetectStatus::CrossingEdges | DetectStatus::NoConvergence
            ),
            "status = {:?}",
            det.status
        );
        assert!(!det.is_detected());
    }

    #[test]
    fn test_radius_tracks_region_extent() {
        // A small tight star shrinks the radius to the minimum clamp.
        let frame = gaussian_frame(64, 64, 32.0, 32.0, 1.0, 1.0, 0.05, 0.9);
        let det = detect(
            &frame,
            0,
            32.0,
            32.0,
            &DetectorConfig {
                search_radius: 20,
                auto_aperture: false,
                ..Default::default()
            },
        );
        assert_eq!(det.status, DetectStatus::DetectedOk);
        assert!(det.radius < 20, "radius = {}", det.radius);
        assert!(det.radius >= MIN_RADIUS);
    }

    #[test]
    fn test_auto_aperture_never_shrinks_the_rect() {
        let frame = gaussian_frame(64, 64, 32.0, 32.0, 2.0, 2.0, 0.1, 0.8);

        let plain = detect(&frame, 0, 32.0, 32.0, &no_aperture());
        let expanded = detect(
            &frame,
            0,
            32.0,
            32.0,
            &DetectorConfig {
                auto_aperture: true,
                ..Default::default()
            },
        );

        assert_eq!(plain.status, DetectStatus::DetectedOk);
        assert_eq!(expanded.status, DetectStatus::DetectedOk);
        assert!(expanded.rect.width() >= plain.rect.width());
        assert!(expanded.rect.height() >= plain.rect.height());
    }

    #[test]
    fn test_grow_region_follows_vertical_adjacency() {
        // Two blobs: only the one containing the seed is accumulated.
        let mut mask = Array2::zeros((9, 9));
        mask[[4, 4]] = 1.0;
        mask[[4, 5]] = 0.5;
        mask[[3, 4]] = 0.5;
        mask[[5, 5]] = 0.25;
        mask[[0, 0]] = 1.0; // disconnected

        let region = grow_region(&mask, 4, 4);
        assert_relative_eq!(region.flux, 2.25);
        assert_eq!(
            (region.min_row, region.min_col, region.max_row, region.max_col),
            (3, 4, 5, 5)
        );
    }

    #[test]
    fn test_region_scan_stops_at_empty_row() {
        let mut mask = Array2::zeros((9, 9));
        mask[[4, 4]] = 1.0;
        // Row 5 empty, row 6 nonzero: must not be reached.
        mask[[6, 4]] = 1.0;

        let region = grow_region(&mask, 4, 4);
        assert_relative_eq!(region.flux, 1.0);
        assert_eq!(region.max_row, 4);
    }
}
