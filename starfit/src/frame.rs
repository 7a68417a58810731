//! Multi-channel raster buffer with the statistical primitives the detection
//! and fitting stages need.
//!
//! A [`Frame`] owns one `Array2<f64>` per channel, all with identical shape.
//! Pixel samples are expected in the normalized `[0, 1]` range, as produced
//! by upstream calibration; nothing here enforces that, but the thresholder
//! clamps to it. Arrays are indexed `[row, col]`, i.e. `[y, x]`.

use ndarray::{s, Array2, ArrayView2};

use crate::error::StarfitError;
use crate::rect::Rect;

/// Read-only multi-channel image raster.
#[derive(Debug, Clone)]
pub struct Frame {
    channels: Vec<Array2<f64>>,
}

impl Frame {
    /// Build a frame from per-channel arrays.
    ///
    /// # Errors
    /// `EmptyFrame` when no channels are given, `ChannelShapeMismatch` when
    /// the channels do not share one shape.
    pub fn from_channels(channels: Vec<Array2<f64>>) -> Result<Self, StarfitError> {
        let first = channels.first().ok_or(StarfitError::EmptyFrame)?;
        let (h, w) = first.dim();
        for c in &channels[1..] {
            let (ch, cw) = c.dim();
            if (ch, cw) != (h, w) {
                return Err(StarfitError::ChannelShapeMismatch(h, w, ch, cw));
            }
        }
        Ok(Self { channels })
    }

    /// Single-channel frame from one array.
    pub fn from_array(pixels: Array2<f64>) -> Self {
        Self {
            channels: vec![pixels],
        }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.channels[0].ncols()
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.channels[0].nrows()
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    /// Full image bounds as a rectangle anchored at the origin.
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width() as i32, self.height() as i32)
    }

    /// Borrow one channel.
    ///
    /// # Errors
    /// `ChannelOutOfRange` for an invalid index.
    pub fn channel(&self, channel: usize) -> Result<ArrayView2<'_, f64>, StarfitError> {
        self.channels
            .get(channel)
            .map(|c| c.view())
            .ok_or(StarfitError::ChannelOutOfRange(
                channel,
                self.channels.len(),
            ))
    }

    /// View of a rectangular window of one channel, clipped to
    /// [`Frame::bounds`].
    ///
    /// `None` when the clipped rectangle is empty or the channel index is
    /// invalid.
    pub fn window(&self, channel: usize, rect: Rect) -> Option<ArrayView2<'_, f64>> {
        let rect = rect.intersection(&self.bounds())?;
        let c = self.channels.get(channel)?;
        Some(c.slice(s![
            rect.y0 as usize..rect.y1 as usize,
            rect.x0 as usize..rect.x1 as usize
        ]))
    }
}

/// Median of a rectangular window, ignoring non-finite samples.
///
/// Even-length medians average the two central values. Returns 0.0 for an
/// empty or all-NaN window.
pub fn window_median(window: &ArrayView2<f64>) -> f64 {
    let mut values: Vec<f64> = window.iter().copied().filter(|v| v.is_finite()).collect();
    slice_median(&mut values)
}

/// Median of a mutable slice of finite values; sorts in place.
pub(crate) fn slice_median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Mean and population standard deviation of a window.
pub fn window_mean_stddev(window: &ArrayView2<f64>) -> (f64, f64) {
    let n = window.len();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = window.sum() / n as f64;
    let var = window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n as f64;
    (mean, var.sqrt())
}
