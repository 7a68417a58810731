//! Signed integer rectangles for search boxes and sampling apertures.
//!
//! Rectangles use half-open bounds (`x0..x1`, `y0..y1`) in image coordinates:
//! x grows rightward, y grows downward. Coordinates are signed because a
//! search box centered near an image border may extend beyond it; such boxes
//! are clipped against the frame bounds before any pixel access.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle with half-open integer bounds.
///
/// # Examples
/// ```rust
/// use starfit::Rect;
///
/// let r = Rect::new(10, 20, 15, 26);
/// assert_eq!(r.width(), 5);
/// assert_eq!(r.height(), 6);
/// assert!(r.contains(10, 20));
/// assert!(!r.contains(15, 20)); // x1 is exclusive
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge (inclusive)
    pub x0: i32,
    /// Top edge (inclusive)
    pub y0: i32,
    /// Right edge (exclusive)
    pub x1: i32,
    /// Bottom edge (exclusive)
    pub y1: i32,
}

impl Rect {
    /// Create a rectangle from explicit bounds.
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Square box of half-width `radius` centered at the rounded position.
    ///
    /// The result has odd side length `2 * radius + 1`, so the center pixel
    /// is unambiguous.
    ///
    /// # Examples
    /// ```rust
    /// use starfit::Rect;
    ///
    /// let r = Rect::centered_at(32.3, 31.7, 8);
    /// assert_eq!((r.x0, r.y0, r.x1, r.y1), (24, 24, 41, 41));
    /// assert_eq!(r.width(), 17);
    /// ```
    pub fn centered_at(x: f64, y: f64, radius: i32) -> Self {
        let cx = x.round() as i32;
        let cy = y.round() as i32;
        Self {
            x0: cx - radius,
            y0: cy - radius,
            x1: cx + radius + 1,
            y1: cy + radius + 1,
        }
    }

    /// Width in pixels; zero or negative for degenerate rectangles.
    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    /// Height in pixels; zero or negative for degenerate rectangles.
    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }

    /// Number of pixels covered, zero when degenerate.
    pub fn area(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.width() as i64 * self.height() as i64
        }
    }

    /// True when the rectangle covers no pixels.
    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    /// True when the rectangles share at least one pixel.
    pub fn intersects(&self, other: &Self) -> bool {
        self.x0 < other.x1 && other.x0 < self.x1 && self.y0 < other.y1 && other.y0 < self.y1
    }

    /// Common sub-rectangle, or `None` when disjoint.
    pub fn intersection(&self, other: &Self) -> Option<Self> {
        let r = Self {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        if r.is_empty() {
            None
        } else {
            Some(r)
        }
    }

    /// Rectangle grown by `d` pixels on every side (shrunk for negative `d`).
    pub fn inflated(&self, d: i32) -> Self {
        Self {
            x0: self.x0 - d,
            y0: self.y0 - d,
            x1: self.x1 + d,
            y1: self.y1 + d,
        }
    }

    /// True when the pixel `(x, y)` lies inside the rectangle.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    /// Floating-point center `(x, y)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.x0 + self.x1) as f64 / 2.0,
            (self.y0 + self.y1) as f64 / 2.0,
        )
    }
}
