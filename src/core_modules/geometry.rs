// THEORY:
// The `geometry` module is the stateless foundation of the calibration engine.
// Every higher layer reasons about the camera feed exclusively through the
// rectangles defined here, so this module owns both the data containers and
// the handful of aggregation primitives the state machines share.
//
// Key architectural principles:
// 1.  **Dumb Data Containers**: `Rect` and `RectSample` carry no behavior beyond
//     simple derived measurements. They are produced once and never mutated;
//     every operation returns a freshly computed rectangle.
// 2.  **Outlier-Aware Aggregation**: `bounding_rect` is the workhorse of the
//     outline phase. The camera tracker regularly reports stray reflections far
//     from the actual object, so a naive min/max union would balloon the
//     outline. Aggregation therefore weights each rectangle's center by its own
//     size, measures per-axis spread, and discards rectangles whose centers sit
//     too many standard deviations out before taking the union.
// 3.  **Explicit "No Data"**: aggregating zero rectangles (or rectangles with
//     zero total weight) has no defined centroid. That case surfaces as `None`
//     rather than a NaN-filled rectangle leaking into the state machines.
// 4.  **Temporal Similarity**: `rects_are_similar` compares both corners of two
//     rectangles against a pixel threshold. It is used to decide whether
//     consecutive outline samples agree, never for spatial matching of lights.

use serde::{Deserialize, Serialize};

/// An axis-aligned rectangle in camera pixel space.
///
/// Coordinates are usually non-negative, but undistortion can push a detected
/// region past the image origin. A zero-area rectangle is only meaningful as a
/// "nothing found" sentinel in the few places that explicitly allow it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// X coordinate of the right edge.
    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    /// Y coordinate of the bottom edge.
    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// The center point of the rectangle.
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Whether the rectangle encloses no area at all.
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Full-containment test: every point of `inner` lies within `self`.
    /// Used to discard detector noise outside the known silhouette.
    pub fn contains(&self, inner: &Rect) -> bool {
        self.x <= inner.x
            && self.y <= inner.y
            && inner.right() <= self.right()
            && inner.bottom() <= self.bottom()
    }

    /// Returns a rectangle grown by `margin` on all four sides, with the
    /// top-left corner clamped at the image origin (never negative).
    pub fn expand(&self, margin: f64) -> Rect {
        let x = (self.x - margin).max(0.0);
        let y = (self.y - margin).max(0.0);
        Rect {
            x,
            y,
            width: self.right() + margin - x,
            height: self.bottom() + margin - y,
        }
    }
}

/// The set of candidate bright-region rectangles reported by the detector
/// collaborator for a single detection tick. May be empty.
#[derive(Debug, Clone, Default)]
pub struct RectSample {
    pub rects: Vec<Rect>,
}

impl From<Vec<Rect>> for RectSample {
    fn from(rects: Vec<Rect>) -> Self {
        Self { rects }
    }
}

/// Euclidean distance between two points.
pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((b.0 - a.0).powi(2) + (b.1 - a.1).powi(2)).sqrt()
}

/// Euclidean distance between the centers of two rectangles.
pub fn center_distance(a: &Rect, b: &Rect) -> f64 {
    distance(a.center(), b.center())
}

/// Whether two rectangles are similar: neither the top-left corners nor the
/// bottom-right corners are further apart than `distance_threshold` pixels.
pub fn rects_are_similar(a: &Rect, b: &Rect, distance_threshold: f64) -> bool {
    distance((a.x, a.y), (b.x, b.y)) <= distance_threshold
        && distance((a.right(), a.bottom()), (b.right(), b.bottom())) <= distance_threshold
}

/// Computes the minimal rectangle enclosing `rects` after outlier rejection.
///
/// Each rectangle's center is weighted by its own width (x-axis) and height
/// (y-axis) to form a centroid, the per-axis standard deviation of centers is
/// measured around it, and any rectangle whose center deviates by more than
/// `outlier_std_dev_threshold` standard deviations on either axis is dropped.
/// The survivors' union is returned.
///
/// Returns `None` when there is nothing to aggregate: an empty slice, or
/// rectangles whose total weight is zero on either axis.
pub fn bounding_rect(rects: &[Rect], outlier_std_dev_threshold: f64) -> Option<Rect> {
    let survivors = reject_outliers(rects, outlier_std_dev_threshold)?;

    let mut smallest_x = f64::INFINITY;
    let mut smallest_y = f64::INFINITY;
    let mut largest_x = f64::NEG_INFINITY;
    let mut largest_y = f64::NEG_INFINITY;
    for rect in &survivors {
        smallest_x = smallest_x.min(rect.x);
        smallest_y = smallest_y.min(rect.y);
        largest_x = largest_x.max(rect.right());
        largest_y = largest_y.max(rect.bottom());
    }

    Some(Rect {
        x: smallest_x,
        y: smallest_y,
        width: largest_x - smallest_x,
        height: largest_y - smallest_y,
    })
}

/// Drops rectangles whose centers stray too far from the weighted centroid.
/// Returns `None` when the centroid is undefined.
fn reject_outliers(rects: &[Rect], outlier_std_dev_threshold: f64) -> Option<Vec<Rect>> {
    if rects.is_empty() {
        return None;
    }

    let mut total_x = 0.0;
    let mut total_y = 0.0;
    let mut weights_x = 0.0;
    let mut weights_y = 0.0;
    for rect in rects {
        let (cx, cy) = rect.center();
        total_x += cx * rect.width;
        weights_x += rect.width;
        total_y += cy * rect.height;
        weights_y += rect.height;
    }
    if weights_x <= 0.0 || weights_y <= 0.0 {
        // All-degenerate input; the weighted average is undefined.
        return None;
    }
    let average_x = total_x / weights_x;
    let average_y = total_y / weights_y;

    let mut squared_diff_x = 0.0;
    let mut squared_diff_y = 0.0;
    for rect in rects {
        let (cx, cy) = rect.center();
        squared_diff_x += (cx - average_x).powi(2);
        squared_diff_y += (cy - average_y).powi(2);
    }
    let std_dev_x = (squared_diff_x / rects.len() as f64).sqrt();
    let std_dev_y = (squared_diff_y / rects.len() as f64).sqrt();

    let survivors: Vec<Rect> = rects
        .iter()
        .filter(|rect| {
            let (cx, cy) = rect.center();
            (cx - average_x).abs() <= outlier_std_dev_threshold * std_dev_x
                && (cy - average_y).abs() <= outlier_std_dev_threshold * std_dev_y
        })
        .copied()
        .collect();
    if survivors.is_empty() {
        return None;
    }
    Some(survivors)
}
