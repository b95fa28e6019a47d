//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.

/// Calculate the output size for fitting `source` inside a `max_dimension` square.
///
/// Returns `source` unchanged when both edges already fit (never upscales).
/// Otherwise the longer edge becomes exactly `max_dimension` and the shorter
/// edge is scaled by the same ratio, rounded to the nearest pixel.
///
/// # Arguments
/// * `source` - Original image dimensions (width, height)
/// * `max_dimension` - Longest allowed edge in pixels
///
/// # Examples
/// ```
/// # use reimage::imaging::fit_within;
/// assert_eq!(fit_within((4000, 2000), 2000), (2000, 1000));
/// assert_eq!(fit_within((800, 600), 2048), (800, 600));
/// ```
pub fn fit_within(source: (u32, u32), max_dimension: u32) -> (u32, u32) {
    let (w, h) = source;
    if w <= max_dimension && h <= max_dimension {
        return (w, h);
    }

    if w > h {
        let scaled = (h as f64 * max_dimension as f64 / w as f64).round() as u32;
        (max_dimension, scaled.max(1))
    } else {
        let scaled = (w as f64 * max_dimension as f64 / h as f64).round() as u32;
        (scaled.max(1), max_dimension)
    }
}

/// Calculate preview dimensions: longest edge `edge`, aspect preserved.
///
/// Unlike [`fit_within`] this always scales, so tiny sources still produce a
/// consistent preview size.
pub fn preview_dimensions(source: (u32, u32), edge: u32) -> (u32, u32) {
    let (w, h) = source;
    if w == 0 || h == 0 {
        return (edge, edge);
    }
    if w >= h {
        let scaled = (h as f64 * edge as f64 / w as f64).round() as u32;
        (edge, scaled.max(1))
    } else {
        let scaled = (w as f64 * edge as f64 / h as f64).round() as u32;
        (scaled.max(1), edge)
    }
}
