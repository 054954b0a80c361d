// src/models/summary.rs

//! Remaps a simulated current trace onto the common 0-25 ms timebase of the
//! observed data.

use ndarray::{Array1, ArrayView1, ArrayView2};
use num_traits::Float;
use serde::{Deserialize, Serialize};

#[inline]
fn prev_index<T: Float>(x: &[T], xp: T) -> usize {
    // First index with x[i] >= xp, minus one; clamps to 0 below the range.
    x.partition_point(|&probe| probe < xp).saturating_sub(1)
}

/// Piecewise-linear interpolation of `(x, y)` at `xp` without allocating.
///
/// `x` must be non-decreasing. Points outside `[x[0], x[n-1]]` take the
/// nearest end value, and a zero-width segment evaluates to its left value.
pub fn interp_zero_alloc<T: Float>(x: &[T], y: &[T], xp: T) -> T {
    let n = x.len().min(y.len());
    if n == 0 {
        return T::zero();
    } else if n == 1 || xp <= x[0] {
        return y[0];
    } else if xp >= x[n - 1] {
        return y[n - 1];
    }

    let i = prev_index(&x[..n], xp).min(n - 2);
    let (x0, y0, x1, y1) = (x[i], y[i], x[i + 1], y[i + 1]);
    let dx = x1 - x0;
    if dx == T::zero() {
        y0
    } else {
        y0 + (y1 - y0) / dx * (xp - x0)
    }
}

/// A uniform time grid `start..=end` with `n_points` samples (seconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeBase {
    pub start: f64,
    pub end: f64,
    pub n_points: usize,
}

impl TimeBase {
    /// The 0-25 ms window of the observed current.
    pub fn window_25ms(n_points: usize) -> Self {
        Self { start: 0.0, end: 25e-3, n_points }
    }

    pub fn grid(&self) -> Array1<f64> {
        Array1::linspace(self.start, self.end, self.n_points)
    }

    /// Resamples `current(time)` onto this grid, holding the first and last
    /// simulated values outside the simulated interval.
    pub fn resample(&self, time: ArrayView1<f64>, current: ArrayView1<f64>) -> Array1<f64> {
        let t = time.to_vec();
        let i = current.to_vec();
        self.grid().mapv(|tp| interp_zero_alloc(&t, &i, tp))
    }

    /// Summary of a two-row simulator output (row 0 time, row 1 current).
    pub fn summarize(&self, trace: ArrayView2<f64>) -> Array1<f64> {
        self.resample(trace.row(0), trace.row(1))
    }
}
