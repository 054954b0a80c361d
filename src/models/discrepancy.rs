// src/models/discrepancy.rs

//! L1 discrepancy between simulated and observed current summaries.

use ndarray::{Array1, ArrayView1, Zip};

/// Sum of absolute elementwise differences, returned as a one-element array.
///
/// Both summaries must have the same length; they are on the common
/// timebase after summarisation.
pub fn l1_distance(summary: ArrayView1<f64>, observed: ArrayView1<f64>) -> Array1<f64> {
    debug_assert_eq!(summary.len(), observed.len(), "summaries must share a timebase");
    let mut dist = 0.0;
    Zip::from(&summary).and(&observed).for_each(|&x, &y| dist += (x - y).abs());
    Array1::from_elem(1, dist)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identical_summaries_have_zero_distance() {
        let x = array![1.0, -2.5, 3.0];
        assert_eq!(l1_distance(x.view(), x.view())[0], 0.0);
    }

    #[test]
    fn distance_is_sum_of_absolute_differences() {
        let x = array![1.0, 2.0, 3.0];
        let y = array![2.0, 0.0, 3.5];
        let d = l1_distance(x.view(), y.view());
        assert_eq!(d.len(), 1);
        assert!((d[0] - 3.5).abs() < 1e-12);
        assert!((l1_distance(y.view(), x.view())[0] - d[0]).abs() < 1e-12);
    }

    #[test]
    fn distance_is_translation_invariant() {
        let x = array![0.3, 1.7, -4.0, 2.2];
        let y = array![1.1, 0.2, -3.0, 2.0];
        let c = 123.456;
        let shifted = l1_distance((&x + c).view(), (&y + c).view())[0];
        assert!((shifted - l1_distance(x.view(), y.view())[0]).abs() < 1e-9);
    }

    #[test]
    fn distance_is_non_negative() {
        let x = array![-5.0, -1.0, 0.0];
        let y = array![5.0, 1.0, -0.0];
        assert!(l1_distance(x.view(), y.view())[0] >= 0.0);
    }
}
