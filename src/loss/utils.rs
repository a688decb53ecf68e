//! Numerically stable row-wise softmax kernels

use ndarray::{Array1, Array2, ArrayView1};

/// Softmax with max-subtraction for numerical stability
pub fn softmax(x: ArrayView1<f32>) -> Array1<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut out: Array1<f32> = x.mapv(|v| (v - max).exp());
    let sum = out.sum().max(f32::MIN_POSITIVE);
    out.mapv_inplace(|v| v / sum);
    out
}

/// Log-softmax with max-subtraction
pub fn log_softmax(x: ArrayView1<f32>) -> Array1<f32> {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = x
        .iter()
        .map(|&v| ((v - max) as f64).exp())
        .sum::<f64>()
        .max(f64::MIN_POSITIVE)
        .ln() as f32;
    x.mapv(|v| v - max - log_sum)
}

/// Row-wise temperature softmax over a (rows × cols) matrix
pub fn softmax_rows(x: &Array2<f32>, temp: f32) -> Array2<f32> {
    assert!(temp > 0.0, "softmax temperature must be positive, got {temp}");
    let mut out = Array2::zeros(x.raw_dim());
    for (i, row) in x.rows().into_iter().enumerate() {
        let scaled = row.mapv(|v| v / temp);
        out.row_mut(i).assign(&softmax(scaled.view()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::arr1;

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(arr1(&[1.0, 2.0, 3.0]).view());
        assert_relative_eq!(p.sum(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_softmax_stable_for_large_logits() {
        let p = softmax(arr1(&[1000.0, 1000.0]).view());
        assert_relative_eq!(p[0], 0.5, epsilon = 1e-6);
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_log_softmax_matches_log_of_softmax() {
        let x = arr1(&[0.5, -1.0, 2.0]);
        let lsm = log_softmax(x.view());
        let sm = softmax(x.view());
        for (a, b) in lsm.iter().zip(sm.iter()) {
            assert_relative_eq!(*a, b.ln(), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_softmax_rows_temperature_sharpens() {
        let x = ndarray::arr2(&[[1.0, 0.0]]);
        let warm = softmax_rows(&x, 1.0);
        let cold = softmax_rows(&x, 0.1);
        assert!(cold[[0, 0]] > warm[[0, 0]]);
    }

    mod softmax_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn softmax_is_a_distribution(values in proptest::collection::vec(-50.0f32..50.0, 1..32)) {
                let p = softmax(Array1::from(values).view());
                prop_assert!((p.sum() - 1.0).abs() < 1e-4);
                prop_assert!(p.iter().all(|&v| (0.0..=1.0).contains(&v)));
            }

            #[test]
            fn softmax_is_shift_invariant(
                values in proptest::collection::vec(-10.0f32..10.0, 2..16),
                shift in -20.0f32..20.0,
            ) {
                let base = softmax(Array1::from(values.clone()).view());
                let shifted: Vec<f32> = values.iter().map(|v| v + shift).collect();
                let moved = softmax(Array1::from(shifted).view());
                for (a, b) in base.iter().zip(moved.iter()) {
                    prop_assert!((a - b).abs() < 1e-4);
                }
            }
        }
    }
}
