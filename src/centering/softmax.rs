//! EMA softmax centering

use ndarray::{Array1, Array2};

use super::{CenterState, TeacherCentering};
use crate::comm::Collective;
use crate::loss::utils::softmax;

/// Softmax over center-subtracted logits with an EMA-updated center.
///
/// Targets are `softmax((z − c)/T)` using the center from the previous
/// step; afterwards the center moves toward the cross-worker batch mean:
/// `c ← c·m + mean(z)·(1−m)`.
#[derive(Debug, Clone)]
pub struct SoftmaxCentering {
    pub momentum: f32,
}

impl SoftmaxCentering {
    pub fn new(momentum: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&momentum),
            "center momentum must be in [0, 1), got {momentum}"
        );
        Self { momentum }
    }
}

impl TeacherCentering for SoftmaxCentering {
    fn center(
        &self,
        logits: &Array2<f32>,
        teacher_temp: f32,
        state: &mut CenterState,
        comm: &dyn Collective,
    ) -> Array2<f32> {
        assert!(logits.nrows() > 0, "no rows to center");
        assert!(teacher_temp > 0.0, "teacher temperature must be positive, got {teacher_temp}");
        let k = logits.ncols();
        let center = state.center_or_zeros(k);

        let mut probs = Array2::zeros(logits.raw_dim());
        for (i, row) in logits.rows().into_iter().enumerate() {
            let shifted = Array1::from_iter(
                row.iter()
                    .zip(center.iter())
                    .map(|(&z, &c)| (z - c) / teacher_temp),
            );
            probs.row_mut(i).assign(&softmax(shifted.view()));
        }

        // batch mean over all workers, then the EMA step
        let mut reduce = Vec::with_capacity(k + 1);
        for col in 0..k {
            reduce.push(logits.column(col).iter().map(|&v| v as f64).sum::<f64>());
        }
        reduce.push(logits.nrows() as f64);
        comm.all_reduce_sum(&mut reduce);

        let total_rows = reduce[k];
        let m = self.momentum;
        let new_center = Array1::from_iter(
            center
                .iter()
                .enumerate()
                .map(|(c, &old)| old * m + (reduce[c] / total_rows) as f32 * (1.0 - m)),
        );
        state.set(new_center);

        probs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NullCollective;
    use approx::assert_relative_eq;
    use ndarray::arr2;

    #[test]
    fn test_rows_are_distributions() {
        let logits = arr2(&[[2.0f32, -1.0, 0.5], [0.0, 0.0, 0.0]]);
        let mut state = CenterState::new();
        let probs = SoftmaxCentering::new(0.9).center(&logits, 0.07, &mut state, &NullCollective);
        for row in probs.rows() {
            assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p >= 0.0));
        }
    }

    #[test]
    fn test_first_update_moves_from_zero_center() {
        let logits = arr2(&[[1.0f32, 3.0], [3.0, 1.0]]);
        let mut state = CenterState::new();
        SoftmaxCentering::new(0.9).center(&logits, 0.1, &mut state, &NullCollective);

        // batch mean is [2, 2]; c = 0·0.9 + 2·0.1
        let center = state.center().unwrap();
        assert_relative_eq!(center[0], 0.2, epsilon = 1e-6);
        assert_relative_eq!(center[1], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_center_converges_to_batch_mean() {
        let logits = arr2(&[[4.0f32, 0.0], [2.0, 2.0]]);
        let mean = [3.0f32, 1.0];
        let strategy = SoftmaxCentering::new(0.9);
        let mut state = CenterState::new();

        let mut prev_dist = f32::INFINITY;
        for _ in 0..50 {
            strategy.center(&logits, 0.1, &mut state, &NullCollective);
            let c = state.center().unwrap();
            let dist = ((c[0] - mean[0]).powi(2) + (c[1] - mean[1]).powi(2)).sqrt();
            assert!(dist < prev_dist, "distance to batch mean must shrink every step");
            prev_dist = dist;
        }
        assert!(prev_dist < 0.05);
    }

    #[test]
    fn test_centering_shifts_dominant_prototype() {
        // a prototype that always fires gets its logits pulled down by the
        // growing center, flattening the target distribution over time
        let logits = arr2(&[[5.0f32, 0.0, 0.0]]);
        let strategy = SoftmaxCentering::new(0.5);
        let mut state = CenterState::new();

        let first = strategy.center(&logits, 1.0, &mut state, &NullCollective);
        let mut last = first.clone();
        for _ in 0..20 {
            last = strategy.center(&logits, 1.0, &mut state, &NullCollective);
        }
        assert!(last[[0, 0]] < first[[0, 0]]);
    }

    #[test]
    fn test_uses_previous_center_before_update() {
        // the returned targets must be computed with the old center
        let logits = arr2(&[[1.0f32, 1.0]]);
        let strategy = SoftmaxCentering::new(0.0);
        let mut state = CenterState::new();

        let probs = strategy.center(&logits, 1.0, &mut state, &NullCollective);
        // old center was zero: symmetric logits give a uniform target
        assert_relative_eq!(probs[[0, 0]], 0.5, epsilon = 1e-6);
        // with momentum 0 the center now equals the batch mean exactly
        assert_relative_eq!(state.center().unwrap()[0], 1.0, epsilon = 1e-6);
    }
}
