//! Sinkhorn-Knopp balanced assignment

use ndarray::Array2;

use super::{CenterState, TeacherCentering};
use crate::comm::Collective;

/// Alternating row/column renormalization of `exp(z/T)`.
///
/// Produces targets that are simultaneously (approximately) uniform over
/// prototypes across the global batch and a proper distribution per sample.
/// Stateless between steps; prototype sums are all-reduced across workers
/// each iteration. Internally runs in f64.
#[derive(Debug, Clone)]
pub struct SinkhornKnopp {
    pub iterations: usize,
}

impl Default for SinkhornKnopp {
    fn default() -> Self {
        Self { iterations: 3 }
    }
}

impl TeacherCentering for SinkhornKnopp {
    fn center(
        &self,
        logits: &Array2<f32>,
        teacher_temp: f32,
        _state: &mut CenterState,
        comm: &dyn Collective,
    ) -> Array2<f32> {
        let b_local = logits.nrows();
        let k = logits.ncols();
        assert!(b_local > 0, "no rows to center");
        assert!(teacher_temp > 0.0, "teacher temperature must be positive, got {teacher_temp}");

        // the stability shift must be identical on every worker: a
        // per-worker shift rescales that worker's rows and survives the
        // fixed iteration count. One agreed shift cancels exactly in the
        // first global normalization. Each rank owns one slot of the
        // buffer, so the sum recovers every rank's local max.
        let local_max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
        let mut rank_max = vec![0.0f64; comm.world_size()];
        rank_max[comm.rank()] = local_max;
        comm.all_reduce_sum(&mut rank_max);
        let max = rank_max.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let mut q = Array2::<f64>::zeros((b_local, k));
        for ((i, j), v) in q.indexed_iter_mut() {
            *v = ((logits[[i, j]] as f64 - max) / teacher_temp as f64).exp();
        }

        // global sample count and partition mass
        let mut totals = [b_local as f64, q.sum()];
        comm.all_reduce_sum(&mut totals);
        let b_total = totals[0];
        let sum_q = totals[1].max(f64::MIN_POSITIVE);
        q.mapv_inplace(|v| v / sum_q);

        for _ in 0..self.iterations {
            // prototype (column-of-the-global-matrix) marginals need the
            // other workers' mass
            let mut proto_sums: Vec<f64> = (0..k).map(|j| q.column(j).sum()).collect();
            comm.all_reduce_sum(&mut proto_sums);
            for ((_, j), v) in q.indexed_iter_mut() {
                *v /= proto_sums[j].max(f64::MIN_POSITIVE);
                *v /= k as f64;
            }

            // per-sample marginals are local
            for mut row in q.rows_mut() {
                let sum = row.sum().max(f64::MIN_POSITIVE);
                row.mapv_inplace(|v| v / sum / b_total);
            }
        }

        q.mapv_inplace(|v| v * b_total);
        q.mapv(|v| v as f32)
    }
}
