//! Clustering mean-IoU against ground-truth classes

use ndarray::Array2;

use super::hungarian::linear_sum_assignment;

/// Result of a [`PredsMiou::compute`] call
#[derive(Debug, Clone)]
pub struct MiouResult {
    /// Mean IoU over ground-truth classes
    pub miou: f64,
    /// Per-gt-class true positives after relabeling
    pub tp: Vec<f64>,
    /// Per-gt-class false positives
    pub fp: Vec<f64>,
    /// Per-gt-class false negatives
    pub fn_counts: Vec<f64>,
    /// Predicted labels relabeled into gt-class space
    pub reordered_preds: Vec<usize>,
    /// Fraction of prediction clusters mapped to the background class (0)
    /// under many-to-one matching; the constant `1 / num_gt` under one-to-one
    /// matching
    pub matched_bg_clusters: f64,
}

/// Accumulates (ground truth, predicted cluster) pairs and scores the
/// clustering against the class labels.
///
/// Prediction clusters are matched to classes either one-to-one (Hungarian
/// assignment on the score matrix; surplus clusters fall to background) or
/// greedily many-to-one. The score matrix holds IoU by default, or
/// precision when `precision_based` is set.
#[derive(Debug, Clone)]
pub struct PredsMiou {
    num_pred_classes: usize,
    num_gt_classes: usize,
    gt: Vec<usize>,
    pred: Vec<usize>,
}

impl PredsMiou {
    pub fn new(num_pred_classes: usize, num_gt_classes: usize) -> Self {
        assert!(num_gt_classes > 0, "need at least one ground-truth class");
        assert!(
            num_pred_classes >= num_gt_classes,
            "cannot match {num_pred_classes} clusters one-to-one onto {num_gt_classes} classes"
        );
        Self {
            num_pred_classes,
            num_gt_classes,
            gt: Vec::new(),
            pred: Vec::new(),
        }
    }

    /// Append a batch of assignments
    pub fn update(&mut self, gt: &[usize], pred: &[usize]) {
        assert_eq!(gt.len(), pred.len(), "gt and pred lengths differ");
        for (&g, &p) in gt.iter().zip(pred) {
            assert!(g < self.num_gt_classes, "gt label {g} out of range");
            assert!(p < self.num_pred_classes, "pred cluster {p} out of range");
        }
        self.gt.extend_from_slice(gt);
        self.pred.extend_from_slice(pred);
    }

    pub fn len(&self) -> usize {
        self.gt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gt.is_empty()
    }

    /// Match clusters to classes and compute mean IoU
    pub fn compute(&self, many_to_one: bool, precision_based: bool) -> MiouResult {
        assert!(!self.is_empty(), "no assignments accumulated");

        let score = self.score_matrix(precision_based);
        let mapping = if many_to_one {
            self.greedy_mapping(&score)
        } else {
            self.hungarian_mapping(&score)
        };

        let matched_bg_clusters = if many_to_one {
            mapping.iter().filter(|&&c| c == 0).count() as f64 / self.num_pred_classes as f64
        } else {
            1.0 / self.num_gt_classes as f64
        };
        let reordered_preds: Vec<usize> = self.pred.iter().map(|&p| mapping[p]).collect();

        let mut tp = vec![0.0f64; self.num_gt_classes];
        let mut fp = vec![0.0f64; self.num_gt_classes];
        let mut fn_counts = vec![0.0f64; self.num_gt_classes];
        for (&g, &p) in self.gt.iter().zip(&reordered_preds) {
            if g == p {
                tp[g] += 1.0;
            } else {
                fp[p] += 1.0;
                fn_counts[g] += 1.0;
            }
        }

        let mut iou_sum = 0.0f64;
        for c in 0..self.num_gt_classes {
            let denom = (tp[c] + fp[c] + fn_counts[c]).max(1e-8);
            iou_sum += tp[c] / denom;
        }

        MiouResult {
            miou: iou_sum / self.num_gt_classes as f64,
            tp,
            fp,
            fn_counts,
            reordered_preds,
            matched_bg_clusters,
        }
    }

    /// Per-(cluster, class) IoU or precision
    fn score_matrix(&self, precision_based: bool) -> Array2<f64> {
        // contingency counts in one pass
        let mut joint = vec![0.0f64; self.num_pred_classes * self.num_gt_classes];
        let mut pred_total = vec![0.0f64; self.num_pred_classes];
        let mut gt_total = vec![0.0f64; self.num_gt_classes];
        for (&g, &p) in self.gt.iter().zip(&self.pred) {
            joint[p * self.num_gt_classes + g] += 1.0;
            pred_total[p] += 1.0;
            gt_total[g] += 1.0;
        }

        let mut score = Array2::zeros((self.num_pred_classes, self.num_gt_classes));
        for p in 0..self.num_pred_classes {
            for g in 0..self.num_gt_classes {
                let tp = joint[p * self.num_gt_classes + g];
                let fp = pred_total[p] - tp;
                score[[p, g]] = if precision_based {
                    tp / (tp + fp).max(1e-8)
                } else {
                    let fn_count = gt_total[g] - tp;
                    tp / (tp + fp + fn_count).max(1e-8)
                };
            }
        }
        score
    }

    /// Each cluster joins its best class
    fn greedy_mapping(&self, score: &Array2<f64>) -> Vec<usize> {
        (0..self.num_pred_classes)
            .map(|p| {
                let mut best = 0usize;
                for g in 1..self.num_gt_classes {
                    if score[[p, g]] > score[[p, best]] {
                        best = g;
                    }
                }
                best
            })
            .collect()
    }

    /// One distinct cluster per class; leftovers become background
    fn hungarian_mapping(&self, score: &Array2<f64>) -> Vec<usize> {
        let mut cost = Array2::zeros((self.num_gt_classes, self.num_pred_classes));
        for g in 0..self.num_gt_classes {
            for p in 0..self.num_pred_classes {
                cost[[g, p]] = -score[[p, g]];
            }
        }
        let pairs = linear_sum_assignment(&cost);

        let mut mapping = vec![0usize; self.num_pred_classes];
        for (g, p) in pairs {
            mapping[p] = g;
        }
        mapping
    }
}
