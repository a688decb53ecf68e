//! Multi-crop batch contract and patch mask generation

use ndarray::Array2;
use rand::Rng;

use crate::config::ValidationError;

/// One collated training batch.
///
/// Crop buffers are row-major and crop-major: row `i·B + b` holds crop `i`
/// of image `b`. `masks` covers the global crops only; `mask_indices` lists
/// the masked positions as flattened `(crop·B + b)·n_patches + p` row
/// indices into the student's global patch-token buffer, and carries one
/// weight per entry.
#[derive(Debug, Clone)]
pub struct MultiCropBatch {
    pub global_crops: Array2<f32>,
    pub local_crops: Array2<f32>,
    pub masks: Array2<bool>,
    pub mask_indices: Vec<usize>,
    pub masks_weight: Vec<f32>,
    /// Preallocation bound for masked-patch buffers; never exceeded by
    /// `mask_indices.len()`
    pub upperbound: usize,
    pub n_global_crops: usize,
    pub n_local_crops: usize,
    pub batch_size: usize,
}

impl MultiCropBatch {
    pub fn n_masked(&self) -> usize {
        self.mask_indices.len()
    }

    /// Fail fast on internally inconsistent batches (programmer errors)
    pub fn check_consistency(&self) {
        assert_eq!(
            self.global_crops.nrows(),
            self.n_global_crops * self.batch_size,
            "global crop buffer rows disagree with crop count x batch size"
        );
        assert_eq!(
            self.local_crops.nrows(),
            self.n_local_crops * self.batch_size,
            "local crop buffer rows disagree with crop count x batch size"
        );
        assert_eq!(
            self.masks.nrows(),
            self.n_global_crops * self.batch_size,
            "mask rows disagree with global crop rows"
        );
        assert!(
            self.mask_indices.len() <= self.upperbound,
            "{} masked positions exceed the preallocation bound {}",
            self.mask_indices.len(),
            self.upperbound
        );
        assert_eq!(
            self.mask_indices.len(),
            self.masks_weight.len(),
            "each masked position needs exactly one weight"
        );
        let n_patch_rows = self.masks.nrows() * self.masks.ncols();
        for &idx in &self.mask_indices {
            assert!(idx < n_patch_rows, "mask index {idx} out of {n_patch_rows} patch rows");
        }
    }
}

/// Per-image generated masks plus the derived loss bookkeeping
#[derive(Debug, Clone)]
pub struct MaskSet {
    pub masks: Array2<bool>,
    pub mask_indices: Vec<usize>,
    pub masks_weight: Vec<f32>,
    pub upperbound: usize,
}

/// Samples per-image patch masks for the masked-prediction objective.
///
/// Each image is masked with probability `sample_probability`; a masked
/// image hides a uniform fraction of its patches drawn from
/// `ratio_min_max`. Each masked position is weighted by the inverse of its
/// image's masked count so every image contributes equally to the loss.
#[derive(Debug, Clone)]
pub struct MaskGenerator {
    ratio_min_max: (f32, f32),
    sample_probability: f32,
}

impl MaskGenerator {
    pub fn new(ratio_min_max: (f32, f32), sample_probability: f32) -> Result<Self, ValidationError> {
        let (min, max) = ratio_min_max;
        if !(0.0..=1.0).contains(&min) || !(0.0..=1.0).contains(&max) || min > max || max <= 0.0 {
            return Err(ValidationError::InvalidMaskRatio { min, max });
        }
        if !(sample_probability > 0.0 && sample_probability <= 1.0) {
            return Err(ValidationError::InvalidMaskProbability(sample_probability));
        }
        Ok(Self {
            ratio_min_max,
            sample_probability,
        })
    }

    /// Upper bound on masked positions for `n_images` images of
    /// `n_patches` patches
    pub fn upperbound(&self, n_images: usize, n_patches: usize) -> usize {
        let per_image = (n_patches as f32 * self.ratio_min_max.1).ceil() as usize;
        n_images * per_image.min(n_patches)
    }

    /// Sample masks for `n_images` crop rows of `n_patches` patches each
    pub fn generate<R: Rng>(&self, n_images: usize, n_patches: usize, rng: &mut R) -> MaskSet {
        assert!(n_patches > 0, "images must have at least one patch");
        let mut masks = Array2::from_elem((n_images, n_patches), false);
        let mut mask_indices = Vec::new();
        let mut masks_weight = Vec::new();

        let (min, max) = self.ratio_min_max;
        let per_image_cap = (n_patches as f32 * max).ceil() as usize;
        for img in 0..n_images {
            if rng.gen::<f32>() >= self.sample_probability {
                continue;
            }
            let ratio = if max > min { rng.gen_range(min..max) } else { max };
            let count = ((n_patches as f32 * ratio).round() as usize)
                .clamp(1, per_image_cap.min(n_patches));

            let picked = rand::seq::index::sample(rng, n_patches, count);
            let weight = 1.0 / count as f32;
            let mut positions: Vec<usize> = picked.into_iter().collect();
            positions.sort_unstable();
            for p in positions {
                masks[[img, p]] = true;
                mask_indices.push(img * n_patches + p);
                masks_weight.push(weight);
            }
        }

        MaskSet {
            masks,
            mask_indices,
            masks_weight,
            upperbound: self.upperbound(n_images, n_patches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generator() -> MaskGenerator {
        MaskGenerator::new((0.2, 0.5), 0.7).unwrap()
    }

    #[test]
    fn test_masked_count_within_upperbound() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let set = generator().generate(8, 16, &mut rng);
            assert!(set.mask_indices.len() <= set.upperbound);
            assert_eq!(set.mask_indices.len(), set.masks_weight.len());
        }
    }

    #[test]
    fn test_indices_match_mask_grid() {
        let mut rng = StdRng::seed_from_u64(11);
        let set = generator().generate(4, 9, &mut rng);
        let from_grid: Vec<usize> = set
            .masks
            .indexed_iter()
            .filter(|(_, &m)| m)
            .map(|((img, p), _)| img * 9 + p)
            .collect();
        assert_eq!(set.mask_indices, from_grid);
    }

    #[test]
    fn test_weights_sum_to_one_per_masked_image() {
        let mut rng = StdRng::seed_from_u64(3);
        let set = generator().generate(6, 12, &mut rng);
        for img in 0..6 {
            let total: f32 = set
                .mask_indices
                .iter()
                .zip(&set.masks_weight)
                .filter(|(&idx, _)| idx / 12 == img)
                .map(|(_, &w)| w)
                .sum();
            assert!(total == 0.0 || (total - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_always_mask_when_probability_one() {
        let gen = MaskGenerator::new((0.5, 0.5), 1.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let set = gen.generate(3, 8, &mut rng);
        // every image masked at exactly ratio 0.5
        assert_eq!(set.mask_indices.len(), 3 * 4);
    }

    #[test]
    fn test_rejects_zero_max_ratio() {
        assert!(matches!(
            MaskGenerator::new((0.0, 0.0), 0.5),
            Err(ValidationError::InvalidMaskRatio { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_probability() {
        assert!(matches!(
            MaskGenerator::new((0.1, 0.5), 0.0),
            Err(ValidationError::InvalidMaskProbability(_))
        ));
    }

    #[test]
    #[should_panic(expected = "exceed the preallocation bound")]
    fn test_batch_consistency_catches_upperbound_violation() {
        let batch = MultiCropBatch {
            global_crops: Array2::zeros((2, 4)),
            local_crops: Array2::zeros((0, 4)),
            masks: Array2::from_elem((2, 2), false),
            mask_indices: vec![0, 1, 2],
            masks_weight: vec![0.5; 3],
            upperbound: 2,
            n_global_crops: 2,
            n_local_crops: 0,
            batch_size: 1,
        };
        batch.check_consistency();
    }
}
