//! Student-teacher self-distillation training step
//!
//! [`SslMetaArch`] owns both sides of the student-teacher pair and runs one
//! training step: teacher forward over the global crops to produce centered
//! targets, student forward over every crop group packed through a single
//! head pass, loss aggregation across the class-token, Koleo, and
//! masked-patch branches, and the backward pass. The EMA teacher update is a
//! separate call so the optimizer can step in between.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{s, Array1, Array2};

use crate::autograd::{backward, discard, ops, GradScaler, Tensor};
use crate::batching::SegmentedBatch;
use crate::centering::{strategy_for, CenterState, TeacherCentering};
use crate::comm::Collective;
use crate::config::{SslConfig, ValidationError};
use crate::data::MultiCropBatch;
use crate::loss::{CropPairing, DinoLoss, IbotPatchLoss, KoleoLoss};
use crate::model::{Backbone, ProjectionHead, ShardedModule, StreamHandles};

/// Scalar loss values of one step, keyed by branch name
pub type LossDict = BTreeMap<String, f32>;

/// Reporting scale applied to the global-crop and patch terms; logged values
/// are divided back so dashboards stay comparable across crop schedules.
const LOSS_SCALES: f32 = 2.0;

/// A backbone with its projection heads, one side of the student-teacher
/// pair.
///
/// `ibot_head` is `Some` only in separate-head mode; otherwise masked patch
/// tokens share `dino_head`.
pub struct ModuleSet {
    pub backbone: Box<dyn Backbone>,
    pub dino_head: Box<dyn ProjectionHead>,
    pub ibot_head: Option<Box<dyn ProjectionHead>>,
}

impl ModuleSet {
    /// All parameters in a stable order. Tensors alias module storage, so
    /// in-place writes update the modules.
    pub fn parameters(&self) -> Vec<Tensor> {
        let mut params = collect_params(self.backbone.as_ref());
        params.extend(collect_params(self.dino_head.as_ref()));
        if let Some(head) = &self.ibot_head {
            params.extend(collect_params(head.as_ref()));
        }
        params
    }

    /// The head that projects patch tokens
    fn patch_head(&self) -> &dyn ProjectionHead {
        match &self.ibot_head {
            Some(head) => head.as_ref(),
            None => self.dino_head.as_ref(),
        }
    }

    fn reshard_all(&self) {
        self.backbone.reshard();
        self.dino_head.reshard();
        if let Some(head) = &self.ibot_head {
            head.reshard();
        }
    }

    fn bind_streams(&self, streams: &StreamHandles) {
        self.backbone.bind_streams(streams);
        self.dino_head.bind_streams(streams);
        if let Some(head) = &self.ibot_head {
            head.bind_streams(streams);
        }
    }
}

fn collect_params<M: ShardedModule + ?Sized>(module: &M) -> Vec<Tensor> {
    module
        .shards()
        .into_iter()
        .flat_map(|shard| shard.params)
        .collect()
}

fn as_matrix(tensor: &Tensor, rows: usize, cols: usize) -> Array2<f32> {
    assert_eq!(
        tensor.len(),
        rows * cols,
        "tensor has {} elements, expected {rows}x{cols}",
        tensor.len()
    );
    Array2::from_shape_vec((rows, cols), tensor.data().to_vec())
        .expect("length checked against rows*cols")
}

/// Cut a crop-major (chunks·rows × K) matrix into per-crop blocks
fn chunk_rows(probs: &Array2<f32>, chunks: usize, rows_per_chunk: usize) -> Vec<Array2<f32>> {
    (0..chunks)
        .map(|c| {
            probs
                .slice(s![c * rows_per_chunk..(c + 1) * rows_per_chunk, ..])
                .to_owned()
        })
        .collect()
}

fn sum_terms(terms: &[Tensor]) -> Tensor {
    assert!(!terms.is_empty(), "no loss terms to sum");
    let mut acc = terms[0].clone();
    for term in &terms[1..] {
        acc = ops::add(&acc, term);
    }
    acc
}

fn add_weighted(total: Option<Tensor>, term: &Tensor, weight: f32) -> Option<Tensor> {
    Some(match total {
        Some(acc) => ops::add_scaled(&acc, term, weight),
        None => ops::scale(term, weight),
    })
}

/// The self-distillation training core.
///
/// Owns the student and teacher module sets, the three loss branches, the
/// teacher-centering strategy with its running state, and the optional
/// gradient scaler. One step is `forward_backward` followed by the caller's
/// optimizer step and `update_teacher`.
pub struct SslMetaArch {
    config: SslConfig,
    student: ModuleSet,
    teacher: ModuleSet,
    dino_loss: DinoLoss,
    ibot_loss: IbotPatchLoss,
    koleo_loss: KoleoLoss,
    centering: Box<dyn TeacherCentering>,
    dino_centers: Vec<CenterState>,
    ibot_centers: Vec<CenterState>,
    collective: Arc<dyn Collective>,
    scaler: Option<GradScaler>,
    streams_synchronized: bool,
}

impl SslMetaArch {
    /// Wire up a validated configuration with its module sets.
    ///
    /// Panics on miswired modules (prototype or resolution mismatches,
    /// missing patch heads); those are construction bugs, not runtime
    /// conditions.
    pub fn new(
        config: SslConfig,
        student: ModuleSet,
        teacher: ModuleSet,
        collective: Arc<dyn Collective>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        assert!(
            config.dino.loss_weight > 0.0
                || config.dino.koleo_loss_weight > 0.0
                || config.ibot.loss_weight > 0.0,
            "every loss branch is disabled"
        );

        let k = config.dino.head_n_prototypes;
        assert_eq!(
            student.dino_head.out_dim(),
            k,
            "student head emits {} prototypes, config says {k}",
            student.dino_head.out_dim()
        );
        assert_eq!(
            teacher.dino_head.out_dim(),
            k,
            "teacher head emits {} prototypes, config says {k}",
            teacher.dino_head.out_dim()
        );
        assert_eq!(
            student.dino_head.n_resolutions(),
            teacher.dino_head.n_resolutions(),
            "student and teacher heads disagree on resolution count"
        );
        if !config.dino.mrl {
            assert_eq!(
                student.dino_head.n_resolutions(),
                1,
                "multi-resolution heads need dino.MRL enabled"
            );
        }
        if config.ibot.separate_head {
            assert!(
                student.ibot_head.is_some() && teacher.ibot_head.is_some(),
                "separate_head needs dedicated patch heads on both sides"
            );
            assert_eq!(
                student.patch_head().out_dim(),
                teacher.patch_head().out_dim(),
                "patch heads disagree on prototype count"
            );
            assert_eq!(
                student.patch_head().n_resolutions(),
                teacher.patch_head().n_resolutions(),
                "patch heads disagree on resolution count"
            );
        } else {
            assert!(
                student.ibot_head.is_none() && teacher.ibot_head.is_none(),
                "shared-head mode must not carry dedicated patch heads"
            );
        }
        assert_eq!(
            student.backbone.embed_dim(),
            teacher.backbone.embed_dim(),
            "student and teacher backbones disagree on embedding width"
        );

        let student_temp = config.train.student_temp;
        let dino_centers = vec![CenterState::new(); student.dino_head.n_resolutions()];
        let ibot_centers = vec![CenterState::new(); student.patch_head().n_resolutions()];
        let centering = strategy_for(config.train.centering, config.train.center_momentum);
        let scaler = config
            .compute_precision
            .grad_scaler
            .then(|| GradScaler::new(config.compute_precision.initial_scale));

        Ok(Self {
            dino_loss: DinoLoss::new(student_temp),
            ibot_loss: IbotPatchLoss::new(student_temp),
            koleo_loss: KoleoLoss::new(),
            centering,
            dino_centers,
            ibot_centers,
            collective,
            scaler,
            streams_synchronized: false,
            config,
            student,
            teacher,
        })
    }

    pub fn student(&self) -> &ModuleSet {
        &self.student
    }

    pub fn teacher(&self) -> &ModuleSet {
        &self.teacher
    }

    pub fn config(&self) -> &SslConfig {
        &self.config
    }

    pub fn scaler(&self) -> Option<&GradScaler> {
        self.scaler.as_ref()
    }

    /// Running centers of the class-token targets, one per resolution
    pub fn dino_center_states(&self) -> &[CenterState] {
        &self.dino_centers
    }

    /// Running centers of the masked-patch targets, one per resolution
    pub fn ibot_center_states(&self) -> &[CenterState] {
        &self.ibot_centers
    }

    /// Run one training step: teacher targets, student forward, loss
    /// aggregation, backward. Returns the per-branch loss values; keys are
    /// present only for branches that actually ran.
    pub fn forward_backward(&mut self, batch: &MultiCropBatch, teacher_temp: f32) -> LossDict {
        batch.check_consistency();
        assert_eq!(
            batch.n_global_crops, self.config.crops.global_crops_number,
            "batch and config disagree on global crop count"
        );
        assert_eq!(
            batch.n_local_crops, self.config.crops.local_crops_number,
            "batch and config disagree on local crop count"
        );
        assert!(
            teacher_temp > 0.0 && teacher_temp.is_finite(),
            "teacher temperature must be positive, got {teacher_temp}"
        );

        let b = batch.batch_size;
        let n_global = batch.n_global_crops;
        let n_local = batch.n_local_crops;
        let embed = self.student.backbone.embed_dim();

        let dino_on = self.config.dino.loss_weight > 0.0;
        let koleo_on = self.config.dino.koleo_loss_weight > 0.0;
        let ibot_on = self.config.ibot.loss_weight > 0.0 && batch.n_masked() > 0;
        let local_on = dino_on && n_local > 0;
        let shared_patch_head = !self.config.ibot.separate_head;

        let mut dict = LossDict::new();
        if !(dino_on || koleo_on || ibot_on) {
            return dict;
        }

        self.synchronize_streams();
        for param in self.student.parameters() {
            param.zero_grad();
        }

        // ---- teacher targets (no tape) ----
        let mut dino_targets: Vec<Vec<Array2<f32>>> = Vec::new(); // [resolution][crop]
        let mut ibot_targets: Vec<Array2<f32>> = Vec::new(); // [resolution]
        if dino_on || ibot_on {
            let out = self.teacher.backbone.forward(&batch.global_crops, None, false);
            assert_eq!(
                out.n_cls_rows,
                n_global * b,
                "teacher class-token rows disagree with crop layout"
            );
            let masked = ibot_on
                .then(|| ops::index_select_rows(&out.patch_tokens, &batch.mask_indices, embed));

            match (&masked, dino_on, shared_patch_head) {
                // class tokens and masked patches share one head pass over a
                // buffer preallocated at the declared masking upper bound
                (Some(masked), true, true) => {
                    let pad_rows = batch.upperbound - batch.n_masked();
                    let padding = Tensor::zeros(pad_rows * embed, false);
                    let (packed, layout) = SegmentedBatch::concat(
                        &[&out.cls_tokens, masked, &padding],
                        &[n_global * b, batch.n_masked(), pad_rows],
                        embed,
                    );
                    let logits = self.teacher.dino_head.forward(&packed, layout.total_rows());
                    for (r, block) in logits.iter().enumerate() {
                        let groups = layout.split(block);
                        let probs = self.center_dino(&groups[0], r, n_global * b, teacher_temp);
                        dino_targets.push(chunk_rows(&probs, n_global, b));
                        ibot_targets.push(self.center_ibot(
                            &groups[1],
                            r,
                            batch.n_masked(),
                            teacher_temp,
                        ));
                    }
                }
                _ => {
                    if dino_on {
                        let logits = self.teacher.dino_head.forward(&out.cls_tokens, n_global * b);
                        for (r, block) in logits.iter().enumerate() {
                            let probs = self.center_dino(block, r, n_global * b, teacher_temp);
                            dino_targets.push(chunk_rows(&probs, n_global, b));
                        }
                    }
                    if let Some(masked) = &masked {
                        let logits = self.teacher.patch_head().forward(masked, batch.n_masked());
                        for (r, block) in logits.iter().enumerate() {
                            ibot_targets.push(self.center_ibot(
                                block,
                                r,
                                batch.n_masked(),
                                teacher_temp,
                            ));
                        }
                    }
                }
            }
            // unsharded teacher parameters are not needed past this point
            self.teacher.reshard_all();
        }

        // ---- student forward ----
        let masks = if ibot_on { Some(&batch.masks) } else { None };
        let global_out = self.student.backbone.forward(&batch.global_crops, masks, true);

        let (head_cls, koleo_cls) = match (dino_on, koleo_on) {
            (true, true) => {
                let mut copies = ops::fanout(&global_out.cls_tokens, 2);
                let koleo = copies.pop();
                (copies.pop(), koleo)
            }
            (true, false) => (Some(global_out.cls_tokens.clone()), None),
            (false, true) => (None, Some(global_out.cls_tokens.clone())),
            (false, false) => {
                discard(&global_out.cls_tokens);
                (None, None)
            }
        };

        let local_cls = if local_on {
            let out = self.student.backbone.forward(&batch.local_crops, None, true);
            discard(&out.patch_tokens);
            Some(out.cls_tokens)
        } else {
            None
        };

        let ibot_buffer = if ibot_on {
            let selected =
                ops::index_select_rows(&global_out.patch_tokens, &batch.mask_indices, embed);
            let pad_rows = batch.upperbound - batch.n_masked();
            Some(if pad_rows > 0 {
                let padding = Tensor::zeros(pad_rows * embed, false);
                ops::concat_rows(&[&selected, &padding], &[batch.n_masked(), pad_rows], embed)
            } else {
                selected
            })
        } else {
            discard(&global_out.patch_tokens);
            None
        };

        // every enabled crop group goes through the student head in one pass
        let mut parts: Vec<&Tensor> = Vec::new();
        let mut rows: Vec<usize> = Vec::new();
        if let Some(local) = &local_cls {
            parts.push(local);
            rows.push(n_local * b);
        }
        if let Some(cls) = &head_cls {
            parts.push(cls);
            rows.push(n_global * b);
        }
        let ibot_shares_pack = ibot_on && shared_patch_head;
        if ibot_shares_pack {
            if let Some(buffer) = &ibot_buffer {
                parts.push(buffer);
                rows.push(batch.upperbound);
            }
        }

        let mut local_logits: Vec<Tensor> = Vec::new();
        let mut global_logits: Vec<Tensor> = Vec::new();
        let mut ibot_logits: Vec<Tensor> = Vec::new();
        if !parts.is_empty() {
            let (packed, layout) = SegmentedBatch::concat(&parts, &rows, embed);
            for block in self.student.dino_head.forward(&packed, layout.total_rows()) {
                let mut groups = layout.split(&block);
                if local_cls.is_some() {
                    local_logits.push(groups.remove(0));
                }
                if head_cls.is_some() {
                    global_logits.push(groups.remove(0));
                }
                if ibot_shares_pack {
                    ibot_logits.push(groups.remove(0));
                }
            }
        }
        if ibot_on && !shared_patch_head {
            if let Some(buffer) = &ibot_buffer {
                ibot_logits = self.student.patch_head().forward(buffer, batch.upperbound);
            }
        }

        // ---- losses ----
        let n_global_terms = n_global * (n_global - 1);
        let n_local_terms = (n_local * n_global).max(1);
        let pair_terms = (n_global_terms + n_local_terms) as f32;

        let mut total: Option<Tensor> = None;

        if dino_on {
            assert_eq!(global_logits.len(), dino_targets.len());
            let n_res = global_logits.len() as f32;

            let raws: Vec<Tensor> = global_logits
                .iter()
                .zip(&dino_targets)
                .map(|(logits, targets)| {
                    self.dino_loss
                        .forward(logits, n_global, b, targets, CropPairing::GlobalToGlobal)
                })
                .collect();
            let term = ops::scale(&sum_terms(&raws), LOSS_SCALES / (pair_terms * n_res));
            dict.insert("dino_global_crops_loss".to_string(), term.data()[0]);
            total = add_weighted(total, &term, self.config.dino.loss_weight);

            if local_on {
                let raws: Vec<Tensor> = local_logits
                    .iter()
                    .zip(&dino_targets)
                    .map(|(logits, targets)| {
                        self.dino_loss
                            .forward(logits, n_local, b, targets, CropPairing::LocalToGlobal)
                    })
                    .collect();
                let term = ops::scale(&sum_terms(&raws), 1.0 / (pair_terms * n_res));
                dict.insert("dino_local_crops_loss".to_string(), term.data()[0]);
                total = add_weighted(total, &term, self.config.dino.loss_weight);
            }
        }

        if let Some(cls) = &koleo_cls {
            let spans: Vec<(usize, usize)> = (0..n_global).map(|g| (g * b, b)).collect();
            let chunks = ops::split_rows(cls, &spans, embed);
            let raws: Vec<Tensor> = chunks
                .iter()
                .map(|chunk| self.koleo_loss.forward_tensor(chunk, b, embed))
                .collect();
            let term = sum_terms(&raws);
            let weight = self.config.dino.koleo_loss_weight;
            dict.insert("koleo_loss".to_string(), weight * term.data()[0] / LOSS_SCALES);
            total = add_weighted(total, &term, weight);
        }

        if ibot_on {
            assert_eq!(ibot_logits.len(), ibot_targets.len());
            let n_res = ibot_logits.len() as f32;
            let raws: Vec<Tensor> = ibot_logits
                .iter()
                .zip(&ibot_targets)
                .map(|(logits, targets)| {
                    self.ibot_loss
                        .forward(logits, batch.n_masked(), targets, &batch.masks_weight)
                })
                .collect();
            let term = ops::scale(
                &sum_terms(&raws),
                LOSS_SCALES / (n_global as f32 * n_res),
            );
            dict.insert("ibot_loss".to_string(), term.data()[0] / LOSS_SCALES);
            total = add_weighted(total, &term, self.config.ibot.loss_weight);
        }

        // ---- backward ----
        if let Some(mut total) = total {
            let seed = self
                .scaler
                .as_ref()
                .map(|scaler| Array1::from(vec![scaler.scale()]));
            backward(&mut total, seed);
            if let Some(scaler) = self.scaler.as_mut() {
                let params = self.student.parameters();
                let grads_valid = scaler.unscale_and_check(&params);
                scaler.update(grads_valid);
            }
        }

        dict
    }

    /// EMA teacher update: `teacher ← m·teacher + (1−m)·student`
    pub fn update_teacher(&mut self, momentum: f32) {
        assert!(
            (0.0..=1.0).contains(&momentum),
            "EMA momentum must be in [0, 1], got {momentum}"
        );
        let student = self.student.parameters();
        let teacher = self.teacher.parameters();
        assert_eq!(
            student.len(),
            teacher.len(),
            "student and teacher parameter counts diverged"
        );
        for (s, t) in student.iter().zip(&teacher) {
            assert_eq!(
                s.len(),
                t.len(),
                "parameter shape diverged between student and teacher"
            );
            let src = s.data();
            let mut dst = t.data_mut();
            dst.zip_mut_with(&src, |t_val, &s_val| {
                *t_val = *t_val * momentum + s_val * (1.0 - momentum);
            });
        }
    }

    /// One-shot latch: after the first step every module runs on the teacher
    /// backbone's compute streams.
    fn synchronize_streams(&mut self) {
        if self.streams_synchronized {
            return;
        }
        let handles = self.teacher.backbone.stream_handles();
        self.student.bind_streams(&handles);
        self.teacher.bind_streams(&handles);
        self.streams_synchronized = true;
    }

    fn center_dino(
        &mut self,
        logits: &Tensor,
        resolution: usize,
        rows: usize,
        teacher_temp: f32,
    ) -> Array2<f32> {
        let matrix = as_matrix(logits, rows, self.config.dino.head_n_prototypes);
        self.centering.center(
            &matrix,
            teacher_temp,
            &mut self.dino_centers[resolution],
            self.collective.as_ref(),
        )
    }

    fn center_ibot(
        &mut self,
        logits: &Tensor,
        resolution: usize,
        rows: usize,
        teacher_temp: f32,
    ) -> Array2<f32> {
        let matrix = as_matrix(logits, rows, self.teacher.patch_head().out_dim());
        self.centering.center(
            &matrix,
            teacher_temp,
            &mut self.ibot_centers[resolution],
            self.collective.as_ref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::NullCollective;
    use crate::config::CenteringKind;
    use crate::model::{LinearBackbone, LinearHead, MrlLinearHead, ParamShard};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::cell::Cell;
    use std::rc::Rc;

    const PATCH_DIM: usize = 2;
    const EMBED: usize = 4;
    const K: usize = 5;
    const N_PATCHES: usize = 3;

    fn crops(rows: usize, rng: &mut StdRng) -> Array2<f32> {
        Array2::from_shape_fn((rows, N_PATCHES * PATCH_DIM), |_| rng.gen_range(-1.0..1.0))
    }

    fn make_batch(b: usize, n_local: usize, mask: bool, seed: u64) -> MultiCropBatch {
        let mut rng = StdRng::seed_from_u64(seed);
        let global_rows = 2 * b;
        let global_crops = crops(global_rows, &mut rng);
        let local_crops = crops(n_local * b, &mut rng);

        let mut masks = Array2::from_elem((global_rows, N_PATCHES), false);
        let mut mask_indices = Vec::new();
        let mut masks_weight = Vec::new();
        if mask {
            // one masked patch per global crop row
            for r in 0..global_rows {
                masks[[r, 0]] = true;
                mask_indices.push(r * N_PATCHES);
                masks_weight.push(1.0);
            }
        }
        MultiCropBatch {
            global_crops,
            local_crops,
            masks,
            upperbound: mask_indices.len() + 2, // exercises buffer padding
            mask_indices,
            masks_weight,
            n_global_crops: 2,
            n_local_crops: n_local,
            batch_size: b,
        }
    }

    fn base_config() -> SslConfig {
        let mut config = SslConfig::default();
        config.dino.head_n_prototypes = K;
        config.dino.loss_weight = 1.0;
        config.dino.koleo_loss_weight = 0.1;
        config.ibot.loss_weight = 1.0;
        config.crops.local_crops_number = 2;
        config
    }

    fn linear_modules(seed: u64, separate: bool) -> (ModuleSet, ModuleSet) {
        let mut rng = StdRng::seed_from_u64(seed);
        let backbone = LinearBackbone::new(PATCH_DIM, EMBED, &mut rng);
        let dino_head = LinearHead::new(EMBED, K, &mut rng);
        let ibot_head = separate.then(|| LinearHead::new(EMBED, K, &mut rng));

        let teacher = ModuleSet {
            backbone: Box::new(backbone.teacher_copy()),
            dino_head: Box::new(dino_head.teacher_copy()),
            ibot_head: ibot_head
                .as_ref()
                .map(|h| Box::new(h.teacher_copy()) as Box<dyn ProjectionHead>),
        };
        let student = ModuleSet {
            backbone: Box::new(backbone),
            dino_head: Box::new(dino_head),
            ibot_head: ibot_head.map(|h| Box::new(h) as Box<dyn ProjectionHead>),
        };
        (student, teacher)
    }

    fn build(config: SslConfig) -> SslMetaArch {
        let (student, teacher) = linear_modules(42, config.ibot.separate_head);
        SslMetaArch::new(config, student, teacher, Arc::new(NullCollective)).unwrap()
    }

    #[test]
    fn test_full_step_populates_every_branch() {
        let mut arch = build(base_config());
        let dict = arch.forward_backward(&make_batch(3, 2, true, 1), 0.07);

        for key in [
            "dino_global_crops_loss",
            "dino_local_crops_loss",
            "koleo_loss",
            "ibot_loss",
        ] {
            let value = dict.get(key).copied().unwrap_or_else(|| panic!("missing {key}"));
            assert!(value.is_finite(), "{key} = {value}");
        }

        for param in arch.student().parameters() {
            let grad = param.grad().expect("student parameter missing gradient");
            assert!(
                grad.iter().any(|&g| g != 0.0),
                "student parameter received an all-zero gradient"
            );
        }
    }

    #[test]
    fn test_teacher_parameters_untouched_by_backward() {
        let mut arch = build(base_config());
        let before: Vec<Array1<f32>> =
            arch.teacher().parameters().iter().map(Tensor::data).collect();
        arch.forward_backward(&make_batch(2, 2, true, 3), 0.05);

        for (param, snapshot) in arch.teacher().parameters().iter().zip(&before) {
            assert_eq!(param.data(), *snapshot);
            assert!(param.grad().is_none());
        }
    }

    #[test]
    fn test_ema_update_moves_teacher_toward_student() {
        let mut arch = build(base_config());
        for param in arch.student().parameters() {
            let mut data = param.data_mut();
            for (i, v) in data.iter_mut().enumerate() {
                *v = (i + 1) as f32;
            }
        }
        for param in arch.teacher().parameters() {
            param.data_mut().fill(0.0);
        }
        arch.update_teacher(0.99);

        // t' = 0.99 * 0 + 0.01 * s, element-wise
        for param in arch.teacher().parameters() {
            for (i, &v) in param.data().iter().enumerate() {
                assert_relative_eq!(v, 0.01 * (i + 1) as f32, epsilon = 1e-6);
            }
        }
        // the student side is read-only in the update
        for param in arch.student().parameters() {
            assert!(param
                .data()
                .iter()
                .enumerate()
                .all(|(i, &v)| v == (i + 1) as f32));
        }
    }

    #[test]
    fn test_local_key_absent_without_local_crops() {
        let mut config = base_config();
        config.crops.local_crops_number = 0;
        let mut arch = build(config);
        let dict = arch.forward_backward(&make_batch(2, 0, true, 7), 0.07);

        assert!(!dict.contains_key("dino_local_crops_loss"));
        assert!(dict.contains_key("dino_global_crops_loss"));
        assert!(dict.contains_key("ibot_loss"));
    }

    #[test]
    fn test_ibot_branch_skipped_without_masked_patches() {
        let mut arch = build(base_config());
        let dict = arch.forward_backward(&make_batch(2, 2, false, 11), 0.07);
        assert!(!dict.contains_key("ibot_loss"));
        assert!(dict.contains_key("dino_global_crops_loss"));
    }

    #[test]
    fn test_patch_only_config() {
        let mut config = base_config();
        config.dino.loss_weight = 0.0;
        config.dino.koleo_loss_weight = 0.0;
        config.crops.local_crops_number = 0;
        let mut arch = build(config);

        // nothing masked: no branch runs at all
        let dict = arch.forward_backward(&make_batch(2, 0, false, 13), 0.07);
        assert!(dict.is_empty());

        let dict = arch.forward_backward(&make_batch(2, 0, true, 13), 0.07);
        assert_eq!(dict.len(), 1);
        assert!(dict["ibot_loss"].is_finite());
        for param in arch.student().parameters() {
            assert!(param.grad().is_some());
        }
    }

    #[test]
    fn test_separate_patch_head_receives_gradients() {
        let mut config = base_config();
        config.ibot.separate_head = true;
        config.dino.koleo_loss_weight = 0.0;
        let mut arch = build(config);
        let dict = arch.forward_backward(&make_batch(2, 2, true, 17), 0.07);

        assert!(dict["ibot_loss"].is_finite());
        let patch_head_params = collect_params(arch.student().patch_head());
        for param in patch_head_params {
            let grad = param.grad().expect("patch head missing gradient");
            assert!(grad.iter().any(|&g| g != 0.0));
        }
    }

    #[test]
    fn test_mrl_heads_run_every_resolution() {
        let mut rng = StdRng::seed_from_u64(23);
        let backbone = LinearBackbone::new(PATCH_DIM, EMBED, &mut rng);
        let dino_head = MrlLinearHead::new(EMBED, K, 2, &mut rng);
        let teacher = ModuleSet {
            backbone: Box::new(backbone.teacher_copy()),
            dino_head: Box::new(dino_head.teacher_copy()),
            ibot_head: None,
        };
        let student = ModuleSet {
            backbone: Box::new(backbone),
            dino_head: Box::new(dino_head),
            ibot_head: None,
        };

        let mut config = base_config();
        config.dino.mrl = true;
        let mut arch =
            SslMetaArch::new(config, student, teacher, Arc::new(NullCollective)).unwrap();
        let dict = arch.forward_backward(&make_batch(2, 2, true, 29), 0.07);

        assert!(dict["dino_global_crops_loss"].is_finite());
        assert!(dict["ibot_loss"].is_finite());
        // both resolutions' projections took gradients
        for param in arch.student().parameters() {
            assert!(param.grad().is_some());
        }
        assert_eq!(arch.dino_center_states().len(), 2);
    }

    #[test]
    fn test_grad_scaler_unscales_to_plain_gradients() {
        let batch = make_batch(2, 2, true, 31);

        let mut plain = build(base_config());
        plain.forward_backward(&batch, 0.07);
        let reference: Vec<Array1<f32>> = plain
            .student()
            .parameters()
            .iter()
            .map(|p| p.grad().unwrap())
            .collect();

        let mut config = base_config();
        config.compute_precision.grad_scaler = true;
        config.compute_precision.initial_scale = 1024.0;
        let mut scaled = build(config);
        scaled.forward_backward(&batch, 0.07);

        assert_eq!(scaled.scaler().unwrap().overflow_count(), 0);
        for (param, expected) in scaled.student().parameters().iter().zip(&reference) {
            let grad = param.grad().unwrap();
            for (&g, &e) in grad.iter().zip(expected.iter()) {
                assert_relative_eq!(g, e, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn test_center_state_follows_strategy() {
        let mut config = base_config();
        config.train.centering = CenteringKind::Centering;
        let mut arch = build(config);
        arch.forward_backward(&make_batch(2, 2, true, 37), 0.07);
        assert!(arch.dino_center_states()[0].center().is_some());
        assert!(arch.ibot_center_states()[0].center().is_some());

        let mut config = base_config();
        config.train.centering = CenteringKind::SinkhornKnopp;
        let mut arch = build(config);
        arch.forward_backward(&make_batch(2, 2, true, 37), 0.07);
        assert!(arch.dino_center_states()[0].center().is_none());
    }

    struct SpyHead {
        inner: LinearHead,
        reshards: Rc<Cell<usize>>,
        binds: Rc<Cell<usize>>,
        streams: Rc<Cell<StreamHandles>>,
    }

    impl ShardedModule for SpyHead {
        fn shards(&self) -> Vec<ParamShard> {
            self.inner.shards()
        }
        fn reshard(&self) {
            self.reshards.set(self.reshards.get() + 1);
        }
        fn stream_handles(&self) -> StreamHandles {
            self.streams.get()
        }
        fn bind_streams(&self, streams: &StreamHandles) {
            self.binds.set(self.binds.get() + 1);
            self.streams.set(*streams);
        }
    }

    impl ProjectionHead for SpyHead {
        fn out_dim(&self) -> usize {
            ProjectionHead::out_dim(&self.inner)
        }
        fn forward(&self, tokens: &Tensor, n_rows: usize) -> Vec<Tensor> {
            self.inner.forward(tokens, n_rows)
        }
    }

    #[test]
    fn test_teacher_reshards_each_step_and_streams_bind_once() {
        let mut rng = StdRng::seed_from_u64(41);
        let backbone = LinearBackbone::new(PATCH_DIM, EMBED, &mut rng);
        let dino_head = LinearHead::new(EMBED, K, &mut rng);
        let source_streams = StreamHandles {
            unshard_stream: 7,
            post_backward_stream: 9,
        };
        let teacher_backbone = backbone.teacher_copy().with_stream_handles(source_streams);

        let reshards = Rc::new(Cell::new(0));
        let binds = Rc::new(Cell::new(0));
        let streams = Rc::new(Cell::new(StreamHandles::default()));
        let spy = SpyHead {
            inner: dino_head.teacher_copy(),
            reshards: Rc::clone(&reshards),
            binds: Rc::clone(&binds),
            streams: Rc::clone(&streams),
        };

        let student = ModuleSet {
            backbone: Box::new(backbone),
            dino_head: Box::new(dino_head),
            ibot_head: None,
        };
        let teacher = ModuleSet {
            backbone: Box::new(teacher_backbone),
            dino_head: Box::new(spy),
            ibot_head: None,
        };

        let mut config = base_config();
        config.ibot.loss_weight = 0.0;
        config.dino.koleo_loss_weight = 0.0;
        let mut arch =
            SslMetaArch::new(config, student, teacher, Arc::new(NullCollective)).unwrap();

        let batch = make_batch(2, 2, false, 43);
        arch.forward_backward(&batch, 0.07);
        arch.forward_backward(&batch, 0.07);

        assert_eq!(reshards.get(), 2, "teacher must reshard once per step");
        assert_eq!(binds.get(), 1, "stream binding is a one-shot latch");
        assert_eq!(streams.get(), source_streams);
    }

    #[test]
    #[should_panic(expected = "prototypes")]
    fn test_rejects_head_prototype_mismatch() {
        let (student, teacher) = linear_modules(47, false);
        let mut config = base_config();
        config.dino.head_n_prototypes = K + 1;
        let _ = SslMetaArch::new(config, student, teacher, Arc::new(NullCollective));
    }

    #[test]
    #[should_panic(expected = "every loss branch is disabled")]
    fn test_all_branches_disabled_is_a_config_bug() {
        let mut config = base_config();
        config.dino.loss_weight = 0.0;
        config.dino.koleo_loss_weight = 0.0;
        config.ibot.loss_weight = 0.0;
        let (student, teacher) = linear_modules(53, false);
        let _ = SslMetaArch::new(config, student, teacher, Arc::new(NullCollective));
    }
}
