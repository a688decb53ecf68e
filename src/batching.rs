//! Segmented batching: several crop groups through one head pass
//!
//! Projection heads are row-wise, so class tokens from local crops, global
//! crops, and the masked-patch buffer can share a single forward pass by
//! stacking their rows into one buffer and remembering `(offset, len)`
//! segments. Rows never interact across segments because no head op mixes
//! rows.

use ndarray::{Array2, ArrayView2};

use crate::autograd::{ops, Tensor};

/// One row range of a packed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: usize,
    pub len: usize,
}

/// Row layout of a packed buffer
#[derive(Debug, Clone)]
pub struct SegmentedBatch {
    segments: Vec<Segment>,
    width: usize,
}

impl SegmentedBatch {
    /// Pack grad-tracking tensors row-wise. `rows[i]` is the row count of
    /// `parts[i]`; all parts share `width` columns.
    pub fn concat(parts: &[&Tensor], rows: &[usize], width: usize) -> (Tensor, Self) {
        let packed = ops::concat_rows(parts, rows, width);
        let mut segments = Vec::with_capacity(rows.len());
        let mut offset = 0;
        for &len in rows {
            segments.push(Segment { offset, len });
            offset += len;
        }
        (packed, Self { segments, width })
    }

    /// Split head output back into per-group tensors, one per segment.
    /// Gradients route to the packed tensor once every segment's consumer
    /// has run backward.
    pub fn split(&self, packed: &Tensor) -> Vec<Tensor> {
        let spans: Vec<(usize, usize)> = self.segments.iter().map(|s| (s.offset, s.len)).collect();
        ops::split_rows(packed, &spans, self.width)
    }

    /// Pack plain arrays (teacher path, no gradients)
    pub fn concat_arrays(parts: &[ArrayView2<'_, f32>]) -> (Array2<f32>, Self) {
        assert!(!parts.is_empty(), "nothing to pack");
        let width = parts[0].ncols();
        let total: usize = parts.iter().map(|p| p.nrows()).sum();

        let mut packed = Array2::zeros((total, width));
        let mut segments = Vec::with_capacity(parts.len());
        let mut offset = 0;
        for part in parts {
            assert_eq!(part.ncols(), width, "all parts must share a column count");
            packed
                .slice_mut(ndarray::s![offset..offset + part.nrows(), ..])
                .assign(part);
            segments.push(Segment {
                offset,
                len: part.nrows(),
            });
            offset += part.nrows();
        }
        (packed, Self { segments, width })
    }

    /// Split a plain array back into per-segment arrays
    pub fn split_arrays(&self, packed: &Array2<f32>) -> Vec<Array2<f32>> {
        assert_eq!(packed.ncols(), self.width, "column count changed since packing");
        self.segments
            .iter()
            .map(|s| packed.slice(ndarray::s![s.offset..s.offset + s.len, ..]).to_owned())
            .collect()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn total_rows(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn width(&self) -> usize {
        self.width
    }
}
