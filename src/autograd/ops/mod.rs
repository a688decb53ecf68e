//! Differentiable operations with recorded backward passes

mod basic;
mod matmul;
mod normalize;
mod rows;

pub use basic::{add, add_scaled, scale};
pub use matmul::matmul;
pub use normalize::l2_normalize_rows;
pub use rows::{concat_rows, fanout, index_select_rows, mean_pool_rows, split_rows};
