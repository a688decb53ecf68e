//! Backward operation trait for the gradient tape

/// A node in the recorded operation tape.
///
/// Implementations read the result tensor's gradient cell, accumulate
/// gradients into their input tensors, and recursively invoke the inputs'
/// backward ops. Operations with several consumers must only propagate once
/// every consumer has delivered its contribution (see `ops::fanout` and
/// `ops::split_rows`).
pub trait BackwardOp {
    /// Propagate gradients from the result to the operation's inputs
    fn backward(&self);
}
