use serde::Serialize;

use crate::error::{ensure_shape, Result};
use crate::tensor::Tensor;

/// Allowed deviation between the golden model and an optimized kernel.
pub const LAYER_TOLERANCE: i64 = 2;
/// Allowed deviation between the fused and the sequential layers 1 and 2.
pub const FUSED_TOLERANCE: i64 = 10;

const EPSILON: f64 = 1e-4;

/// Structured outcome of one result check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub passed: bool,
    pub max_error: i64,
    pub mean_error: f64,
}

/// Element-wise absolute difference of two integer tensors of the same shape.
pub fn compare(expected: &Tensor<i32>, actual: &Tensor<i32>, tolerance: i64) -> Result<Comparison> {
    ensure_shape("compare", expected.shape(), actual.shape())?;
    let mut max_error = 0i64;
    let mut total = 0i64;
    for (&e, &a) in expected.data().iter().zip(actual.data()) {
        let err = (a as i64 - e as i64).abs();
        max_error = max_error.max(err);
        total += err;
    }
    let mean_error = if expected.is_empty() { 0.0 } else { total as f64 / expected.len() as f64 };
    Ok(Comparison { passed: (max_error as f64) <= tolerance as f64 + EPSILON, max_error, mean_error })
}
