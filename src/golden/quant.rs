//! Linear symmetric quantization without offset.
//!
//! A tensor with scale factor `s` and `L` levels maps the real interval `[-s, s]`
//! onto the integers `[-(L-1)/2, (L-1)/2]`; for `L = 255` that is `i8` without -128.

use serde::{Deserialize, Serialize};

use crate::error::{GoldenError, Result};
use crate::tensor::Tensor;

/// Number of quantization levels; always odd so the grid is symmetric around zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Levels(u32);

impl Levels {
    pub const DEFAULT: Levels = Levels(255);

    pub fn new(levels: u32) -> Result<Self> {
        if levels < 3 || levels % 2 == 0 {
            return Err(GoldenError::InvalidLevels(levels));
        }
        Ok(Levels(levels))
    }

    pub fn get(self) -> u32 { self.0 }

    /// `R = (L - 1) / 2`, the largest representable integer.
    pub fn half_range(self) -> f64 {
        ((self.0 - 1) / 2) as f64
    }
}

impl Default for Levels {
    fn default() -> Self { Levels::DEFAULT }
}

impl TryFrom<u32> for Levels {
    type Error = GoldenError;
    fn try_from(v: u32) -> Result<Self> { Levels::new(v) }
}

impl From<Levels> for u32 {
    fn from(l: Levels) -> u32 { l.0 }
}

#[inline]
pub fn quantize_value(x: f64, scale: f64, levels: Levels) -> i32 {
    let r = levels.half_range();
    let v = (x / scale).clamp(-1.0, 1.0) * r;
    v.round_ties_even() as i32
}

#[inline]
pub fn dequantize_value(q: i32, scale: f64, levels: Levels) -> f64 {
    q as f64 / levels.half_range() * scale
}

/// Clip `x / scale` to [-1, 1], stretch to the level range and round half to even.
pub fn quantize_to_int(x: &Tensor<f64>, scale: f64, levels: Levels) -> Tensor<i32> {
    x.map(|&v| quantize_value(v, scale, levels))
}

/// Exact inverse of [`quantize_to_int`] on the grid.
pub fn dequantize(x: &Tensor<i32>, scale: f64, levels: Levels) -> Tensor<f64> {
    x.map(|&q| dequantize_value(q, scale, levels))
}

/// Snap a real tensor onto the quantization grid, staying in real units.
pub fn quantize(x: &Tensor<f64>, scale: f64, levels: Levels) -> Tensor<f64> {
    dequantize(&quantize_to_int(x, scale, levels), scale, levels)
}
