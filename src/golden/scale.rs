//! Folding of scale factors and batch-norm parameters into integer factor/bias pairs.
//!
//! Notation: `x' = x / s_x * R` for every quantized quantity, `R = (L - 1) / 2`.
//! For `y = bn_s * (x * w) + bn_o` the quantized output is
//!
//! ```text
//!        x' * w' + bias                R * s_y                     bn_o * R^2
//!   y' = --------------,  factor = ----------------------,  bias = ----------------
//!           factor                  bn_s * s_x * s_w                bn_s * s_x * s_w
//! ```
//!
//! Without batch norm `bn_s = 1` and `bn_o = 0`. When the division happens after a
//! sum over `pool` values instead of after their mean, both terms carry a factor `pool`.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_shape, GoldenError, Result};
use crate::golden::quant::Levels;

/// Integer replacement of a real-valued affine rescale, `y = (x + bias) / factor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactorBias {
    Scalar { factor: i32, bias: i32 },
    PerChannel { factor: Vec<i32>, bias: Vec<i32> },
}

impl FactorBias {
    pub fn scalar(factor: i32) -> Result<Self> {
        Self::scalar_with_bias(factor, 0)
    }

    pub fn scalar_with_bias(factor: i32, bias: i32) -> Result<Self> {
        if factor == 0 { return Err(GoldenError::ZeroFactor(0.0)); }
        Ok(FactorBias::Scalar { factor, bias })
    }

    pub fn per_channel(factor: Vec<i32>, bias: Vec<i32>) -> Result<Self> {
        ensure_shape("factor/bias tables", &[factor.len()], &[bias.len()])?;
        if factor.iter().any(|&f| f == 0) { return Err(GoldenError::ZeroFactor(0.0)); }
        Ok(FactorBias::PerChannel { factor, bias })
    }

    /// Number of channels, `None` for a scalar pair that broadcasts.
    pub fn channels(&self) -> Option<usize> {
        match self {
            FactorBias::Scalar { .. } => None,
            FactorBias::PerChannel { factor, .. } => Some(factor.len()),
        }
    }

    /// `(factor, bias)` for channel `k`; a scalar pair answers for every channel.
    #[inline]
    pub fn get(&self, k: usize) -> (i32, i32) {
        match self {
            FactorBias::Scalar { factor, bias } => (*factor, *bias),
            FactorBias::PerChannel { factor, bias } => (factor[k], bias[k]),
        }
    }

    pub fn factors(&self) -> Vec<i32> {
        match self {
            FactorBias::Scalar { factor, .. } => vec![*factor],
            FactorBias::PerChannel { factor, .. } => factor.clone(),
        }
    }

    pub fn biases(&self) -> Vec<i32> {
        match self {
            FactorBias::Scalar { bias, .. } => vec![*bias],
            FactorBias::PerChannel { bias, .. } => bias.clone(),
        }
    }

    /// Number of stored integers (1 factor + 1 bias for a scalar pair).
    pub fn table_len(&self) -> usize {
        match self {
            FactorBias::Scalar { .. } => 2,
            FactorBias::PerChannel { factor, bias } => factor.len() + bias.len(),
        }
    }

    /// Multiply both factor and bias of channel `k` by `mult[k / group]`.
    ///
    /// Used to continue from an accumulator that was never divided by `mult`.
    pub fn compose(&self, mult: &[i32], group: usize, channels: usize) -> Result<Self> {
        if group == 0 || mult.len() * group != channels {
            return Err(GoldenError::InvalidConfig(format!(
                "cannot compose {} multipliers in groups of {} onto {} channels", mult.len(), group, channels
            )));
        }
        let mut factor = Vec::with_capacity(channels);
        let mut bias = Vec::with_capacity(channels);
        for k in 0..channels {
            let (f, b) = self.get(k);
            let m = mult[k / group] as i64;
            factor.push(to_i32(f as i64 * m)?);
            bias.push(to_i32(b as i64 * m)?);
        }
        FactorBias::per_channel(factor, bias)
    }
}

fn to_i32(v: i64) -> Result<i32> {
    i32::try_from(v).map_err(|_| GoldenError::FactorOverflow(v as f64))
}

fn check_scale(name: &'static str, value: f64) -> Result<f64> {
    if !(value.is_finite() && value > 0.0) {
        return Err(GoldenError::InvalidScale { name, value });
    }
    Ok(value)
}

fn check_pool(pool: u32) -> Result<f64> {
    if pool == 0 {
        return Err(GoldenError::InvalidConfig("pool multiplier must be at least 1".into()));
    }
    Ok(pool as f64)
}

/// Round half to even into an `i32`, rejecting values that do not fit.
fn round_to_i32(v: f64) -> Result<i32> {
    let r = v.round_ties_even();
    if !r.is_finite() || r < i32::MIN as f64 || r > i32::MAX as f64 {
        return Err(GoldenError::FactorOverflow(v));
    }
    Ok(r as i32)
}

fn nonzero(v: f64) -> Result<i32> {
    let f = round_to_i32(v)?;
    if f == 0 { return Err(GoldenError::ZeroFactor(v)); }
    Ok(f)
}

/// Division factor of a layer without batch norm.
pub fn div_factor(input_scale: f64, weight_scale: f64, output_scale: f64, levels: Levels, pool: u32) -> Result<i32> {
    let s_x = check_scale("input", input_scale)?;
    let s_w = check_scale("weight", weight_scale)?;
    let s_y = check_scale("output", output_scale)?;
    let pool = check_pool(pool)?;
    nonzero(s_y * levels.half_range() / (s_x * s_w) * pool)
}

/// Per-channel factor and bias of a layer followed by batch norm.
pub fn div_factor_batch_norm(
    input_scale: f64,
    weight_scale: f64,
    output_scale: f64,
    bn_scale: &[f64],
    bn_offset: &[f64],
    levels: Levels,
    pool: u32,
) -> Result<FactorBias> {
    let s_x = check_scale("input", input_scale)?;
    let s_w = check_scale("weight", weight_scale)?;
    let s_y = check_scale("output", output_scale)?;
    let pool = check_pool(pool)?;
    ensure_shape("batch norm scale/offset", &[bn_scale.len()], &[bn_offset.len()])?;
    let r = levels.half_range();

    let mut factor = Vec::with_capacity(bn_scale.len());
    let mut bias = Vec::with_capacity(bn_scale.len());
    for (&bn_s, &bn_o) in bn_scale.iter().zip(bn_offset) {
        let denom = bn_s * s_x * s_w;
        factor.push(nonzero(s_y * r / denom * pool)?);
        bias.push(round_to_i32(bn_o * r * r / denom * pool)?);
    }
    debug!("div_factor_batch_norm pool={} factor={:?} bias={:?}", pool, factor, bias);
    FactorBias::per_channel(factor, bias)
}
